//! End-to-end structured-concurrency behaviour: lifecycle containment,
//! supervision, start modes, dispatcher switching, prompt cancellation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_core::{
    coroutine_scope, current_context, delay, run_blocking, run_blocking_with, supervisor_scope,
    with_context, Capacity, Channel, CoroutineContext, CoroutineScope, Failure, FailureHandler,
    LaunchOptions, Start,
};

#[test]
fn cancelling_a_scope_terminates_the_whole_tree() {
    // A launches B, which suspends forever; cancelling the scope terminates
    // both, join returns, and nothing reaches the failure handler.
    let reported = Arc::new(AtomicUsize::new(0));
    let reported_in_handler = Arc::clone(&reported);
    let context = CoroutineContext::empty().with(FailureHandler::new(move |_, _| {
        reported_in_handler.fetch_add(1, Ordering::SeqCst);
    }));

    run_blocking_with(context, async {
        // A detached scope job under the root, so cancelling it does not
        // cancel the blocking coroutine itself.
        let scope_job = weft_core::JobHandle::new_job(weft_core::current_job().as_ref());
        let scope =
            CoroutineScope::new(current_context().unwrap().with_job(scope_job));
        let b_started = Arc::new(AtomicBool::new(false));
        let b_terminated = Arc::new(AtomicBool::new(false));

        let b_started_in_a = Arc::clone(&b_started);
        let b_terminated_in_a = Arc::clone(&b_terminated);
        let a = scope.launch(async move {
            coroutine_scope(|inner| async move {
                let started = b_started_in_a;
                let terminated = b_terminated_in_a;
                let b = inner.launch(async move {
                    started.store(true, Ordering::SeqCst);
                    delay(Duration::from_secs(3600)).await?;
                    Ok(())
                });
                b.invoke_on_completion(move |_| terminated.store(true, Ordering::SeqCst));
                Ok(())
            })
            .await
        });

        delay(Duration::from_millis(20)).await?;
        assert!(b_started.load(Ordering::SeqCst));

        scope.cancel();
        a.join().await?;
        scope.job().join().await?;
        assert!(b_terminated.load(Ordering::SeqCst));
        assert!(scope.job().is_completed());
        Ok(())
    })
    .unwrap();

    assert_eq!(reported.load(Ordering::SeqCst), 0);
}

#[test]
fn supervisor_isolates_a_failing_child() {
    // A fails early; B runs to completion; only A's failure reaches the
    // handler.
    let reports: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let reports_in_handler = Arc::clone(&reports);
    let context = CoroutineContext::empty().with(FailureHandler::new(move |_, failure| {
        reports_in_handler
            .lock()
            .unwrap()
            .push(failure.message().to_string());
    }));

    let b_completed = Arc::new(AtomicBool::new(false));
    let b_completed_in_body = Arc::clone(&b_completed);

    run_blocking_with(context, async move {
        supervisor_scope(|scope| async move {
            scope.launch(async {
                delay(Duration::from_millis(10)).await?;
                Err(Failure::app("a-failed"))
            });
            let b_flag = b_completed_in_body;
            scope.launch(async move {
                delay(Duration::from_millis(120)).await?;
                b_flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        })
        .await
    })
    .unwrap();

    assert!(b_completed.load(Ordering::SeqCst));
    assert_eq!(*reports.lock().unwrap(), vec!["a-failed".to_string()]);
}

#[test]
fn join_waits_for_transitive_children() {
    run_blocking(async {
        let grandchild_done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&grandchild_done);
        coroutine_scope(|scope| async move {
            scope.launch(async move {
                coroutine_scope(|inner| async move {
                    inner.launch(async move {
                        delay(Duration::from_millis(40)).await?;
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok(())
                })
                .await
            });
            Ok(())
        })
        .await?;
        // The scope returned: every transitively-launched child is done.
        assert!(grandchild_done.load(Ordering::SeqCst));
        Ok(())
    })
    .unwrap();
}

#[test]
fn tasks_from_one_coroutine_run_in_dispatch_order() {
    run_blocking(async {
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let order_outer = Arc::clone(&order);
        coroutine_scope(|scope| async move {
            for tag in 0..8 {
                let order = Arc::clone(&order);
                scope.launch(async move {
                    order.lock().unwrap().push(tag);
                    Ok(())
                });
            }
            Ok(())
        })
        .await?;
        assert_eq!(*order_outer.lock().unwrap(), (0..8).collect::<Vec<_>>());
        Ok(())
    })
    .unwrap();
}

#[test]
fn lazy_coroutine_runs_only_when_started() {
    run_blocking(async {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_body = Arc::clone(&ran);
        let job = coroutine_scope(|scope| async move {
            let job = scope.launch_opts(
                LaunchOptions::new().start(Start::Lazy),
                async move {
                    ran_in_body.store(true, Ordering::SeqCst);
                    Ok(())
                },
            );
            delay(Duration::from_millis(20)).await?;
            assert!(!job.is_active());
            // join() starts the lazy coroutine and waits for it.
            job.join().await?;
            Ok(job)
        })
        .await?;
        assert!(job.is_completed());
        assert!(ran.load(Ordering::SeqCst));
        Ok(())
    })
    .unwrap();
}

#[test]
fn undispatched_start_runs_to_first_suspension_inline() {
    run_blocking(async {
        coroutine_scope(|scope| async move {
            let phase = Arc::new(AtomicUsize::new(0));
            let phase_in_body = Arc::clone(&phase);
            scope.launch_opts(
                LaunchOptions::new().start(Start::Undispatched),
                async move {
                    phase_in_body.store(1, Ordering::SeqCst);
                    delay(Duration::from_millis(5)).await?;
                    phase_in_body.store(2, Ordering::SeqCst);
                    Ok(())
                },
            );
            // The body already ran up to its first suspension.
            assert_eq!(phase.load(Ordering::SeqCst), 1);
            Ok(())
        })
        .await
    })
    .unwrap();
}

#[test]
fn atomic_start_survives_cancellation_before_the_body() {
    run_blocking(async {
        coroutine_scope(|scope| async move {
            let default_ran = Arc::new(AtomicBool::new(false));
            let atomic_ran = Arc::new(AtomicBool::new(false));

            let default_flag = Arc::clone(&default_ran);
            let default_job = scope.launch(async move {
                default_flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            let atomic_flag = Arc::clone(&atomic_ran);
            let atomic_job = scope.launch_opts(
                LaunchOptions::new().start(Start::Atomic),
                async move {
                    atomic_flag.store(true, Ordering::SeqCst);
                    delay(Duration::from_secs(3600)).await?;
                    Ok(())
                },
            );

            // Cancel both before the event loop ran either body.
            default_job.cancel();
            atomic_job.cancel();
            default_job.join().await?;
            atomic_job.join().await?;

            assert!(!default_ran.load(Ordering::SeqCst));
            // Atomic start: the body began despite the early cancel, and was
            // then cancelled at its first suspension.
            assert!(atomic_ran.load(Ordering::SeqCst));
            Ok(())
        })
        .await
    })
    .unwrap();
}

#[test]
fn with_context_switches_dispatcher_and_returns() {
    run_blocking(async {
        let main_thread = std::thread::current().id();
        let io = weft_core::io_dispatcher();
        let block_thread = with_context(
            CoroutineContext::empty().with_dispatcher(io),
            async move { Ok(std::thread::current().id()) },
        )
        .await?;
        assert_ne!(block_thread, main_thread);
        // Back on the blocking event loop afterwards.
        assert_eq!(std::thread::current().id(), main_thread);
        Ok(())
    })
    .unwrap();
}

#[test]
fn prompt_cancellation_discards_a_resumed_value() {
    // Cancel lands after the channel hand-off resumed the receiver but
    // before its task was polled: the receiver must observe cancellation and
    // the value must be re-routed through the undelivered hook.
    let undelivered: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let undelivered_in_hook = Arc::clone(&undelivered);

    run_blocking(async move {
        coroutine_scope(|scope| async move {
            let ch: Channel<i32> = Channel::with_options(
                Capacity::Rendezvous,
                weft_core::Overflow::Suspend,
                Some(Arc::new(move |v: i32| {
                    undelivered_in_hook.lock().unwrap().push(v)
                })),
            );
            let observed = Arc::new(AtomicBool::new(false));
            let observed_in_body = Arc::clone(&observed);
            let receiver_ch = ch.clone();
            let receiver = scope.launch(async move {
                let _value = receiver_ch.receive().await?;
                observed_in_body.store(true, Ordering::SeqCst);
                Ok(())
            });
            delay(Duration::from_millis(10)).await?;

            // Hand the value over (resumes the parked receiver), then cancel
            // before the event loop can poll it.
            ch.try_send(42).expect("parked receiver takes the value");
            receiver.cancel();
            receiver.join().await?;

            assert!(!observed.load(Ordering::SeqCst));
            let outcome = receiver.completion_outcome().unwrap();
            assert!(outcome.unwrap_err().is_cancellation());
            Ok(())
        })
        .await
    })
    .unwrap();

    assert_eq!(*undelivered.lock().unwrap(), vec![42]);
}

#[test]
fn idempotent_cancel_keeps_first_cause() {
    run_blocking(async {
        coroutine_scope(|scope| async move {
            let job = scope.launch(async {
                delay(Duration::from_secs(3600)).await?;
                Ok(())
            });
            delay(Duration::from_millis(10)).await?;
            let first = Failure::app("first-cause");
            job.cancel_with(first.clone());
            job.cancel_with(Failure::app("second-cause"));
            job.cancel_with(Failure::app("third-cause"));
            job.join().await?;
            assert!(!job.is_active());
            let outcome = job.completion_outcome().unwrap().unwrap_err();
            assert!(outcome.same(&first));
            assert_eq!(first.suppressed().len(), 2);
            Ok(())
        })
        .await
    })
    .unwrap();
}

#[test]
fn failing_launch_cancels_siblings_and_rethrows_at_the_scope() {
    run_blocking(async {
        let sibling_cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&sibling_cancelled);
        let result: Result<(), Failure> = coroutine_scope(|scope| async move {
            scope.launch(async move {
                let r = delay(Duration::from_secs(3600)).await;
                if r.is_err() {
                    flag.store(true, Ordering::SeqCst);
                }
                r
            });
            scope.launch(async {
                delay(Duration::from_millis(10)).await?;
                Err(Failure::app("worker-exploded"))
            });
            Ok(())
        })
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.message(), "worker-exploded");
        assert!(sibling_cancelled.load(Ordering::SeqCst));
        Ok(())
    })
    .unwrap();
}

#[test]
fn deferred_surfaces_value_and_failure_through_await() {
    run_blocking(async {
        coroutine_scope(|scope| async move {
            let ok = scope.spawn_deferred(async {
                delay(Duration::from_millis(5)).await?;
                Ok(7)
            });
            assert_eq!(ok.await_value().await?, 7);
            assert_eq!(ok.await_value().await?, 7);
            Ok(())
        })
        .await?;

        // A failing deferred rethrows at await and does not take the scope
        // down when supervised.
        supervisor_scope(|scope| async move {
            let failing: weft_core::Deferred<i32> =
                scope.spawn_deferred(async { Err(Failure::app("deferred-boom")) });
            let failure = failing.await_value().await.unwrap_err();
            assert_eq!(failure.message(), "deferred-boom");
            Ok(())
        })
        .await
    })
    .unwrap();
}

#[test]
fn yield_now_interleaves_equal_priority_coroutines() {
    run_blocking(async {
        let order: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let order_outer = Arc::clone(&order);
        coroutine_scope(|scope| async move {
            for id in 0..2 {
                let order = Arc::clone(&order);
                scope.launch(async move {
                    for round in 0..3 {
                        order.lock().unwrap().push((id, round));
                        weft_core::yield_now().await?;
                    }
                    Ok(())
                });
            }
            Ok(())
        })
        .await?;
        let order = order_outer.lock().unwrap();
        // Strict alternation on the single-threaded loop.
        assert_eq!(
            *order,
            vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)]
        );
        Ok(())
    })
    .unwrap();
}
