//! End-to-end flow pipelines: operator fusion equivalence, dispatcher
//! hopping, channel round-trips, and hot-flow composition.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_core::channel::{Capacity, Channel};
use weft_core::context::CoroutineContext;
use weft_core::dispatch::default_dispatcher;
use weft_core::scope::{coroutine_scope, run_blocking};
use weft_core::time::delay;
use weft_flow::{flow, flow_of, MutableSharedFlow, MutableStateFlow, Overflow, ReceiveAsFlow};

#[test]
fn buffered_dispatcher_pipeline_preserves_order() {
    // flow_on + buffer(8) + map over five values: one fused channel stage,
    // values arrive mapped and in order.
    run_blocking(async {
        let values = flow_of(1..=5)
            .flow_on(CoroutineContext::empty().with_dispatcher(default_dispatcher()))
            .buffer(8)
            .map(|v| v * 2)
            .to_list()
            .await?;
        assert_eq!(values, vec![2, 4, 6, 8, 10]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn fused_and_unfused_buffers_emit_the_same_sequence() {
    run_blocking(async {
        let source = flow_of(1..=20);
        let fused = source.buffer(2).buffer(3).to_list().await?;
        let unfused = source.buffer(5).to_list().await?;
        let plain = source.to_list().await?;
        assert_eq!(fused, plain);
        assert_eq!(unfused, plain);
        Ok(())
    })
    .unwrap();
}

#[test]
fn fused_and_unfused_flow_on_emit_the_same_sequence() {
    run_blocking(async {
        let d = CoroutineContext::empty().with_dispatcher(default_dispatcher());
        let source = flow_of(1..=20);
        let twice = source.flow_on(d.clone()).flow_on(d.clone()).to_list().await?;
        let once = source.flow_on(d).to_list().await?;
        assert_eq!(twice, once);
        assert_eq!(once, (1..=20).collect::<Vec<_>>());
        Ok(())
    })
    .unwrap();
}

#[test]
fn conflated_pipeline_keeps_latest_and_last() {
    run_blocking(async {
        // A fast producer against a slow collector: intermediate values may
        // be conflated away, but order is preserved and the final value
        // always arrives.
        let values = flow_of(1..=10)
            .buffer(3)
            .conflate()
            .on_each(|_| Ok(()))
            .to_list()
            .await?;
        assert!(!values.is_empty());
        assert_eq!(*values.last().unwrap(), 10);
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(values, sorted);
        Ok(())
    })
    .unwrap();
}

#[test]
fn channel_to_flow_round_trip_observes_sends_in_order() {
    run_blocking(async {
        let ch = Channel::new(Capacity::Buffered(16));
        for v in 0..8 {
            ch.send(v).await?;
        }
        ch.close();
        let observed = ch.receive_as_flow().to_list().await?;
        assert_eq!(observed, (0..8).collect::<Vec<_>>());
        Ok(())
    })
    .unwrap();
}

#[test]
fn launch_in_collects_concurrently() {
    run_blocking(async {
        coroutine_scope(|scope| async move {
            let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
            let seen_in_flow = Arc::clone(&seen);
            let job = flow(move |sink| {
                let seen = Arc::clone(&seen_in_flow);
                async move {
                    for v in 0..3 {
                        delay(Duration::from_millis(5)).await?;
                        seen.lock().unwrap().push(v);
                        sink.emit(v).await?;
                    }
                    Ok(())
                }
            })
            .launch_in(&scope);
            job.join().await?;
            assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
            Ok(())
        })
        .await
    })
    .unwrap();
}

#[test]
fn shared_flow_feeds_a_cold_pipeline() {
    run_blocking(async {
        coroutine_scope(|scope| async move {
            let shared = MutableSharedFlow::new(1, 4, Overflow::Suspend);
            let pipeline = shared.as_flow().filter(|v| v % 2 == 0).map(|v| v * 10);
            let collected = scope.spawn_deferred(async move {
                pipeline.take(2).to_list().await
            });
            delay(Duration::from_millis(10)).await?;
            for v in 1..=4 {
                shared.emit(v).await?;
            }
            assert_eq!(collected.await_value().await?, vec![20, 40]);
            Ok(())
        })
        .await
    })
    .unwrap();
}

#[test]
fn state_flow_drives_a_debounced_view() {
    run_blocking(async {
        coroutine_scope(|scope| async move {
            let state = MutableStateFlow::new(0);
            let view = state.as_flow().debounce(Duration::from_millis(25));
            let collected = scope.spawn_deferred(async move {
                view.take(1).to_list().await
            });
            delay(Duration::from_millis(5)).await?;
            // A burst of updates inside the window: only the settled value
            // survives the debounce.
            state.set(1);
            delay(Duration::from_millis(5)).await?;
            state.set(2);
            delay(Duration::from_millis(5)).await?;
            state.set(3);
            assert_eq!(collected.await_value().await?, vec![3]);
            Ok(())
        })
        .await
    })
    .unwrap();
}
