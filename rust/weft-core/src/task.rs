//! Coroutine tasks — the glue between futures, jobs, and dispatchers.
//!
//! A [`Task`] owns a coroutine's body future, its job, and its context. Waking
//! the task asks the context's dispatcher whether a dispatch is needed: a
//! confined dispatcher enqueues a poll slice, the unconfined strategy runs it
//! on the current thread through the per-thread event loop.
//!
//! While a slice is polled the task's context is pushed onto a thread-local
//! stack, which is how suspension primitives find the ambient job and
//! dispatcher without threading them through every call. Thread-context
//! elements are materialised around each slice and restored afterwards, even
//! when the body panics.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};

use crate::context::CoroutineContext;
use crate::dispatch::{dispatch_safely, run_or_enqueue, Dispatcher, Runnable};
use crate::error::Failure;
use crate::job::JobHandle;
use crate::probes;

// ---------------------------------------------------------------------------
// Ambient context
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: RefCell<Vec<CoroutineContext>> = const { RefCell::new(Vec::new()) };
}

/// The context of the coroutine currently running on this thread, if any.
pub fn current_context() -> Option<CoroutineContext> {
    CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// The job of the coroutine currently running on this thread, if any.
pub fn current_job() -> Option<JobHandle> {
    current_context().and_then(|ctx| ctx.job())
}

/// Run `f` with `context` installed as the ambient context, materialising its
/// thread-context elements around the call.
pub(crate) fn with_current_context<R>(context: &CoroutineContext, f: impl FnOnce() -> R) -> R {
    struct Frame {
        saved: Vec<(usize, Box<dyn std::any::Any + Send>)>,
        context: CoroutineContext,
        elements: Vec<Arc<dyn crate::context::ContextElement>>,
    }

    impl Drop for Frame {
        fn drop(&mut self) {
            // Restore in reverse installation order; runs on panic too.
            for (index, saved) in self.saved.drain(..).rev() {
                if let Some(thread_element) = self.elements[index].as_thread_element() {
                    thread_element.restore_thread_context(&self.context, saved);
                }
            }
            CURRENT.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }

    CURRENT.with(|stack| stack.borrow_mut().push(context.clone()));
    let mut frame = Frame {
        saved: Vec::new(),
        context: context.clone(),
        elements: context.thread_elements(),
    };
    for index in 0..frame.elements.len() {
        if let Some(thread_element) = frame.elements[index].as_thread_element() {
            let saved = thread_element.update_thread_context(context);
            frame.saved.push((index, saved));
        }
    }
    f()
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub(crate) struct Task {
    context: CoroutineContext,
    job: JobHandle,
    dispatcher: Arc<dyn Dispatcher>,
    future: Mutex<Option<BoxFuture<'static, Result<(), Failure>>>>,
    /// Coalesces wakes: set while a poll slice is queued.
    scheduled: AtomicBool,
    /// The body has been polled at least once.
    body_started: AtomicBool,
    /// Atomic start: the first slice runs even if the job was cancelled
    /// before the body began.
    atomic_start: bool,
}

impl Task {
    /// Create a task. `context` must already carry the job and dispatcher
    /// elements for this coroutine.
    pub(crate) fn new(
        context: CoroutineContext,
        job: JobHandle,
        dispatcher: Arc<dyn Dispatcher>,
        body: impl Future<Output = Result<(), Failure>> + Send + 'static,
        atomic_start: bool,
    ) -> Arc<Task> {
        let task = Arc::new(Task {
            context,
            job,
            dispatcher,
            future: Mutex::new(Some(Box::pin(body))),
            scheduled: AtomicBool::new(false),
            body_started: AtomicBool::new(false),
            atomic_start,
        });
        probes::on_created();
        task
    }

    /// Queue one poll slice through the dispatcher (or the unconfined loop).
    pub(crate) fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = Arc::clone(self);
        let runnable = Runnable::new(move || {
            task.scheduled.store(false, Ordering::Release);
            task.step();
        });
        if self.dispatcher.needs_dispatch(&self.context) {
            dispatch_safely(self.dispatcher.as_ref(), &self.context, runnable);
        } else {
            run_or_enqueue(runnable);
        }
    }

    /// Run one poll slice inline on the current thread (undispatched start).
    pub(crate) fn run_undispatched(self: &Arc<Self>) {
        let task = Arc::clone(self);
        run_or_enqueue(Runnable::new(move || task.step()));
    }

    fn step(self: &Arc<Self>) {
        let mut slot = self.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            // Completed; a stale wake.
            return;
        };

        if !self.body_started.swap(true, Ordering::AcqRel)
            && !self.atomic_start
            && self.job.is_cancelled()
        {
            // Cancelled before the body ever ran.
            let cause = self
                .job
                .cancellation_cause()
                .unwrap_or_else(Failure::cancelled);
            *slot = None;
            drop(slot);
            self.job.complete_with(Err(cause));
            return;
        }

        probes::on_resumed();
        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        let polled = with_current_context(&self.context, || {
            catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        });
        match polled {
            Ok(Poll::Pending) => {
                probes::on_suspended();
            }
            Ok(Poll::Ready(outcome)) => {
                let outcome = match outcome {
                    Err(failure) => Err(match self.context.name() {
                        Some(name) => failure.with_origin(&name),
                        None => failure,
                    }),
                    ok => ok,
                };
                *slot = None;
                drop(slot);
                self.job.complete_with(outcome);
            }
            Err(payload) => {
                *slot = None;
                drop(slot);
                self.job.complete_with(Err(Failure::panicked(payload)));
            }
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

// ---------------------------------------------------------------------------
// ContextFuture
// ---------------------------------------------------------------------------

/// Wrap a future so that every poll runs under `context` — the mechanism
/// behind scope frames and same-dispatcher context switches.
#[must_use = "futures do nothing unless awaited"]
pub(crate) struct ContextFuture<F> {
    context: CoroutineContext,
    inner: Pin<Box<F>>,
}

impl<F: Future> ContextFuture<F> {
    pub(crate) fn new(context: CoroutineContext, inner: F) -> Self {
        Self {
            context,
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for ContextFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let inner = this.inner.as_mut();
        with_current_context(&this.context, || inner.poll(cx))
    }
}

impl<F> Unpin for ContextFuture<F> {}

// ---------------------------------------------------------------------------
// yield_now
// ---------------------------------------------------------------------------

/// Yield the current coroutine: reschedule it at the back of its dispatcher
/// queue so peers get a chance to run. Observes cancellation like any other
/// suspension point.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), Failure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(job) = current_job() {
            if let Err(failure) = job.ensure_active() {
                return Poll::Ready(Err(failure));
            }
        }
        if self.yielded {
            Poll::Ready(Ok(()))
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextElement, ElementKey, ThreadContextElement, TypedElement};
    use crate::scope::{run_blocking_with, with_context};
    use std::any::Any;
    use std::cell::RefCell;

    thread_local! {
        static TENANT: RefCell<Option<String>> = const { RefCell::new(None) };
    }

    /// A thread-local carrier in the style of an MDC tag: the value follows
    /// the coroutine across dispatched slices.
    #[derive(Clone)]
    struct Tenant(String);

    struct TenantKey;

    impl ContextElement for Tenant {
        fn key(&self) -> ElementKey {
            ElementKey::of::<TenantKey>()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_thread_element(&self) -> Option<&dyn ThreadContextElement> {
            Some(self)
        }
    }

    impl TypedElement for Tenant {
        fn element_key() -> ElementKey {
            ElementKey::of::<TenantKey>()
        }
    }

    impl ThreadContextElement for Tenant {
        fn update_thread_context(&self, _context: &CoroutineContext) -> Box<dyn Any + Send> {
            let saved = TENANT.with(|slot| slot.borrow_mut().replace(self.0.clone()));
            Box::new(saved)
        }

        fn restore_thread_context(&self, _context: &CoroutineContext, saved: Box<dyn Any + Send>) {
            let saved = *saved
                .downcast::<Option<String>>()
                .expect("tenant save state round-trips");
            TENANT.with(|slot| *slot.borrow_mut() = saved);
        }
    }

    fn current_tenant() -> Option<String> {
        TENANT.with(|slot| slot.borrow().clone())
    }

    #[test]
    fn thread_context_element_follows_the_coroutine() {
        let context = CoroutineContext::of(Tenant("acme".to_string()));
        run_blocking_with(context, async {
            assert_eq!(current_tenant(), Some("acme".to_string()));
            crate::time::delay(std::time::Duration::from_millis(5)).await?;
            // Still installed on the slice after a timed resumption.
            assert_eq!(current_tenant(), Some("acme".to_string()));
            Ok(())
        })
        .unwrap();
        // Restored once the coroutine left the thread.
        assert_eq!(current_tenant(), None);
    }

    #[test]
    fn with_context_overrides_a_thread_element() {
        let context = CoroutineContext::of(Tenant("outer".to_string()));
        run_blocking_with(context, async {
            let inner = with_context(
                CoroutineContext::of(Tenant("inner".to_string())),
                async { Ok(current_tenant()) },
            )
            .await?;
            assert_eq!(inner, Some("inner".to_string()));
            assert_eq!(current_tenant(), Some("outer".to_string()));
            Ok(())
        })
        .unwrap();
    }
}
