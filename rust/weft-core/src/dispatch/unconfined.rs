//! The unconfined dispatcher and its per-thread event loop.
//!
//! Unconfined resumption continues on whatever thread performed the resume.
//! A cascade of resumptions (A resumes B, whose body resumes C, ...) would
//! otherwise nest stack frames without bound, so every thread carries an
//! event loop: the first unconfined task on a stack installs a queue and
//! drains it before returning; nested tasks are enqueued instead of run.
//!
//! The queue is strictly thread-local. Tasks never migrate between threads
//! here — that is the whole point of the unconfined strategy.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::context::CoroutineContext;

use super::{Dispatcher, Runnable};

thread_local! {
    static EVENT_LOOP: RefCell<Option<VecDeque<Runnable>>> = const { RefCell::new(None) };
}

/// Run `task` now, or enqueue it when an event loop above us on this thread's
/// stack is already draining.
pub(crate) fn run_or_enqueue(task: Runnable) {
    let mut task = Some(task);
    let enqueued = EVENT_LOOP.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_mut() {
            Some(queue) => {
                queue.push_back(task.take().unwrap());
                true
            }
            None => {
                *slot = Some(VecDeque::new());
                false
            }
        }
    });
    if enqueued {
        return;
    }
    // We installed the loop: run the first task, then drain whatever the
    // task (transitively) enqueued. The guard uninstalls on panic so a
    // poisoned loop cannot swallow later resumes on this thread.
    let _guard = LoopGuard;
    task.take().unwrap().run();
    while let Some(next) = EVENT_LOOP.with(|cell| cell.borrow_mut().as_mut().unwrap().pop_front()) {
        next.run();
    }
}

struct LoopGuard;

impl Drop for LoopGuard {
    fn drop(&mut self) {
        EVENT_LOOP.with(|cell| {
            let dropped = cell.borrow_mut().take();
            if let Some(queue) = dropped {
                if !queue.is_empty() {
                    tracing::warn!(
                        pending = queue.len(),
                        "unconfined event loop unwound with pending tasks"
                    );
                }
            }
        });
    }
}

/// Dispatcher that never changes threads.
pub struct UnconfinedDispatcher {
    _private: (),
}

impl UnconfinedDispatcher {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for UnconfinedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for UnconfinedDispatcher {
    fn name(&self) -> &str {
        "weft-unconfined"
    }

    fn needs_dispatch(&self, _context: &CoroutineContext) -> bool {
        false
    }

    fn dispatch(&self, _context: &CoroutineContext, task: Runnable) {
        run_or_enqueue(task);
    }

    fn dispatch_yield(&self, _context: &CoroutineContext, task: Runnable) {
        run_or_enqueue(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn nested_tasks_run_iteratively_in_order() {
        thread_local! {
            static ORDER: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
            static DEPTH: Cell<u32> = const { Cell::new(0) };
            static MAX_DEPTH: Cell<u32> = const { Cell::new(0) };
        }

        fn record(tag: u32, body: impl FnOnce()) {
            DEPTH.with(|d| d.set(d.get() + 1));
            MAX_DEPTH.with(|m| DEPTH.with(|d| m.set(m.get().max(d.get()))));
            ORDER.with(|o| o.borrow_mut().push(tag));
            body();
            DEPTH.with(|d| d.set(d.get() - 1));
        }

        run_or_enqueue(Runnable::new(|| {
            record(1, || {
                run_or_enqueue(Runnable::new(|| {
                    record(2, || {
                        run_or_enqueue(Runnable::new(|| record(4, || {})));
                    });
                }));
                run_or_enqueue(Runnable::new(|| record(3, || {})));
            });
        }));

        ORDER.with(|o| assert_eq!(*o.borrow(), vec![1, 2, 3, 4]));
        // Nested tasks were deferred, not run recursively.
        MAX_DEPTH.with(|m| assert_eq!(m.get(), 1));
    }

    #[test]
    fn loop_uninstalls_after_drain() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        run_or_enqueue(Runnable::new(|| {}));
        // A second top-level task installs a fresh loop and runs inline.
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_task = Arc::clone(&ran);
        EVENT_LOOP.with(|cell| assert!(cell.borrow().is_none()));
        run_or_enqueue(Runnable::new(move || ran_in_task.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }
}
