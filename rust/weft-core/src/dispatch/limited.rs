//! Limited-parallelism view over another dispatcher.
//!
//! The view owns a FIFO of waiting tasks and a count of in-flight workers.
//! At most `parallelism` workers run on the underlying dispatcher at any
//! moment; each worker drains the FIFO, re-dispatching itself periodically so
//! a long queue cannot monopolise an underlying thread.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::context::CoroutineContext;

use super::{Dispatcher, Runnable};

/// How many queued tasks one worker slice runs before re-dispatching itself.
const WORKER_BATCH: usize = 16;

struct State {
    queue: VecDeque<Runnable>,
    running: usize,
}

struct Inner {
    dispatcher: Arc<dyn Dispatcher>,
    parallelism: usize,
    state: Mutex<State>,
}

impl Inner {
    /// Start a worker when a task is queued and a slot is free.
    fn start_worker_if_needed(self: &Arc<Self>, context: &CoroutineContext) {
        {
            let mut state = self.state.lock().unwrap();
            if state.running >= self.parallelism || state.queue.is_empty() {
                return;
            }
            state.running += 1;
        }
        self.dispatch_worker(context);
    }

    fn dispatch_worker(self: &Arc<Self>, context: &CoroutineContext) {
        let inner = Arc::clone(self);
        let context = context.clone();
        self.dispatcher
            .dispatch(&context.clone(), Runnable::new(move || inner.worker(&context)));
    }

    /// Run up to [`WORKER_BATCH`] queued tasks, then either retire the slot
    /// or hand the rest to a fresh dispatch.
    fn worker(self: &Arc<Self>, context: &CoroutineContext) {
        for _ in 0..WORKER_BATCH {
            let task = {
                let mut state = self.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        state.running -= 1;
                        return;
                    }
                }
            };
            task.run();
        }
        // Batch exhausted with work possibly remaining: keep the slot but let
        // the underlying dispatcher interleave other tasks.
        let retire = {
            let mut state = self.state.lock().unwrap();
            if state.queue.is_empty() {
                state.running -= 1;
                true
            } else {
                false
            }
        };
        if !retire {
            self.dispatch_worker(context);
        }
    }
}

/// A wrapper admitting at most `parallelism` concurrent tasks.
pub struct LimitedDispatcher {
    name: String,
    inner: Arc<Inner>,
}

impl LimitedDispatcher {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, parallelism: usize) -> Self {
        let name = format!("{}-limited-{}", dispatcher.name(), parallelism.max(1));
        Self {
            name,
            inner: Arc::new(Inner {
                dispatcher,
                parallelism: parallelism.max(1),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    running: 0,
                }),
            }),
        }
    }
}

impl Dispatcher for LimitedDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, context: &CoroutineContext, task: Runnable) {
        self.inner.state.lock().unwrap().queue.push_back(task);
        self.inner.start_worker_if_needed(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::PoolDispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn never_exceeds_parallelism() {
        let pool = Arc::new(PoolDispatcher::new(4, "test-lim-pool"));
        let limited = LimitedDispatcher::new(pool, 2);
        let ctx = CoroutineContext::empty();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..32 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            limited.dispatch(
                &ctx,
                Runnable::new(move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                }),
            );
        }
        for _ in 0..32 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn tasks_run_in_fifo_order_with_parallelism_one() {
        let pool = Arc::new(PoolDispatcher::new(4, "test-lim-fifo"));
        let limited = LimitedDispatcher::new(pool, 1);
        let ctx = CoroutineContext::empty();

        let (tx, rx) = mpsc::channel();
        for i in 0..40 {
            let tx = tx.clone();
            limited.dispatch(&ctx, Runnable::new(move || tx.send(i).unwrap()));
        }
        let seen: Vec<i32> = (0..40)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
    }
}
