//! Work-stealing thread pool behind the default dispatcher.
//!
//! The layout mirrors the classic injector/worker/stealer split: a global
//! FIFO injector receives dispatched tasks, each worker owns a local FIFO
//! deque, and idle workers steal from peers before parking. Dispatched tasks
//! always enter through the injector, which preserves FIFO hand-off from any
//! one producer.
//!
//! Parking uses a mutex/condvar pair: a worker re-checks all queues while
//! holding the sleeper lock before waiting, and producers take the same lock
//! after pushing, so a wakeup can never be lost between the check and the
//! wait.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_deque::{Injector, Stealer, Worker};

use crate::context::CoroutineContext;
use crate::error::Failure;

use super::{Dispatcher, Runnable};

struct Shared {
    injector: Injector<Runnable>,
    stealers: Vec<Stealer<Runnable>>,
    sleepers: Mutex<usize>,
    wakeup: Condvar,
}

impl Shared {
    /// Try every source once: the local deque, then the injector in batches,
    /// then each peer.
    fn find_task(&self, local: &Worker<Runnable>) -> Option<Runnable> {
        if let Some(task) = local.pop() {
            return Some(task);
        }
        loop {
            match self.injector.steal_batch_and_pop(local) {
                crossbeam_deque::Steal::Success(task) => return Some(task),
                crossbeam_deque::Steal::Empty => break,
                crossbeam_deque::Steal::Retry => continue,
            }
        }
        for stealer in &self.stealers {
            loop {
                match stealer.steal() {
                    crossbeam_deque::Steal::Success(task) => return Some(task),
                    crossbeam_deque::Steal::Empty => break,
                    crossbeam_deque::Steal::Retry => continue,
                }
            }
        }
        None
    }

    fn notify(&self) {
        let sleepers = self.sleepers.lock().unwrap();
        if *sleepers > 0 {
            self.wakeup.notify_one();
        }
    }
}

/// A fixed-size work-stealing pool dispatcher.
///
/// The two shared instances ([`default_dispatcher`](super::default_dispatcher)
/// and pools created by integrations) are long-lived: workers run for the
/// process lifetime.
pub struct PoolDispatcher {
    name: String,
    shared: Arc<Shared>,
}

impl PoolDispatcher {
    /// Spawn a pool with `parallelism` workers named `<name>-worker-<i>`.
    pub fn new(parallelism: usize, name: &str) -> Self {
        let parallelism = parallelism.max(1);
        let workers: Vec<Worker<Runnable>> = (0..parallelism).map(|_| Worker::new_fifo()).collect();
        let stealers = workers.iter().map(|w| w.stealer()).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            sleepers: Mutex::new(0),
            wakeup: Condvar::new(),
        });
        for (index, local) in workers.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(shared, local))
                .expect("failed to spawn pool worker thread");
        }
        Self {
            name: name.to_string(),
            shared,
        }
    }
}

fn worker_loop(shared: Arc<Shared>, local: Worker<Runnable>) {
    loop {
        if let Some(task) = shared.find_task(&local) {
            run_task(task);
            continue;
        }
        let mut sleepers = shared.sleepers.lock().unwrap();
        // Re-check while holding the sleeper lock: a producer that pushed
        // before we took the lock is now visible, and one that pushes after
        // will block on the lock until we are counted as asleep.
        if let Some(task) = shared.find_task(&local) {
            drop(sleepers);
            run_task(task);
            continue;
        }
        *sleepers += 1;
        let guard = shared.wakeup.wait(sleepers).unwrap();
        sleepers = guard;
        *sleepers -= 1;
        drop(sleepers);
    }
}

fn run_task(task: Runnable) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
        let failure = Failure::panicked(payload);
        tracing::error!(failure = %failure, "pool task panicked");
    }
}

impl Dispatcher for PoolDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, _context: &CoroutineContext, task: Runnable) {
        self.shared.injector.push(task);
        self.shared.notify();
    }

    fn dispatch_yield(&self, context: &CoroutineContext, task: Runnable) {
        // The injector is the shared FIFO back; a yielded task never lands in
        // a local fast-path slot, so same-worker peers cannot be starved.
        self.dispatch(context, task);
    }
}
