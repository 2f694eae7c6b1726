//! On-demand thread pool for blocking work.
//!
//! Unlike the compute pool, the I/O dispatcher does not keep a fixed worker
//! set. Threads are created when a task arrives and no worker is idle, up to
//! a cap well above the CPU count; a worker that sits idle past the
//! keep-alive period retires. This keeps the pool at zero threads when no
//! blocking work is in flight.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::context::CoroutineContext;
use crate::error::Failure;

use super::{Dispatcher, Runnable};

const KEEP_ALIVE: Duration = Duration::from_secs(30);

struct Shared {
    queue: Receiver<Runnable>,
    /// Workers currently alive (running or idle).
    workers: AtomicUsize,
    /// Workers currently blocked on the queue.
    idle: AtomicUsize,
}

/// A pool permitting many more threads than CPUs, for blocking I/O.
pub struct IoDispatcher {
    name: String,
    max_workers: usize,
    sender: Sender<Runnable>,
    shared: Arc<Shared>,
    spawned: AtomicUsize,
}

impl IoDispatcher {
    /// Create a pool that grows on demand up to `max_workers` threads.
    pub fn new(max_workers: usize, name: &str) -> Self {
        let (sender, queue) = unbounded();
        Self {
            name: name.to_string(),
            max_workers: max_workers.max(1),
            sender,
            shared: Arc::new(Shared {
                queue,
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
            }),
            spawned: AtomicUsize::new(0),
        }
    }

    fn spawn_worker_if_starved(&self) {
        loop {
            if self.shared.idle.load(Ordering::SeqCst) > 0 {
                return;
            }
            let workers = self.shared.workers.load(Ordering::SeqCst);
            if workers >= self.max_workers {
                return;
            }
            if self
                .shared
                .workers
                .compare_exchange(workers, workers + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let shared = Arc::clone(&self.shared);
            let index = self.spawned.fetch_add(1, Ordering::SeqCst);
            thread::Builder::new()
                .name(format!("{}-worker-{index}", self.name))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn io worker thread");
            return;
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let received = shared.queue.recv_timeout(KEEP_ALIVE);
        shared.idle.fetch_sub(1, Ordering::SeqCst);
        match received {
            Ok(task) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
                    let failure = Failure::panicked(payload);
                    tracing::error!(failure = %failure, "io task panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                shared.workers.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

impl Dispatcher for IoDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, _context: &CoroutineContext, task: Runnable) {
        self.sender.send(task).expect("io queue disconnected");
        self.spawn_worker_if_starved();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_many_blocking_tasks_concurrently() {
        let pool = IoDispatcher::new(8, "test-io");
        let ctx = CoroutineContext::empty();
        let (tx, rx) = mpsc::channel();
        let barrier = Arc::new(std::sync::Barrier::new(4));
        for _ in 0..4 {
            let tx = tx.clone();
            let barrier = Arc::clone(&barrier);
            pool.dispatch(
                &ctx,
                Runnable::new(move || {
                    // All four must be running at once to pass the barrier.
                    barrier.wait();
                    tx.send(()).unwrap();
                }),
            );
        }
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn worker_count_stays_at_or_below_cap() {
        let pool = IoDispatcher::new(2, "test-io-cap");
        let ctx = CoroutineContext::empty();
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let tx = tx.clone();
            pool.dispatch(
                &ctx,
                Runnable::new(move || {
                    thread::sleep(Duration::from_millis(10));
                    tx.send(()).unwrap();
                }),
            );
        }
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(pool.shared.workers.load(Ordering::SeqCst) <= 2);
    }
}
