//! Suspending synchronisation primitives: [`Mutex`] and [`Semaphore`].
//!
//! Both are fair (FIFO over waiters) and cancellation-safe: a waiter
//! cancelled while parked neither holds the lock nor consumes a permit, and
//! a release skips dead waiters. Locking is not reentrant — a coroutine that
//! locks twice deadlocks with itself, like any other mutex.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use crate::cancellable::{suspend_cancellable, CancellableContinuation};
use crate::error::Failure;

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

struct MutexState {
    locked: bool,
    waiters: VecDeque<(u64, CancellableContinuation<()>)>,
    next_id: u64,
}

/// A suspending, non-reentrant mutual-exclusion lock.
#[derive(Clone)]
pub struct Mutex {
    state: Arc<StdMutex<MutexState>>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StdMutex::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
                next_id: 1,
            })),
        }
    }

    /// `true` while some coroutine holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    /// Take the lock without suspending, if free.
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    /// Take the lock, suspending FIFO behind current waiters.
    pub async fn lock(&self) -> Result<(), Failure> {
        let shared = Arc::clone(&self.state);
        suspend_cancellable(move |cc| {
            let mut state = shared.lock().unwrap();
            if !state.locked {
                state.locked = true;
                drop(state);
                cc.resume(Ok(()));
                return;
            }
            let id = state.next_id;
            state.next_id += 1;
            state.waiters.push_back((id, cc.clone()));
            drop(state);
            let cleanup = Arc::clone(&shared);
            cc.invoke_on_cancellation(move |_| {
                cleanup.lock().unwrap().waiters.retain(|(wid, _)| *wid != id);
            });
        })
        .await
    }

    /// Release the lock, handing it to the oldest live waiter.
    ///
    /// # Panics
    ///
    /// Panics when the mutex is not locked — an unlock without a matching
    /// lock is a bug in the caller.
    pub fn unlock(&self) {
        let waker;
        {
            let mut state = self.state.lock().unwrap();
            assert!(state.locked, "unlock of an unlocked mutex");
            loop {
                match state.waiters.pop_front() {
                    Some((_, cc)) => {
                        // Hand-off: the lock stays held, now by the waiter.
                        match cc.try_resume_now(Ok(()), None) {
                            Ok(w) => {
                                waker = w;
                                break;
                            }
                            Err(_) => continue,
                        }
                    }
                    None => {
                        state.locked = false;
                        waker = None;
                        break;
                    }
                }
            }
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Run `body` under the lock, releasing it on both success and failure.
    pub async fn with_lock<T, Fut>(&self, body: Fut) -> Result<T, Failure>
    where
        Fut: std::future::Future<Output = Result<T, Failure>>,
    {
        self.lock().await?;
        let result = body.await;
        self.unlock();
        result
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

struct SemaphoreState {
    available: usize,
    waiters: VecDeque<(u64, CancellableContinuation<()>)>,
    next_id: u64,
}

/// A counting semaphore with suspending acquisition.
#[derive(Clone)]
pub struct Semaphore {
    permits: usize,
    state: Arc<StdMutex<SemaphoreState>>,
}

impl Semaphore {
    /// A semaphore with `permits` total permits, all initially available.
    pub fn new(permits: usize) -> Self {
        Self {
            permits,
            state: Arc::new(StdMutex::new(SemaphoreState {
                available: permits,
                waiters: VecDeque::new(),
                next_id: 1,
            })),
        }
    }

    /// Permits currently available.
    pub fn available_permits(&self) -> usize {
        self.state.lock().unwrap().available
    }

    /// Take a permit without suspending, if one is available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, suspending FIFO behind current waiters. A cancelled
    /// waiter consumes no permit.
    pub async fn acquire(&self) -> Result<(), Failure> {
        let shared = Arc::clone(&self.state);
        suspend_cancellable(move |cc| {
            let mut state = shared.lock().unwrap();
            if state.available > 0 {
                state.available -= 1;
                drop(state);
                cc.resume(Ok(()));
                return;
            }
            let id = state.next_id;
            state.next_id += 1;
            state.waiters.push_back((id, cc.clone()));
            drop(state);
            let cleanup = Arc::clone(&shared);
            cc.invoke_on_cancellation(move |_| {
                cleanup.lock().unwrap().waiters.retain(|(wid, _)| *wid != id);
            });
        })
        .await
    }

    /// Return a permit, resuming the oldest live waiter.
    ///
    /// # Panics
    ///
    /// Panics when all permits are already available — releasing more than
    /// was acquired is a bug in the caller.
    pub fn release(&self) {
        let waker;
        {
            let mut state = self.state.lock().unwrap();
            loop {
                match state.waiters.pop_front() {
                    Some((_, cc)) => {
                        // The permit transfers directly to the waiter.
                        match cc.try_resume_now(Ok(()), None) {
                            Ok(w) => {
                                waker = w;
                                break;
                            }
                            Err(_) => continue,
                        }
                    }
                    None => {
                        assert!(
                            state.available < self.permits,
                            "semaphore released more permits than it holds"
                        );
                        state.available += 1;
                        waker = None;
                        break;
                    }
                }
            }
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Run `body` while holding one permit.
    pub async fn with_permit<T, Fut>(&self, body: Fut) -> Result<T, Failure>
    where
        Fut: std::future::Future<Output = Result<T, Failure>>,
    {
        self.acquire().await?;
        let result = body.await;
        self.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{coroutine_scope, run_blocking};
    use crate::time::delay;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn mutex_excludes_concurrent_critical_sections() {
        run_blocking(async {
            coroutine_scope(|scope| async move {
                let mutex = Mutex::new();
                let in_section = Arc::new(AtomicUsize::new(0));
                let peak = Arc::new(AtomicUsize::new(0));
                let mut workers = Vec::new();
                for _ in 0..8 {
                    let mutex = mutex.clone();
                    let in_section = Arc::clone(&in_section);
                    let peak = Arc::clone(&peak);
                    workers.push(scope.spawn_deferred(async move {
                        mutex
                            .with_lock(async {
                                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                delay(Duration::from_millis(2)).await?;
                                in_section.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .await
                    }));
                }
                for worker in workers {
                    worker.await_value().await?;
                }
                assert_eq!(peak.load(Ordering::SeqCst), 1);
                assert!(!mutex.is_locked());
                Ok(())
            })
            .await
        })
        .unwrap();
    }

    #[test]
    fn cancelled_mutex_waiter_never_holds_the_lock() {
        run_blocking(async {
            coroutine_scope(|scope| async move {
                let mutex = Mutex::new();
                mutex.lock().await?;
                let contender_mutex = mutex.clone();
                let contender = scope.launch(async move {
                    contender_mutex.lock().await?;
                    panic!("cancelled waiter must not acquire the lock");
                });
                delay(Duration::from_millis(10)).await?;
                contender.cancel();
                contender.join().await?;
                mutex.unlock();
                assert!(!mutex.is_locked());
                Ok(())
            })
            .await
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "unlock of an unlocked mutex")]
    fn unlock_without_lock_panics() {
        let mutex = Mutex::new();
        mutex.unlock();
    }

    #[test]
    fn semaphore_bounds_concurrency() {
        run_blocking(async {
            coroutine_scope(|scope| async move {
                let semaphore = Semaphore::new(2);
                let in_flight = Arc::new(AtomicUsize::new(0));
                let peak = Arc::new(AtomicUsize::new(0));
                let mut workers = Vec::new();
                for _ in 0..8 {
                    let semaphore = semaphore.clone();
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    workers.push(scope.spawn_deferred(async move {
                        semaphore
                            .with_permit(async {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                delay(Duration::from_millis(2)).await?;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .await
                    }));
                }
                for worker in workers {
                    worker.await_value().await?;
                }
                assert!(peak.load(Ordering::SeqCst) <= 2);
                assert_eq!(semaphore.available_permits(), 2);
                Ok(())
            })
            .await
        })
        .unwrap();
    }

    #[test]
    fn cancelled_semaphore_waiter_consumes_no_permit() {
        run_blocking(async {
            coroutine_scope(|scope| async move {
                let semaphore = Semaphore::new(1);
                assert!(semaphore.try_acquire());
                let contender_sem = semaphore.clone();
                let contender = scope.launch(async move {
                    contender_sem.acquire().await?;
                    panic!("cancelled waiter must not get a permit");
                });
                delay(Duration::from_millis(10)).await?;
                contender.cancel();
                contender.join().await?;
                semaphore.release();
                assert_eq!(semaphore.available_permits(), 1);
                Ok(())
            })
            .await
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "more permits")]
    fn over_release_panics() {
        let semaphore = Semaphore::new(1);
        semaphore.release();
    }
}
