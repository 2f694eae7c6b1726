//! StateFlow — a hot flow specialised to one current value.
//!
//! A [`MutableStateFlow`] always holds a value; collectors receive the value
//! at subscription time and then every *distinct* newer value. Updates are
//! conflated: a slow collector skips intermediate values, and setting an
//! equal value is a no-op.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::cancellable::{suspend_cancellable, CancellableContinuation};
use weft_core::error::Failure;

use crate::flow::{CollectorRef, Flow, RawFlow};

struct StateCell<T> {
    value: T,
    version: u64,
    waiters: Vec<(u64, CancellableContinuation<()>)>,
    next_id: u64,
}

struct StateInner<T> {
    cell: Mutex<StateCell<T>>,
    /// `None` on the internal counters that track subscriptions, which would
    /// otherwise recurse forever.
    subscriptions: Option<MutableStateFlow<usize>>,
}

/// A hot flow holding a single current value with equality conflation.
pub struct MutableStateFlow<T: Clone + PartialEq + Send + Sync + 'static> {
    inner: Arc<StateInner<T>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Clone for MutableStateFlow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Shared constructor; `subscriptions` is `None` only for the internal
/// counters, which must not track their own subscribers.
fn build_state<U: Clone + PartialEq + Send + Sync + 'static>(
    value: U,
    subscriptions: Option<MutableStateFlow<usize>>,
) -> MutableStateFlow<U> {
    MutableStateFlow {
        inner: Arc::new(StateInner {
            cell: Mutex::new(StateCell {
                value,
                version: 0,
                waiters: Vec::new(),
                next_id: 1,
            }),
            subscriptions,
        }),
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> MutableStateFlow<T> {
    pub fn new(value: T) -> Self {
        build_state(value, Some(build_state(0, None)))
    }

    /// The current value.
    pub fn value(&self) -> T {
        self.inner.cell.lock().unwrap().value.clone()
    }

    /// Replace the value. A value equal to the current one is a no-op — no
    /// collector observes it.
    pub fn set(&self, value: T) {
        let wakes;
        {
            let mut cell = self.inner.cell.lock().unwrap();
            if cell.value == value {
                return;
            }
            cell.value = value;
            cell.version += 1;
            wakes = std::mem::take(&mut cell.waiters);
        }
        for (_, waiter) in wakes {
            // A cancelled waiter ignores the resume.
            waiter.resume(Ok(()));
        }
    }

    /// Set `new` only when the current value equals `expect`.
    pub fn compare_and_set(&self, expect: &T, new: T) -> bool {
        let wakes;
        {
            let mut cell = self.inner.cell.lock().unwrap();
            if cell.value != *expect {
                return false;
            }
            if cell.value == new {
                return true;
            }
            cell.value = new;
            cell.version += 1;
            wakes = std::mem::take(&mut cell.waiters);
        }
        for (_, waiter) in wakes {
            waiter.resume(Ok(()));
        }
        true
    }

    /// Apply `f` atomically: retried until no concurrent update intervenes.
    pub fn update(&self, f: impl Fn(&T) -> T) {
        loop {
            let current = self.value();
            let next = f(&current);
            if self.compare_and_set(&current, next) {
                return;
            }
        }
    }

    /// Number of active collectors, itself observable as a state flow.
    pub fn subscription_count(&self) -> MutableStateFlow<usize> {
        self.inner
            .subscriptions
            .clone()
            .expect("subscription counters do not track their own subscribers")
    }

    fn adjust_subscriptions(&self, delta: isize) {
        if let Some(count) = &self.inner.subscriptions {
            count.update(|n| n.saturating_add_signed(delta));
        }
    }

    /// Suspend until the version moves past `seen`.
    async fn await_change(&self, seen: u64) -> Result<(), Failure> {
        let inner = Arc::clone(&self.inner);
        suspend_cancellable(move |cc| {
            let mut cell = inner.cell.lock().unwrap();
            if cell.version != seen {
                drop(cell);
                cc.resume(Ok(()));
                return;
            }
            let id = cell.next_id;
            cell.next_id += 1;
            cell.waiters.push((id, cc.clone()));
            drop(cell);
            let cleanup = Arc::clone(&inner);
            cc.invoke_on_cancellation(move |_| {
                cleanup
                    .cell
                    .lock()
                    .unwrap()
                    .waiters
                    .retain(|(wid, _)| *wid != id);
            });
        })
        .await
    }

    /// The values of this state flow as a never-completing cold handle.
    pub fn as_flow(&self) -> Flow<T> {
        Flow::plain(StateAsFlow {
            state: self.clone(),
        })
    }
}

struct StateAsFlow<T: Clone + PartialEq + Send + Sync + 'static> {
    state: MutableStateFlow<T>,
}

struct SubscriptionGuard<T: Clone + PartialEq + Send + Sync + 'static>(MutableStateFlow<T>);

impl<T: Clone + PartialEq + Send + Sync + 'static> Drop for SubscriptionGuard<T> {
    fn drop(&mut self) {
        self.0.adjust_subscriptions(-1);
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> RawFlow<T> for StateAsFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            self.state.adjust_subscriptions(1);
            let _guard = SubscriptionGuard(self.state.clone());
            loop {
                let (value, version) = {
                    let cell = self.state.inner.cell.lock().unwrap();
                    (cell.value.clone(), cell.version)
                };
                collector.emit(value).await?;
                self.state.await_change(version).await?;
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::scope::{coroutine_scope, run_blocking};
    use weft_core::time::delay;
    use std::time::Duration;

    #[test]
    fn value_reads_and_updates() {
        let state = MutableStateFlow::new(1);
        assert_eq!(state.value(), 1);
        state.set(2);
        assert_eq!(state.value(), 2);
        assert!(state.compare_and_set(&2, 3));
        assert!(!state.compare_and_set(&2, 4));
        state.update(|v| v * 10);
        assert_eq!(state.value(), 30);
    }

    #[test]
    fn collector_sees_current_value_then_changes() {
        run_blocking(async {
            coroutine_scope(|scope| async move {
                let state = MutableStateFlow::new(0);
                let seen = Arc::new(Mutex::new(Vec::new()));
                let seen_in_collector = Arc::clone(&seen);
                let collecting = state.as_flow();
                let collector = scope.launch(async move {
                    collecting
                        .take(3)
                        .for_each(move |v| {
                            seen_in_collector.lock().unwrap().push(v);
                            Ok(())
                        })
                        .await
                });
                delay(Duration::from_millis(10)).await?;
                state.set(1);
                delay(Duration::from_millis(10)).await?;
                state.set(2);
                collector.join().await?;
                assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
                Ok(())
            })
            .await
        })
        .unwrap();
    }

    #[test]
    fn equal_set_is_conflated_away() {
        run_blocking(async {
            coroutine_scope(|scope| async move {
                let state = MutableStateFlow::new(5);
                let seen = Arc::new(Mutex::new(Vec::new()));
                let seen_in_collector = Arc::clone(&seen);
                let collecting = state.as_flow();
                let collector = scope.launch(async move {
                    collecting
                        .take(2)
                        .for_each(move |v| {
                            seen_in_collector.lock().unwrap().push(v);
                            Ok(())
                        })
                        .await
                });
                delay(Duration::from_millis(10)).await?;
                // Structurally equal: must not wake the collector.
                state.set(5);
                delay(Duration::from_millis(10)).await?;
                state.set(6);
                collector.join().await?;
                assert_eq!(*seen.lock().unwrap(), vec![5, 6]);
                Ok(())
            })
            .await
        })
        .unwrap();
    }

    #[test]
    fn subscription_count_tracks_collectors() {
        run_blocking(async {
            coroutine_scope(|scope| async move {
                let state = MutableStateFlow::new(0);
                assert_eq!(state.subscription_count().value(), 0);
                let collecting = state.as_flow();
                let collector = scope.launch(async move {
                    collecting.take(2).collect().await
                });
                delay(Duration::from_millis(10)).await?;
                assert_eq!(state.subscription_count().value(), 1);
                state.set(1);
                collector.join().await?;
                assert_eq!(state.subscription_count().value(), 0);
                Ok(())
            })
            .await
        })
        .unwrap();
    }
}
