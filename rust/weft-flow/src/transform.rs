//! Value-level flow operators: map, filter, transform, limits, callbacks.
//!
//! Every operator here composes by wrapping the downstream collector — no
//! channels, no extra coroutines. The aborting operators (`take`) stop the
//! upstream with a private marker failure that only their own collector
//! swallows; any other collector observing it rethrows.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::error::Failure;

use crate::flow::{
    is_own_abort, next_abort_owner, CollectorRef, Flow, FlowCollector, FlowSink, RawFlow,
};

type TransformOp<T, U> =
    Arc<dyn Fn(T, FlowSink<U>) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;

struct TransformFlow<T: Send + 'static, U: Send + 'static> {
    upstream: Flow<T>,
    op: TransformOp<T, U>,
}

struct TransformCollector<T: Send + 'static, U: Send + 'static> {
    sink: FlowSink<U>,
    op: TransformOp<T, U>,
}

#[async_trait]
impl<T: Send + 'static, U: Send + 'static> FlowCollector<T> for TransformCollector<T, U> {
    async fn emit(&self, value: T) -> Result<(), Failure> {
        (self.op)(value, self.sink.clone()).await
    }
}

impl<T: Send + 'static, U: Send + 'static> RawFlow<U> for TransformFlow<T, U> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<U>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let sink = FlowSink::new(collector);
            let wrapped: CollectorRef<T> = Arc::new(TransformCollector {
                sink,
                op: Arc::clone(&self.op),
            });
            self.upstream.collect_with(wrapped).await
        }
        .boxed()
    }
}

impl<T: Send + 'static> Flow<T> {
    /// The general per-value operator: `op` receives each upstream value and
    /// a sink, and may emit zero or more values downstream.
    pub fn transform<U, F, Fut>(&self, op: F) -> Flow<U>
    where
        U: Send + 'static,
        F: Fn(T, FlowSink<U>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Failure>> + Send + 'static,
    {
        Flow::plain(TransformFlow {
            upstream: self.clone(),
            op: Arc::new(move |value, sink| op(value, sink).boxed()) as TransformOp<T, U>,
        })
    }

    /// Map every value through `f`.
    pub fn map<U: Send + 'static>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Flow<U> {
        self.transform(move |value, sink| {
            let mapped = f(value);
            async move { sink.emit(mapped).await }
        })
    }

    /// Keep only values satisfying `predicate`.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        self.transform(move |value, sink| {
            let keep = predicate(&value);
            async move {
                if keep {
                    sink.emit(value).await
                } else {
                    Ok(())
                }
            }
        })
    }

    /// Observe every value without changing the stream.
    pub fn on_each(
        &self,
        f: impl Fn(&T) -> Result<(), Failure> + Send + Sync + 'static,
    ) -> Flow<T> {
        self.transform(move |value, sink| {
            let observed = f(&value);
            async move {
                observed?;
                sink.emit(value).await
            }
        })
    }

    /// Emit at most the first `n` values, then stop the upstream.
    ///
    /// # Panics
    ///
    /// Panics when `n` is zero — an empty take is a bug at the call site.
    pub fn take(&self, n: usize) -> Flow<T> {
        assert!(n > 0, "take requires a positive count");
        Flow::plain(TakeFlow {
            upstream: self.clone(),
            n,
        })
    }

    /// Skip the first `n` values. The counter is per collection — a re-
    /// collected flow skips again.
    pub fn drop_first(&self, n: usize) -> Flow<T> {
        Flow::plain(DropFlow {
            upstream: self.clone(),
            n,
        })
    }

    /// Suppress consecutive repeats. The comparison state is per collection.
    pub fn distinct_until_changed(&self) -> Flow<T>
    where
        T: Clone + PartialEq,
    {
        Flow::plain(DistinctFlow {
            upstream: self.clone(),
        })
    }

    /// Run `action` before the first value is requested from the upstream.
    /// The action may emit (its values precede the upstream's).
    pub fn on_start<F, Fut>(&self, action: F) -> Flow<T>
    where
        F: Fn(FlowSink<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Failure>> + Send + 'static,
    {
        struct OnStartFlow<T: Send + 'static> {
            upstream: Flow<T>,
            action: Arc<dyn Fn(FlowSink<T>) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>,
        }

        impl<T: Send + 'static> RawFlow<T> for OnStartFlow<T> {
            fn collect_raw(
                self: Arc<Self>,
                collector: CollectorRef<T>,
            ) -> BoxFuture<'static, Result<(), Failure>> {
                async move {
                    let sink = FlowSink::new(Arc::clone(&collector));
                    (self.action)(sink).await?;
                    self.upstream.collect_with(collector).await
                }
                .boxed()
            }
        }

        Flow::plain(OnStartFlow {
            upstream: self.clone(),
            action: Arc::new(move |sink| action(sink).boxed()),
        })
    }

    /// Run `action` after the flow completes, successfully or not, with the
    /// terminating cause. The action may emit trailing values on the success
    /// path; the original failure is rethrown afterwards on the failure path.
    pub fn on_completion<F, Fut>(&self, action: F) -> Flow<T>
    where
        F: Fn(Option<Failure>, FlowSink<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Failure>> + Send + 'static,
    {
        struct OnCompletionFlow<T: Send + 'static> {
            upstream: Flow<T>,
            #[allow(clippy::type_complexity)]
            action: Arc<
                dyn Fn(Option<Failure>, FlowSink<T>) -> BoxFuture<'static, Result<(), Failure>>
                    + Send
                    + Sync,
            >,
        }

        impl<T: Send + 'static> RawFlow<T> for OnCompletionFlow<T> {
            fn collect_raw(
                self: Arc<Self>,
                collector: CollectorRef<T>,
            ) -> BoxFuture<'static, Result<(), Failure>> {
                async move {
                    let result = self.upstream.collect_with(Arc::clone(&collector)).await;
                    let sink = FlowSink::new(collector);
                    let cause = result.as_ref().err().cloned();
                    (self.action)(cause, sink).await?;
                    result
                }
                .boxed()
            }
        }

        Flow::plain(OnCompletionFlow {
            upstream: self.clone(),
            action: Arc::new(move |cause, sink| action(cause, sink).boxed()),
        })
    }
}

// ---------------------------------------------------------------------------
// drop_first / distinct_until_changed
// ---------------------------------------------------------------------------

struct DropFlow<T: Send + 'static> {
    upstream: Flow<T>,
    n: usize,
}

struct DropCollector<T: Send + 'static> {
    downstream: CollectorRef<T>,
    remaining: Mutex<usize>,
}

#[async_trait]
impl<T: Send + 'static> FlowCollector<T> for DropCollector<T> {
    async fn emit(&self, value: T) -> Result<(), Failure> {
        {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(());
            }
        }
        self.downstream.emit(value).await
    }
}

impl<T: Send + 'static> RawFlow<T> for DropFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let wrapped: CollectorRef<T> = Arc::new(DropCollector {
                downstream: collector,
                remaining: Mutex::new(self.n),
            });
            self.upstream.collect_with(wrapped).await
        }
        .boxed()
    }
}

struct DistinctFlow<T: Send + 'static> {
    upstream: Flow<T>,
}

struct DistinctCollector<T: Send + 'static> {
    downstream: CollectorRef<T>,
    previous: Mutex<Option<T>>,
}

#[async_trait]
impl<T: Clone + PartialEq + Send + 'static> FlowCollector<T> for DistinctCollector<T> {
    async fn emit(&self, value: T) -> Result<(), Failure> {
        {
            let mut previous = self.previous.lock().unwrap();
            if previous.as_ref() == Some(&value) {
                return Ok(());
            }
            *previous = Some(value.clone());
        }
        self.downstream.emit(value).await
    }
}

impl<T: Clone + PartialEq + Send + 'static> RawFlow<T> for DistinctFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let wrapped: CollectorRef<T> = Arc::new(DistinctCollector {
                downstream: collector,
                previous: Mutex::new(None),
            });
            self.upstream.collect_with(wrapped).await
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// take
// ---------------------------------------------------------------------------

struct TakeFlow<T: Send + 'static> {
    upstream: Flow<T>,
    n: usize,
}

struct TakeCollector<T: Send + 'static> {
    downstream: CollectorRef<T>,
    remaining: Mutex<usize>,
    owner: u64,
}

#[async_trait]
impl<T: Send + 'static> FlowCollector<T> for TakeCollector<T> {
    async fn emit(&self, value: T) -> Result<(), Failure> {
        let last = {
            let mut remaining = self.remaining.lock().unwrap();
            debug_assert!(*remaining > 0);
            *remaining -= 1;
            *remaining == 0
        };
        self.downstream.emit(value).await?;
        if last {
            // Stop the upstream; swallowed by our own collect below.
            Err(Failure::flow_aborted(self.owner))
        } else {
            Ok(())
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for TakeFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let owner = next_abort_owner();
            let wrapped: CollectorRef<T> = Arc::new(TakeCollector {
                downstream: collector,
                remaining: Mutex::new(self.n),
                owner,
            });
            match self.upstream.collect_with(wrapped).await {
                Err(failure) if is_own_abort(&failure, owner) => Ok(()),
                other => other,
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{flow, flow_of};
    use weft_core::scope::run_blocking;

    #[test]
    fn map_and_filter_compose() {
        run_blocking(async {
            let values = flow_of(1..=6)
                .filter(|v| v % 2 == 0)
                .map(|v| v * 10)
                .to_list()
                .await?;
            assert_eq!(values, vec![20, 40, 60]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn transform_may_emit_many() {
        run_blocking(async {
            let values = flow_of(1..=3)
                .transform(|v, sink| async move {
                    sink.emit(v).await?;
                    sink.emit(v * 100).await
                })
                .to_list()
                .await?;
            assert_eq!(values, vec![1, 100, 2, 200, 3, 300]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn take_stops_the_upstream_early() {
        run_blocking(async {
            let emitted = Arc::new(Mutex::new(0));
            let emitted_in_flow = Arc::clone(&emitted);
            let f = flow(move |sink| {
                let emitted = Arc::clone(&emitted_in_flow);
                async move {
                    for i in 0.. {
                        *emitted.lock().unwrap() += 1;
                        sink.emit(i).await?;
                    }
                    Ok(())
                }
            });
            assert_eq!(f.take(3).to_list().await?, vec![0, 1, 2]);
            // The infinite producer was stopped after the third emission.
            assert_eq!(*emitted.lock().unwrap(), 3);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn drop_first_skips_prefix() {
        run_blocking(async {
            assert_eq!(flow_of(1..=5).drop_first(3).to_list().await?, vec![4, 5]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn distinct_until_changed_suppresses_repeats() {
        run_blocking(async {
            let values = flow_of(vec![1, 1, 2, 2, 2, 3, 1])
                .distinct_until_changed()
                .to_list()
                .await?;
            assert_eq!(values, vec![1, 2, 3, 1]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn on_completion_sees_the_cause() {
        run_blocking(async {
            let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

            let seen_ok = Arc::clone(&seen);
            flow_of(1..=2)
                .on_completion(move |cause, _sink| {
                    seen_ok
                        .lock()
                        .unwrap()
                        .push(cause.map(|f| f.message().to_string()));
                    async { Ok(()) }
                })
                .collect()
                .await?;

            let seen_err = Arc::clone(&seen);
            let failing: Flow<i32> = flow(|_sink| async { Err(Failure::app("boom")) });
            let result = failing
                .on_completion(move |cause, _sink| {
                    seen_err
                        .lock()
                        .unwrap()
                        .push(cause.map(|f| f.message().to_string()));
                    async { Ok(()) }
                })
                .collect()
                .await;
            assert!(result.is_err());

            assert_eq!(
                *seen.lock().unwrap(),
                vec![None, Some("boom".to_string())]
            );
            Ok(())
        })
        .unwrap();
    }
}
