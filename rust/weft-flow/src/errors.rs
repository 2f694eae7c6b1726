//! Error-handling flow operators: `catch`, `retry`, `retry_when`.
//!
//! These operators act on *upstream* failures only. A failure raised by the
//! downstream collector passes through unchanged — it is tracked by identity
//! through a guard collector, so wrapping cannot confuse the two directions.
//! Cancellation is never caught and never retried.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::error::Failure;

use crate::flow::{CollectorRef, Flow, FlowCollector, FlowSink, RawFlow};

/// Wraps the downstream collector and remembers, by identity, the failure it
/// raised — the marker distinguishing downstream failures from upstream ones.
struct GuardCollector<T: Send + 'static> {
    downstream: CollectorRef<T>,
    downstream_failure: Mutex<Option<Failure>>,
}

impl<T: Send + 'static> GuardCollector<T> {
    fn new(downstream: CollectorRef<T>) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            downstream_failure: Mutex::new(None),
        })
    }

    fn raised(&self, failure: &Failure) -> bool {
        self.downstream_failure
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|f| f.same(failure))
    }
}

#[async_trait]
impl<T: Send + 'static> FlowCollector<T> for GuardCollector<T> {
    async fn emit(&self, value: T) -> Result<(), Failure> {
        match self.downstream.emit(value).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                *self.downstream_failure.lock().unwrap() = Some(failure.clone());
                Err(failure)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// catch
// ---------------------------------------------------------------------------

type CatchHandler<T> =
    Arc<dyn Fn(Failure, FlowSink<T>) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;

struct CatchFlow<T: Send + 'static> {
    upstream: Flow<T>,
    handler: CatchHandler<T>,
}

impl<T: Send + 'static> RawFlow<T> for CatchFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let guard = GuardCollector::new(Arc::clone(&collector));
            match self.upstream.collect_with(guard.clone() as CollectorRef<T>).await {
                Ok(()) => Ok(()),
                Err(failure) => {
                    if guard.raised(&failure) || failure.is_cancellation() {
                        return Err(failure);
                    }
                    let sink = FlowSink::new(collector);
                    (self.handler)(failure, sink).await
                }
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// retry
// ---------------------------------------------------------------------------

type RetryPredicate = Arc<dyn Fn(&Failure, u64) -> bool + Send + Sync>;

struct RetryFlow<T: Send + 'static> {
    upstream: Flow<T>,
    predicate: RetryPredicate,
}

impl<T: Send + 'static> RawFlow<T> for RetryFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let mut attempt: u64 = 0;
            loop {
                let guard = GuardCollector::new(Arc::clone(&collector));
                match self.upstream.collect_with(guard.clone() as CollectorRef<T>).await {
                    Ok(()) => return Ok(()),
                    Err(failure) => {
                        if guard.raised(&failure) || failure.is_cancellation() {
                            return Err(failure);
                        }
                        if !(self.predicate)(&failure, attempt) {
                            return Err(failure);
                        }
                        attempt += 1;
                    }
                }
            }
        }
        .boxed()
    }
}

impl<T: Send + 'static> Flow<T> {
    /// Replace an upstream failure with the handler's emissions. Downstream
    /// failures and cancellation pass through unchanged.
    pub fn catch<F, Fut>(&self, handler: F) -> Flow<T>
    where
        F: Fn(Failure, FlowSink<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Failure>> + Send + 'static,
    {
        Flow::plain(CatchFlow {
            upstream: self.clone(),
            handler: Arc::new(move |failure, sink| handler(failure, sink).boxed()),
        })
    }

    /// Re-collect the upstream while `predicate(failure, attempt)` holds.
    /// The attempt counter starts at zero.
    pub fn retry_when(
        &self,
        predicate: impl Fn(&Failure, u64) -> bool + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::plain(RetryFlow {
            upstream: self.clone(),
            predicate: Arc::new(predicate),
        })
    }

    /// Re-collect the upstream up to `attempts` times on failure.
    pub fn retry(&self, attempts: u64) -> Flow<T> {
        self.retry_when(move |_, attempt| attempt < attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{flow, flow_of};
    use weft_core::scope::run_blocking;

    fn failing_after(values: Vec<i32>, failures: Arc<Mutex<u32>>) -> Flow<i32> {
        flow(move |sink| {
            let values = values.clone();
            let failures = Arc::clone(&failures);
            async move {
                for v in values {
                    sink.emit(v).await?;
                }
                let mut failures = failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Failure::app("upstream failed"));
                }
                Ok(())
            }
        })
    }

    #[test]
    fn catch_replaces_upstream_failure() {
        run_blocking(async {
            let failures = Arc::new(Mutex::new(1));
            let values = failing_after(vec![1, 2], failures)
                .catch(|_failure, sink| async move { sink.emit(-1).await })
                .to_list()
                .await?;
            assert_eq!(values, vec![1, 2, -1]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn catch_rethrows_downstream_failure() {
        run_blocking(async {
            let caught = Arc::new(Mutex::new(0));
            let caught_in_handler = Arc::clone(&caught);
            let result = flow_of(1..=3)
                .catch(move |_failure, _sink| {
                    *caught_in_handler.lock().unwrap() += 1;
                    async { Ok(()) }
                })
                .for_each(|v| {
                    if v == 2 {
                        Err(Failure::app("downstream rejects 2"))
                    } else {
                        Ok(())
                    }
                })
                .await;
            let failure = result.unwrap_err();
            assert_eq!(failure.message(), "downstream rejects 2");
            // The handler never ran for a downstream failure.
            assert_eq!(*caught.lock().unwrap(), 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn retry_resubscribes_from_the_start() {
        run_blocking(async {
            let failures = Arc::new(Mutex::new(2));
            let values = failing_after(vec![1, 2], failures)
                .retry(5)
                .to_list()
                .await?;
            // Two failed attempts, then a clean one.
            assert_eq!(values, vec![1, 2, 1, 2, 1, 2]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn retry_gives_up_after_the_budget() {
        run_blocking(async {
            let failures = Arc::new(Mutex::new(10));
            let result = failing_after(vec![], failures).retry(2).to_list().await;
            assert_eq!(result.unwrap_err().message(), "upstream failed");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn retry_when_sees_attempt_numbers() {
        run_blocking(async {
            let attempts_seen = Arc::new(Mutex::new(Vec::new()));
            let attempts_in_pred = Arc::clone(&attempts_seen);
            let failures = Arc::new(Mutex::new(3));
            let _ = failing_after(vec![], failures)
                .retry_when(move |_, attempt| {
                    attempts_in_pred.lock().unwrap().push(attempt);
                    attempt < 2
                })
                .collect()
                .await;
            assert_eq!(*attempts_seen.lock().unwrap(), vec![0, 1, 2]);
            Ok(())
        })
        .unwrap();
    }
}
