//! Cold flows — asynchronous sequences defined by their `collect` function.
//!
//! A [`Flow`] owns no state of its own: collecting it runs the producer from
//! the start, in the collecting coroutine. Emission is context-preserving —
//! a producer that emits from some other coroutine (a leaked sink) fails with
//! a dedicated invariant error instead of corrupting collector state.
//!
//! Operators compose by wrapping collectors; the channel-bearing operators
//! (`flow_on`, `buffer`, `conflate`) live in the channel-flow layer and fuse
//! with each other before any channel is created.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::error::{Failure, FailureKind};
use weft_core::job::JobHandle;
use weft_core::scope::CoroutineScope;
use weft_core::task::current_job;

use crate::channel_flow::ChannelFlow;

// ---------------------------------------------------------------------------
// Collector and flow traits
// ---------------------------------------------------------------------------

/// Receives the values of a flow, one at a time.
#[async_trait]
pub trait FlowCollector<T: Send + 'static>: Send + Sync {
    async fn emit(&self, value: T) -> Result<(), Failure>;
}

/// Shared handle to a collector; operators wrap these.
pub type CollectorRef<T> = Arc<dyn FlowCollector<T>>;

/// The producer side of a flow.
pub(crate) trait RawFlow<T: Send + 'static>: Send + Sync {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>>;
}

pub(crate) enum FlowInner<T: Send + 'static> {
    Plain(Arc<dyn RawFlow<T>>),
    /// Kept concrete so channel-bearing operators can fuse.
    Channelized(Arc<ChannelFlow<T>>),
}

/// A cold asynchronous sequence.
pub struct Flow<T: Send + 'static> {
    pub(crate) inner: FlowInner<T>,
}

impl<T: Send + 'static> Clone for Flow<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            FlowInner::Plain(raw) => FlowInner::Plain(Arc::clone(raw)),
            FlowInner::Channelized(cf) => FlowInner::Channelized(Arc::clone(cf)),
        };
        Self { inner }
    }
}

impl<T: Send + 'static> fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            FlowInner::Plain(_) => f.write_str("Flow"),
            FlowInner::Channelized(_) => f.write_str("Flow(channelized)"),
        }
    }
}

impl<T: Send + 'static> Flow<T> {
    pub(crate) fn plain(raw: impl RawFlow<T> + 'static) -> Self {
        Self {
            inner: FlowInner::Plain(Arc::new(raw)),
        }
    }

    /// Collect into `collector`, driving the producer to completion.
    pub async fn collect_with(&self, collector: CollectorRef<T>) -> Result<(), Failure> {
        match &self.inner {
            FlowInner::Plain(raw) => Arc::clone(raw).collect_raw(collector).await,
            FlowInner::Channelized(cf) => Arc::clone(cf).collect_channelized(collector).await,
        }
    }

    /// Collect, applying `f` to every value.
    pub async fn for_each(
        &self,
        f: impl FnMut(T) -> Result<(), Failure> + Send + 'static,
    ) -> Result<(), Failure> {
        struct FnCollector<F>(Mutex<F>);

        #[async_trait]
        impl<T: Send + 'static, F> FlowCollector<T> for FnCollector<F>
        where
            F: FnMut(T) -> Result<(), Failure> + Send + 'static,
        {
            async fn emit(&self, value: T) -> Result<(), Failure> {
                (self.0.lock().unwrap())(value)
            }
        }

        self.collect_with(Arc::new(FnCollector(Mutex::new(f)))).await
    }

    /// Collect, discarding every value.
    pub async fn collect(&self) -> Result<(), Failure> {
        self.for_each(|_| Ok(())).await
    }

    /// Collect in a coroutine launched in `scope`.
    pub fn launch_in(&self, scope: &CoroutineScope) -> JobHandle {
        let flow = self.clone();
        scope.launch(async move { flow.collect().await })
    }
}

// ---------------------------------------------------------------------------
// FlowSink — context-preserving emission handle
// ---------------------------------------------------------------------------

/// Emission handle passed to producer blocks. Emitting from any coroutine
/// other than the collecting one fails with a flow-invariant error.
pub struct FlowSink<T: Send + 'static> {
    collector: CollectorRef<T>,
    owner: Option<JobHandle>,
}

impl<T: Send + 'static> Clone for FlowSink<T> {
    fn clone(&self) -> Self {
        Self {
            collector: Arc::clone(&self.collector),
            owner: self.owner.clone(),
        }
    }
}

impl<T: Send + 'static> FlowSink<T> {
    pub(crate) fn new(collector: CollectorRef<T>) -> Self {
        Self {
            collector,
            owner: current_job(),
        }
    }

    /// Emit one value downstream.
    pub async fn emit(&self, value: T) -> Result<(), Failure> {
        let here = current_job();
        // Nested scope frames of the collecting coroutine are fine; a foreign
        // coroutine (launched worker, leaked sink) is not.
        let same_coroutine = match (&self.owner, &here) {
            (Some(owner), Some(current)) => current.is_in_lineage_of(owner),
            (None, _) => true,
            (Some(_), None) => false,
        };
        if !same_coroutine {
            return Err(Failure::flow_invariant(
                "flow emission outside the collecting coroutine",
            ));
        }
        self.collector.emit(value).await
    }

    /// Emit every value of `source` downstream.
    pub async fn emit_all(&self, source: Flow<T>) -> Result<(), Failure> {
        source.collect_with(Arc::clone(&self.collector)).await
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

struct BlockFlow<F> {
    block: F,
}

impl<T, F, Fut> RawFlow<T> for BlockFlow<F>
where
    T: Send + 'static,
    F: Fn(FlowSink<T>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), Failure>> + Send + 'static,
{
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let sink = FlowSink::new(collector);
            (self.block)(sink).await
        }
        .boxed()
    }
}

/// Build a cold flow from a producer block.
pub fn flow<T, F, Fut>(block: F) -> Flow<T>
where
    T: Send + 'static,
    F: Fn(FlowSink<T>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), Failure>> + Send + 'static,
{
    Flow::plain(BlockFlow { block })
}

struct IterFlow<T> {
    values: Vec<T>,
}

impl<T: Clone + Send + Sync + 'static> RawFlow<T> for IterFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            for value in &self.values {
                collector.emit(value.clone()).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// A flow of fixed values, emitted in order on every collection.
pub fn flow_of<T: Clone + Send + Sync + 'static>(values: impl IntoIterator<Item = T>) -> Flow<T> {
    Flow::plain(IterFlow {
        values: values.into_iter().collect(),
    })
}

/// A flow that completes without emitting.
pub fn empty_flow<T: Send + 'static>() -> Flow<T> {
    flow(|_sink| async { Ok(()) })
}

// ---------------------------------------------------------------------------
// Abort tokens (used by `first`, `take`, and friends)
// ---------------------------------------------------------------------------

static ABORT_OWNERS: AtomicU64 = AtomicU64::new(1);

/// A fresh identity for an aborting collector.
pub(crate) fn next_abort_owner() -> u64 {
    ABORT_OWNERS.fetch_add(1, Ordering::Relaxed)
}

/// `true` when `failure` is the abort marker owned by `owner`.
pub(crate) fn is_own_abort(failure: &Failure, owner: u64) -> bool {
    matches!(failure.kind(), FailureKind::FlowAborted { owner: seen } if *seen == owner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::scope::run_blocking;

    #[test]
    fn flow_is_cold_and_replayable() {
        run_blocking(async {
            let runs = Arc::new(Mutex::new(0));
            let runs_in_flow = Arc::clone(&runs);
            let f = flow(move |sink| {
                let runs = Arc::clone(&runs_in_flow);
                async move {
                    *runs.lock().unwrap() += 1;
                    sink.emit(1).await?;
                    sink.emit(2).await?;
                    Ok(())
                }
            });
            assert_eq!(*runs.lock().unwrap(), 0);
            assert_eq!(f.to_list().await?, vec![1, 2]);
            assert_eq!(f.to_list().await?, vec![1, 2]);
            assert_eq!(*runs.lock().unwrap(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn flow_of_emits_in_order() {
        run_blocking(async {
            assert_eq!(flow_of(1..=5).to_list().await?, vec![1, 2, 3, 4, 5]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn leaked_sink_emission_fails_with_invariant_error() {
        run_blocking(async {
            let f: Flow<i32> = flow(move |sink| async move {
                // Emitting from a launched coroutine must be rejected; a
                // nested scope frame of the collector is fine.
                let stolen = sink.clone();
                weft_core::scope::supervisor_scope(move |inner| async move {
                    let handle = inner.spawn_deferred(async move { stolen.emit(1).await });
                    let failure = handle.await_value().await.unwrap_err();
                    assert!(matches!(failure.kind(), FailureKind::FlowInvariant));
                    Ok(())
                })
                .await?;
                sink.emit(2).await
            });
            assert_eq!(f.to_list().await?, vec![2]);
            Ok(())
        })
        .unwrap();
    }
}
