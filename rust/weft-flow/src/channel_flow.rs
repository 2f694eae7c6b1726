//! Channel-bearing flow operators and their fusion.
//!
//! `flow_on`, `buffer`, and `conflate` do not each build a pipeline stage:
//! they fuse into a single (context, capacity, overflow) triple, and only
//! when collection actually needs a channel (a dispatcher change or real
//! buffering) is one created — a producer coroutine runs the upstream in the
//! requested context and a channel carries values to the collector.
//!
//! Fusion rules:
//!
//! * `flow_on(A)` then `flow_on(B)`: the earlier `flow_on` wins for its
//!   frames — context composition is left-biased toward it.
//! * `buffer(n)` then `buffer(m)`: capacities combine; overflow stays
//!   `Suspend` when both requested it, otherwise the non-suspend policy wins.
//! * `buffer` then `conflate`: drop-oldest with capacity 1.
//! * `flow_on` with no dispatcher change and no buffering fuses away — the
//!   upstream is collected directly, no channel is created.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::channel::{Capacity, Channel, Overflow};
use weft_core::context::CoroutineContext;
use weft_core::error::Failure;
use weft_core::scope::{coroutine_scope, with_context, LaunchOptions};
use weft_core::task::current_context;

use crate::flow::{CollectorRef, Flow, FlowCollector, FlowInner, RawFlow};

/// Buffer size used when an operator needs a channel but none was requested.
pub(crate) const DEFAULT_BUFFER: usize = 64;

type Producer<T> = Arc<dyn Fn(Channel<T>) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;

pub(crate) enum ChannelSource<T: Send + 'static> {
    /// An upstream flow collected inside the producer coroutine.
    Upstream(Flow<T>),
    /// A `channel_flow` block emitting through the channel directly.
    Producer(Producer<T>),
}

impl<T: Send + 'static> Clone for ChannelSource<T> {
    fn clone(&self) -> Self {
        match self {
            ChannelSource::Upstream(flow) => ChannelSource::Upstream(flow.clone()),
            ChannelSource::Producer(producer) => ChannelSource::Producer(Arc::clone(producer)),
        }
    }
}

/// Combine two buffer-size requests: `None` (no request) yields to the
/// other side; two explicit requests sum.
fn combine_capacity(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (None, other) | (other, None) => other,
        (Some(x), Some(y)) => Some(x + y),
    }
}

pub(crate) struct ChannelFlow<T: Send + 'static> {
    pub(crate) context: CoroutineContext,
    /// Requested buffer size; `None` means no buffering was asked for.
    pub(crate) capacity: Option<usize>,
    pub(crate) overflow: Overflow,
    pub(crate) source: ChannelSource<T>,
}

impl<T: Send + 'static> ChannelFlow<T> {
    /// Apply a further (context, capacity, overflow) request to this stage.
    pub(crate) fn fuse(
        &self,
        context: CoroutineContext,
        capacity: Option<usize>,
        overflow: Overflow,
    ) -> ChannelFlow<T> {
        // The earlier stage's context wins for its frames.
        let fused_context = context.plus(&self.context);
        let (fused_capacity, fused_overflow) = match (self.overflow, overflow) {
            (Overflow::Suspend, Overflow::Suspend) => {
                (combine_capacity(self.capacity, capacity), Overflow::Suspend)
            }
            // A later non-suspend policy takes over wholesale:
            // buffer(n) then conflate is drop-oldest with capacity 1.
            (Overflow::Suspend, non_suspend) => (capacity, non_suspend),
            // An established non-suspend policy is kept.
            (established, _) => (combine_capacity(self.capacity, capacity), established),
        };
        ChannelFlow {
            context: fused_context,
            capacity: fused_capacity,
            overflow: fused_overflow,
            source: self.source.clone(),
        }
    }

    fn effective_capacity(&self) -> Capacity {
        match (self.capacity, self.overflow) {
            (Some(0), Overflow::Suspend) => Capacity::Rendezvous,
            (Some(0), _) | (None, Overflow::DropOldest) => Capacity::Conflated,
            (None, Overflow::Suspend) => Capacity::Buffered(DEFAULT_BUFFER),
            (None, Overflow::DropLatest) => Capacity::Buffered(1),
            (Some(n), _) => Capacity::Buffered(n),
        }
    }

    /// Whether collecting from `current` requires a real channel.
    fn needs_channel(&self, current: &CoroutineContext) -> bool {
        if self.capacity.is_some() || !matches!(self.overflow, Overflow::Suspend) {
            return true;
        }
        if matches!(self.source, ChannelSource::Producer(_)) {
            // channel_flow promises concurrent emission; it always has one.
            return true;
        }
        match (current.dispatcher(), self.context.dispatcher()) {
            (_, None) => false,
            (Some(current), Some(target)) => !Arc::ptr_eq(&current, &target),
            (None, Some(_)) => true,
        }
    }

    pub(crate) fn collect_channelized(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let current = current_context().unwrap_or_default();
            if !self.needs_channel(&current) {
                // Degenerate case: direct collect, zero cost.
                let ChannelSource::Upstream(upstream) = &self.source else {
                    unreachable!("producer sources always take the channel path");
                };
                if self.context.is_empty() {
                    return upstream.collect_with(collector).await;
                }
                let upstream = upstream.clone();
                return with_context(self.context.clone(), async move {
                    upstream.collect_with(collector).await
                })
                .await;
            }

            let capacity = self.effective_capacity();
            let overflow = self.overflow;
            let producer_context = self.context.clone();
            let source = self.source.clone();
            coroutine_scope(move |scope| async move {
                let channel = Channel::with_options(capacity, overflow, None);
                let producer_channel = channel.clone();
                scope.launch_opts(
                    LaunchOptions::new().context(producer_context),
                    async move {
                        let result = match source {
                            ChannelSource::Upstream(flow) => {
                                let sender: CollectorRef<T> =
                                    Arc::new(SendingCollector(producer_channel.clone()));
                                flow.collect_with(sender).await
                            }
                            ChannelSource::Producer(producer) => {
                                producer(producer_channel.clone()).await
                            }
                        };
                        match result {
                            Ok(()) => {
                                producer_channel.close();
                                Ok(())
                            }
                            Err(failure) => {
                                producer_channel.close_with(failure.clone());
                                Err(failure)
                            }
                        }
                    },
                );

                let mut iter = channel.iter();
                while let Some(item) = iter.next().await {
                    collector.emit(item?).await?;
                }
                Ok(())
            })
            .await
        }
        .boxed()
    }
}

impl<T: Send + 'static> RawFlow<T> for ChannelFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        self.collect_channelized(collector)
    }
}

struct SendingCollector<T: Send + 'static>(Channel<T>);

#[async_trait::async_trait]
impl<T: Send + 'static> FlowCollector<T> for SendingCollector<T> {
    async fn emit(&self, value: T) -> Result<(), Failure> {
        self.0.send(value).await
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    fn fused(&self, context: CoroutineContext, capacity: Option<usize>, overflow: Overflow) -> Flow<T> {
        let fused = match &self.inner {
            FlowInner::Channelized(existing) => existing.fuse(context, capacity, overflow),
            FlowInner::Plain(_) => ChannelFlow {
                context,
                capacity,
                overflow,
                source: ChannelSource::Upstream(self.clone()),
            },
        };
        Flow {
            inner: FlowInner::Channelized(Arc::new(fused)),
        }
    }

    /// Run everything upstream of this point in `context` (typically a
    /// dispatcher). Downstream collection is unaffected.
    pub fn flow_on(&self, context: CoroutineContext) -> Flow<T> {
        self.fused(context, None, Overflow::Suspend)
    }

    /// Decouple the producer with a buffer of `capacity`.
    pub fn buffer(&self, capacity: usize) -> Flow<T> {
        self.fused(CoroutineContext::empty(), Some(capacity), Overflow::Suspend)
    }

    /// [`buffer`](Self::buffer) with an explicit overflow policy.
    pub fn buffer_with(&self, capacity: usize, overflow: Overflow) -> Flow<T> {
        self.fused(CoroutineContext::empty(), Some(capacity), overflow)
    }

    /// Keep only the most recent value for a slow collector.
    pub fn conflate(&self) -> Flow<T> {
        self.fused(CoroutineContext::empty(), Some(0), Overflow::DropOldest)
    }
}

/// Build a flow whose producer may emit concurrently through a channel.
pub fn channel_flow<T, F, Fut>(block: F) -> Flow<T>
where
    T: Send + 'static,
    F: Fn(Channel<T>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), Failure>> + Send + 'static,
{
    let producer: Producer<T> = Arc::new(move |channel| block(channel).boxed());
    Flow {
        inner: FlowInner::Channelized(Arc::new(ChannelFlow {
            context: CoroutineContext::empty(),
            capacity: None,
            overflow: Overflow::Suspend,
            source: ChannelSource::Producer(producer),
        })),
    }
}

// ---------------------------------------------------------------------------
// Channel → flow bridge
// ---------------------------------------------------------------------------

struct ChannelAsFlow<E: Send + 'static> {
    channel: Channel<E>,
}

impl<E: Send + 'static> RawFlow<E> for ChannelAsFlow<E> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<E>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let mut iter = self.channel.iter();
            while let Some(item) = iter.next().await {
                collector.emit(item?).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// Extension surface bridging channels into flows.
pub trait ReceiveAsFlow<E: Send + 'static> {
    /// A flow over this channel's values: each value goes to exactly one
    /// collector, and a clean close completes the flow.
    fn receive_as_flow(&self) -> Flow<E>;
}

impl<E: Send + 'static> ReceiveAsFlow<E> for Channel<E> {
    fn receive_as_flow(&self) -> Flow<E> {
        Flow::plain(ChannelAsFlow {
            channel: self.clone(),
        })
    }
}
