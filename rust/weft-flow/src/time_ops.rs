//! Time-based flow operators: `debounce`, `sample`, `timeout_each`.
//!
//! Each operator pumps the upstream into a channel from a child coroutine and
//! consumes it with a select over the channel and the timer, so the window
//! logic is a plain loop in the collecting coroutine. Cancelling the window
//! job (through scope cancellation) releases any scheduled timer task.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::channel::{Capacity, Channel};
use weft_core::error::{Failure, FailureKind};
use weft_core::scope::{coroutine_scope, CoroutineScope};
use weft_core::select::Select;

use crate::flow::{CollectorRef, Flow, FlowCollector, RawFlow};

/// Outcome of one select round in a window loop.
enum Step<T> {
    Value(T),
    Window,
}

/// Pump `upstream` into a fresh unlimited channel from a child coroutine of
/// `scope`; the close cause carries the upstream failure.
fn pump<T: Send + 'static>(scope: &CoroutineScope, upstream: Flow<T>) -> Channel<T> {
    struct SendingCollector<T: Send + 'static>(Channel<T>);

    #[async_trait::async_trait]
    impl<T: Send + 'static> FlowCollector<T> for SendingCollector<T> {
        async fn emit(&self, value: T) -> Result<(), Failure> {
            self.0.send(value).await
        }
    }

    let channel = Channel::new(Capacity::Unlimited);
    let producer_channel = channel.clone();
    scope.launch(async move {
        let sender: CollectorRef<T> = Arc::new(SendingCollector(producer_channel.clone()));
        match upstream.collect_with(sender).await {
            Ok(()) => {
                producer_channel.close();
                Ok(())
            }
            Err(failure) => {
                producer_channel.close_with(failure.clone());
                Err(failure)
            }
        }
    });
    channel
}

/// `true` when the failure is a clean end-of-channel.
fn is_clean_close(failure: &Failure) -> bool {
    matches!(failure.kind(), FailureKind::ClosedReceive) && failure.cause().is_none()
}

// ---------------------------------------------------------------------------
// debounce
// ---------------------------------------------------------------------------

struct DebounceFlow<T: Send + 'static> {
    upstream: Flow<T>,
    window: Duration,
}

impl<T: Send + 'static> RawFlow<T> for DebounceFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let window = self.window;
            let upstream = self.upstream.clone();
            coroutine_scope(move |scope| async move {
                let channel = pump(&scope, upstream);
                let mut pending: Option<T> = None;
                loop {
                    if pending.is_none() {
                        match channel.receive().await {
                            Ok(value) => pending = Some(value),
                            Err(failure) if is_clean_close(&failure) => break,
                            Err(failure) => return Err(failure),
                        }
                    } else {
                        let step = Select::new()
                            .on_receive(&channel, |value| Ok(Step::Value(value)))
                            .on_timeout(window, || Ok(Step::Window))
                            .run()
                            .await;
                        match step {
                            Ok(Step::Value(value)) => pending = Some(value),
                            Ok(Step::Window) => {
                                let value =
                                    pending.take().expect("window fires with a pending value");
                                collector.emit(value).await?;
                            }
                            Err(failure) if is_clean_close(&failure) => break,
                            Err(failure) => return Err(failure),
                        }
                    }
                }
                // The trailing value is emitted when the upstream completes.
                if let Some(value) = pending.take() {
                    collector.emit(value).await?;
                }
                Ok(())
            })
            .await
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// sample
// ---------------------------------------------------------------------------

struct SampleFlow<T: Send + 'static> {
    upstream: Flow<T>,
    period: Duration,
}

impl<T: Send + 'static> RawFlow<T> for SampleFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let period = self.period;
            let upstream = self.upstream.clone();
            coroutine_scope(move |scope| async move {
                let channel = pump(&scope, upstream);
                let mut latest: Option<T> = None;
                loop {
                    let step = Select::new()
                        .on_receive(&channel, |value| Ok(Step::Value(value)))
                        .on_timeout(period, || Ok(Step::Window))
                        .run()
                        .await;
                    match step {
                        Ok(Step::Value(value)) => latest = Some(value),
                        Ok(Step::Window) => {
                            if let Some(value) = latest.take() {
                                collector.emit(value).await?;
                            }
                        }
                        // No trailing emission: an unsampled tail is dropped.
                        Err(failure) if is_clean_close(&failure) => break,
                        Err(failure) => return Err(failure),
                    }
                }
                Ok(())
            })
            .await
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// timeout_each
// ---------------------------------------------------------------------------

struct TimeoutFlow<T: Send + 'static> {
    upstream: Flow<T>,
    each: Duration,
}

impl<T: Send + 'static> RawFlow<T> for TimeoutFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let each = self.each;
            let upstream = self.upstream.clone();
            coroutine_scope(move |scope| async move {
                let channel = pump(&scope, upstream);
                loop {
                    let step = Select::new()
                        .on_receive(&channel, |value| Ok(Step::Value(value)))
                        .on_timeout(each, move || {
                            Err::<Step<T>, _>(Failure::timed_out(each, 0))
                        })
                        .run()
                        .await;
                    match step {
                        Ok(Step::Value(value)) => collector.emit(value).await?,
                        Ok(Step::Window) => unreachable!("timeout clause never yields a window"),
                        Err(failure) if is_clean_close(&failure) => break,
                        Err(failure) => return Err(failure),
                    }
                }
                Ok(())
            })
            .await
        }
        .boxed()
    }
}

impl<T: Send + 'static> Flow<T> {
    /// Emit a value only after `window` has elapsed with no newer value.
    /// The final value is emitted when the upstream completes.
    pub fn debounce(&self, window: Duration) -> Flow<T> {
        Flow::plain(DebounceFlow {
            upstream: self.clone(),
            window,
        })
    }

    /// Emit the most recent value once per `period` (measured between
    /// emissions of this operator). Values superseded within a period are
    /// dropped; an unsampled tail is dropped at completion.
    pub fn sample(&self, period: Duration) -> Flow<T> {
        Flow::plain(SampleFlow {
            upstream: self.clone(),
            period,
        })
    }

    /// Fail with a timeout when the gap between upstream values (or before
    /// completion) exceeds `each`.
    pub fn timeout_each(&self, each: Duration) -> Flow<T> {
        Flow::plain(TimeoutFlow {
            upstream: self.clone(),
            each,
        })
    }
}
