//! Weft core — a structured-concurrency runtime.
//!
//! Provides the supervised job tree, pluggable dispatchers, cancellable
//! suspensions, channels, select, timers, and synchronisation primitives
//! that the reactive layer (`weft-flow`) builds on.
#![warn(clippy::all)]

pub mod cancellable;
pub mod channel;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod probes;
pub mod scope;
pub mod select;
pub mod sync;
pub mod task;
pub mod time;

pub use cancellable::{suspend_cancellable, CancellableContinuation};
pub use channel::{Capacity, Channel, ChannelIter, Overflow, TryReceiveError, TrySendError};
pub use context::{
    handle_failure, ContextElement, CoroutineContext, CoroutineName, ElementKey, FailureHandler,
    ThreadContextElement, TypedElement,
};
pub use dispatch::{
    default_dispatcher, io_dispatcher, limited_parallelism, unconfined_dispatcher, Dispatcher,
    DispatcherElement, IoDispatcher, LimitedDispatcher, PoolDispatcher, Runnable,
    UnconfinedDispatcher,
};
pub use error::{BoxError, Failure, FailureKind};
pub use job::{DisposableHandle, JobElement, JobHandle};
pub use scope::{
    coroutine_scope, run_blocking, run_blocking_with, supervisor_scope, with_context,
    CoroutineScope, Deferred, LaunchOptions, Start,
};
pub use select::Select;
pub use sync::{Mutex, Semaphore};
pub use task::{current_context, current_job, yield_now};
pub use time::{delay, with_timeout, with_timeout_or_null, Delay, TimerHandle};
