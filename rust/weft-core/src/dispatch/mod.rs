//! Dispatchers — the policy objects that decide where a resumption runs.
//!
//! A [`Dispatcher`] receives [`Runnable`] slices of coroutines and delivers
//! them to threads. Four stock strategies are provided:
//!
//! * [`default_dispatcher`] — a work-stealing pool sized to the CPU count,
//!   the expected choice for compute work.
//! * [`io_dispatcher`] — an on-demand pool that grows well past the CPU count
//!   for blocking I/O and retires idle workers.
//! * [`unconfined_dispatcher`] — no thread switch; resumptions run on the
//!   resuming thread through a per-thread event loop that converts recursion
//!   into iteration.
//! * [`limited_parallelism`] — a view over any dispatcher that admits at
//!   most `n` tasks at once.
//!
//! # Ordering
//!
//! A single dispatcher delivers tasks in FIFO order to a single logical
//! worker. No order is promised across workers.

mod io;
mod limited;
mod pool;
mod unconfined;

pub use io::IoDispatcher;
pub use limited::LimitedDispatcher;
pub use pool::PoolDispatcher;
pub use unconfined::UnconfinedDispatcher;

pub(crate) use unconfined::run_or_enqueue;

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::context::{ContextElement, CoroutineContext, ElementKey, TypedElement};
use crate::error::Failure;
use crate::time::Delay;

// ---------------------------------------------------------------------------
// Runnable
// ---------------------------------------------------------------------------

/// A unit of work handed to a dispatcher — one slice of a coroutine between
/// two suspension points, or a housekeeping task of the runtime itself.
pub struct Runnable {
    f: Box<dyn FnOnce() + Send>,
}

impl Runnable {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// Execute the work. Consumes the runnable.
    pub fn run(self) {
        (self.f)()
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Runnable")
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Policy object deciding which thread runs a resumption.
pub trait Dispatcher: Send + Sync + 'static {
    /// Diagnostic name, used in thread names and failure reports.
    fn name(&self) -> &str;

    /// Whether a resumption arriving on the current thread must be enqueued
    /// (`true`) or may continue in place (`false`).
    fn needs_dispatch(&self, _context: &CoroutineContext) -> bool {
        true
    }

    /// Enqueue `task` for execution on this dispatcher's threads.
    fn dispatch(&self, context: &CoroutineContext, task: Runnable);

    /// Fairness variant of [`dispatch`](Self::dispatch): the task goes to the
    /// back of the shared queue rather than any fast-path slot, so peers get
    /// a chance to run. The interleaving relative to `dispatch` on a stealing
    /// pool is otherwise unspecified; callers must not depend on it.
    fn dispatch_yield(&self, context: &CoroutineContext, task: Runnable) {
        self.dispatch(context, task);
    }

    /// Delay capability, when this dispatcher can schedule timed resumes
    /// itself (virtual-time integrations override this). `None` falls back to
    /// the runtime's shared timer.
    fn delay(&self) -> Option<&dyn Delay> {
        None
    }
}

/// Wrap `dispatcher` so that at most `parallelism` tasks run concurrently;
/// excess tasks wait in a FIFO owned by the view.
pub fn limited_parallelism(
    dispatcher: Arc<dyn Dispatcher>,
    parallelism: usize,
) -> Arc<dyn Dispatcher> {
    Arc::new(LimitedDispatcher::new(dispatcher, parallelism))
}

/// Dispatch `task`, catching a panicking dispatcher.
///
/// A dispatcher that fails to accept work is a fatal runtime error: the
/// failure is routed to the context's failure handler and the task is lost.
pub(crate) fn dispatch_safely(
    dispatcher: &dyn Dispatcher,
    context: &CoroutineContext,
    task: Runnable,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(context, task)));
    if let Err(payload) = outcome {
        let failure = Failure::panicked(payload);
        tracing::error!(dispatcher = dispatcher.name(), failure = %failure, "dispatcher failed to accept a task");
        crate::context::handle_failure(context, &failure);
    }
}

// ---------------------------------------------------------------------------
// Context element
// ---------------------------------------------------------------------------

/// The context slot holding a coroutine's dispatcher. At most one per
/// context; composition replaces it wholesale.
#[derive(Clone)]
pub struct DispatcherElement(pub Arc<dyn Dispatcher>);

struct DispatcherKey;

impl ContextElement for DispatcherElement {
    fn key(&self) -> ElementKey {
        ElementKey::of::<DispatcherKey>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TypedElement for DispatcherElement {
    fn element_key() -> ElementKey {
        ElementKey::of::<DispatcherKey>()
    }
}

impl fmt::Debug for DispatcherElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatcherElement({})", self.0.name())
    }
}

impl CoroutineContext {
    /// The dispatcher element, if present.
    pub fn dispatcher(&self) -> Option<Arc<dyn Dispatcher>> {
        self.get::<DispatcherElement>().map(|d| d.0)
    }

    /// Shorthand for adding a dispatcher element.
    pub fn with_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> CoroutineContext {
        self.with(DispatcherElement(dispatcher))
    }
}

// ---------------------------------------------------------------------------
// Stock dispatchers
// ---------------------------------------------------------------------------

static DEFAULT: Lazy<Arc<PoolDispatcher>> =
    Lazy::new(|| Arc::new(PoolDispatcher::new(num_cpus::get().max(2), "weft-default")));

static IO: Lazy<Arc<IoDispatcher>> =
    Lazy::new(|| Arc::new(IoDispatcher::new(64.max(num_cpus::get()), "weft-io")));

static UNCONFINED: Lazy<Arc<UnconfinedDispatcher>> =
    Lazy::new(|| Arc::new(UnconfinedDispatcher::new()));

/// The shared compute pool, sized to the CPU count (minimum 2 workers).
pub fn default_dispatcher() -> Arc<dyn Dispatcher> {
    DEFAULT.clone() as Arc<dyn Dispatcher>
}

/// The shared blocking-I/O pool.
pub fn io_dispatcher() -> Arc<dyn Dispatcher> {
    IO.clone() as Arc<dyn Dispatcher>
}

/// The dispatcher that stays on the resuming thread.
pub fn unconfined_dispatcher() -> Arc<dyn Dispatcher> {
    UNCONFINED.clone() as Arc<dyn Dispatcher>
}
