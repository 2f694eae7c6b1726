//! Scopes and coroutine builders.
//!
//! A [`CoroutineScope`] is a context (job + dispatcher + extras) used as a
//! structured-concurrency root: every coroutine launched through it becomes a
//! child of the scope's job and cannot outlive it.
//!
//! # Builders
//!
//! * [`CoroutineScope::launch`] — fire-and-forget coroutine returning a
//!   [`JobHandle`]. Failures propagate to the parent; if the parent refuses
//!   them (supervisor or root), they are reported to the failure handler.
//! * [`CoroutineScope::spawn_deferred`] — coroutine with a result, returned
//!   as a [`Deferred`]. Failures surface only through `await_value`.
//! * [`run_blocking`] — blocking entry point: drives an event loop on the
//!   calling thread until the coroutine (and all its children) complete.
//! * [`coroutine_scope`] / [`supervisor_scope`] — suspending child scopes
//!   that complete only when every child has.
//! * [`with_context`] — run a block under a modified context, round-tripping
//!   through the target dispatcher when it changes.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::context::{CoroutineContext, FailureHandler};
use crate::dispatch::{default_dispatcher, Dispatcher, Runnable};
use crate::error::Failure;
use crate::job::JobHandle;
use crate::task::{current_context, ContextFuture, Task};

// ---------------------------------------------------------------------------
// Start modes
// ---------------------------------------------------------------------------

/// How a builder starts its coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Start {
    /// Dispatch the first slice immediately.
    #[default]
    Default,
    /// Defer dispatch until `start`, `join`, or `await_value`.
    Lazy,
    /// Like `Default`, but the body begins even if the job was cancelled
    /// before its first slice ran.
    Atomic,
    /// Run on the current thread up to the first suspension.
    Undispatched,
}

/// Per-launch options: extra context elements and a start mode.
#[derive(Default)]
pub struct LaunchOptions {
    pub context: CoroutineContext,
    pub start: Start,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: CoroutineContext) -> Self {
        self.context = context;
        self
    }

    pub fn start(mut self, start: Start) -> Self {
        self.start = start;
        self
    }
}

// ---------------------------------------------------------------------------
// CoroutineScope
// ---------------------------------------------------------------------------

/// A structured-concurrency root: a context whose job owns every coroutine
/// launched through this scope.
#[derive(Clone)]
pub struct CoroutineScope {
    context: CoroutineContext,
}

impl CoroutineScope {
    /// Build a scope from `context`, adding a fresh root job when the context
    /// does not already carry one.
    pub fn new(context: CoroutineContext) -> Self {
        let context = if context.job().is_some() {
            context
        } else {
            let job = JobHandle::new_job(None);
            context.with_job(job)
        };
        Self { context }
    }

    pub(crate) fn from_context(context: CoroutineContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &CoroutineContext {
        &self.context
    }

    /// The scope's job.
    pub fn job(&self) -> JobHandle {
        self.context.job().expect("scope context carries a job")
    }

    pub fn is_active(&self) -> bool {
        self.job().is_active()
    }

    /// Cancel the scope's job (and with it, every child).
    pub fn cancel(&self) {
        self.job().cancel();
    }

    pub fn cancel_with(&self, cause: Failure) {
        self.job().cancel_with(cause);
    }

    /// Launch a fire-and-forget coroutine in this scope.
    pub fn launch<F>(&self, body: F) -> JobHandle
    where
        F: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        self.launch_opts(LaunchOptions::new(), body)
    }

    /// Launch with explicit options.
    pub fn launch_opts<F>(&self, opts: LaunchOptions, body: F) -> JobHandle
    where
        F: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        let merged = self.context.plus(&opts.context);
        let job = JobHandle::new_coroutine(
            matches!(opts.start, Start::Lazy),
            false,
            true,
            false,
        );
        start_coroutine(merged, job.clone(), opts.start, body);
        job
    }

    /// Launch a coroutine that produces a value.
    pub fn spawn_deferred<T, F>(&self, body: F) -> Deferred<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        self.spawn_deferred_opts(LaunchOptions::new(), body)
    }

    /// Launch a value-producing coroutine with explicit options.
    pub fn spawn_deferred_opts<T, F>(&self, opts: LaunchOptions, body: F) -> Deferred<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let merged = self.context.plus(&opts.context);
        let job = JobHandle::new_coroutine(
            matches!(opts.start, Start::Lazy),
            false,
            false,
            false,
        );
        let value = Arc::new(Mutex::new(None));
        let value_in_body = Arc::clone(&value);
        let wrapped = async move {
            let result = body.await;
            let outcome = match &result {
                Ok(_) => Ok(()),
                Err(failure) => Err(failure.clone()),
            };
            *value_in_body.lock().unwrap() = Some(result);
            outcome
        };
        start_coroutine(merged, job.clone(), opts.start, wrapped);
        Deferred { job, value }
    }
}

/// Shared builder tail: wire the job into the tree, build the task, apply
/// the start mode.
fn start_coroutine<F>(merged: CoroutineContext, job: JobHandle, start: Start, body: F)
where
    F: Future<Output = Result<(), Failure>> + Send + 'static,
{
    job.set_name(merged.name());
    job.set_failure_handler(merged.get::<FailureHandler>());
    if let Some(parent) = merged.job() {
        parent.attach_child(&job);
    }
    let dispatcher = merged.dispatcher().unwrap_or_else(default_dispatcher);
    let task_context = merged
        .with_dispatcher(Arc::clone(&dispatcher))
        .with_job(job.clone());
    let task = Task::new(
        task_context,
        job.clone(),
        dispatcher,
        body,
        matches!(start, Start::Atomic),
    );
    match start {
        Start::Lazy => {
            let scheduled = task;
            job.set_on_start(move || scheduled.schedule());
        }
        Start::Undispatched => task.run_undispatched(),
        Start::Default | Start::Atomic => task.schedule(),
    }
}

// ---------------------------------------------------------------------------
// Deferred
// ---------------------------------------------------------------------------

/// A job carrying a future value.
#[derive(Clone)]
pub struct Deferred<T> {
    job: JobHandle,
    value: Arc<Mutex<Option<Result<T, Failure>>>>,
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// The lifecycle handle of the producing coroutine.
    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// Suspend until the value is available; rethrows the producer's failure.
    /// Starts a lazy producer.
    pub async fn await_value(&self) -> Result<T, Failure> {
        self.job.join().await?;
        match self
            .job
            .completion_outcome()
            .expect("job is terminal after join")
        {
            Err(failure) => Err(failure),
            Ok(()) => self
                .value
                .lock()
                .unwrap()
                .clone()
                .expect("completed deferred carries a value"),
        }
    }

    /// The terminal result without suspending, if already complete.
    pub fn try_value(&self) -> Option<Result<T, Failure>> {
        match self.job.completion_outcome()? {
            Err(failure) => Some(Err(failure)),
            Ok(()) => self.value.lock().unwrap().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// run_blocking
// ---------------------------------------------------------------------------

struct BlockingEventLoop {
    queue: Mutex<VecDeque<Runnable>>,
    ready: Condvar,
}

impl BlockingEventLoop {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn pop(&self) -> Option<Runnable> {
        self.queue.lock().unwrap().pop_front()
    }

    fn park_until_work_or(&self, done: &AtomicBool) {
        let mut queue = self.queue.lock().unwrap();
        while queue.is_empty() && !done.load(Ordering::Acquire) {
            queue = self.ready.wait(queue).unwrap();
        }
    }

    fn notify(&self) {
        let _queue = self.queue.lock().unwrap();
        self.ready.notify_all();
    }
}

impl Dispatcher for BlockingEventLoop {
    fn name(&self) -> &str {
        "weft-run-blocking"
    }

    fn dispatch(&self, _context: &CoroutineContext, task: Runnable) {
        self.queue.lock().unwrap().push_back(task);
        self.ready.notify_all();
    }
}

/// Run `body` to completion, blocking the calling thread.
///
/// The calling thread doubles as the coroutine's event loop unless the
/// context supplies a dispatcher. Returns once the coroutine *and all of its
/// children* have reached a terminal state; the body's failure is returned,
/// not reported.
pub fn run_blocking<T, F>(body: F) -> Result<T, Failure>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Failure>> + Send + 'static,
{
    run_blocking_with(CoroutineContext::empty(), body)
}

/// [`run_blocking`] with an explicit context.
pub fn run_blocking_with<T, F>(context: CoroutineContext, body: F) -> Result<T, Failure>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Failure>> + Send + 'static,
{
    let event_loop = Arc::new(BlockingEventLoop::new());
    let dispatcher: Arc<dyn Dispatcher> = match context.dispatcher() {
        Some(provided) => provided,
        None => Arc::clone(&event_loop) as Arc<dyn Dispatcher>,
    };

    let job = JobHandle::new_coroutine(false, true, false, false);
    job.set_name(context.name());
    if let Some(parent) = context.job() {
        parent.attach_child(&job);
    }

    let value = Arc::new(Mutex::new(None));
    let value_in_body = Arc::clone(&value);
    let wrapped = async move {
        let result = body.await;
        let outcome = match &result {
            Ok(_) => Ok(()),
            Err(failure) => Err(failure.clone()),
        };
        *value_in_body.lock().unwrap() = Some(result);
        outcome
    };

    let task_context = context
        .with_dispatcher(Arc::clone(&dispatcher))
        .with_job(job.clone());
    let task = Task::new(task_context, job.clone(), dispatcher, wrapped, false);

    let done = Arc::new(AtomicBool::new(false));
    let done_in_handler = Arc::clone(&done);
    let loop_in_handler = Arc::clone(&event_loop);
    job.invoke_on_completion(move |_| {
        done_in_handler.store(true, Ordering::Release);
        loop_in_handler.notify();
    });

    task.schedule();

    loop {
        if let Some(runnable) = event_loop.pop() {
            runnable.run();
            continue;
        }
        if done.load(Ordering::Acquire) {
            break;
        }
        event_loop.park_until_work_or(&done);
    }

    match job
        .completion_outcome()
        .expect("run_blocking job is terminal")
    {
        Err(failure) => Err(failure),
        Ok(()) => value
            .lock()
            .unwrap()
            .take()
            .expect("completed run_blocking carries a value"),
    }
}

// ---------------------------------------------------------------------------
// Child scopes
// ---------------------------------------------------------------------------

async fn scope_frame<T, F, Fut>(supervisor: bool, make_body: F) -> Result<T, Failure>
where
    F: FnOnce(CoroutineScope) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let parent_context = current_context().unwrap_or_default();
    let frame = JobHandle::new_coroutine(false, true, false, supervisor);
    frame.set_name(parent_context.name());
    if let Some(parent) = parent_context.job() {
        parent.attach_child(&frame);
    }
    let scope_context = parent_context.with_job(frame.clone());
    let scope = CoroutineScope::from_context(scope_context.clone());

    let body_result = ContextFuture::new(scope_context, make_body(scope)).await;
    let proposed = match &body_result {
        Ok(_) => Ok(()),
        Err(failure) => Err(failure.clone()),
    };
    frame.complete_with(proposed);
    // The frame reaches a terminal state only after every child has; outer
    // cancellation arrives through the parent link, so this always ends.
    frame.wait_terminal().await;

    match frame
        .completion_outcome()
        .expect("scope frame is terminal after wait")
    {
        Ok(()) => body_result,
        Err(failure) => Err(failure),
    }
}

/// Run `make_body` in a child scope. The call returns only when the body and
/// every coroutine launched in the scope have completed; a failure of any of
/// them cancels the rest and is rethrown here, not propagated to the parent.
pub async fn coroutine_scope<T, F, Fut>(make_body: F) -> Result<T, Failure>
where
    F: FnOnce(CoroutineScope) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    scope_frame(false, make_body).await
}

/// Like [`coroutine_scope`], but a failing child does not cancel the scope or
/// its siblings — each child handles (reports) its own failure.
pub async fn supervisor_scope<T, F, Fut>(make_body: F) -> Result<T, Failure>
where
    F: FnOnce(CoroutineScope) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    scope_frame(true, make_body).await
}

// ---------------------------------------------------------------------------
// with_context
// ---------------------------------------------------------------------------

/// Run `body` under the current context composed with `context`.
///
/// When the composition changes the dispatcher, the block round-trips: it
/// runs as a child coroutine on the target dispatcher and the caller resumes
/// on its own dispatcher once the block completes. Otherwise the block runs
/// in place under the merged context.
pub async fn with_context<T, F>(context: CoroutineContext, body: F) -> Result<T, Failure>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Failure>> + Send + 'static,
{
    let parent_context = current_context().unwrap_or_default();
    let merged = parent_context.plus(&context);

    let switches_dispatcher = match (parent_context.dispatcher(), merged.dispatcher()) {
        (Some(old), Some(new)) => !Arc::ptr_eq(&old, &new),
        (None, Some(_)) => true,
        _ => false,
    };

    if !switches_dispatcher {
        return ContextFuture::new(merged, body).await;
    }

    // Dispatcher switch: run as a scoped child coroutine over there.
    let job = JobHandle::new_coroutine(false, true, false, false);
    job.set_name(merged.name());
    if let Some(parent) = merged.job() {
        parent.attach_child(&job);
    }
    let value = Arc::new(Mutex::new(None));
    let value_in_body = Arc::clone(&value);
    let wrapped = async move {
        let result = body.await;
        let outcome = match &result {
            Ok(_) => Ok(()),
            Err(failure) => Err(failure.clone()),
        };
        *value_in_body.lock().unwrap() = Some(result);
        outcome
    };
    let dispatcher = merged.dispatcher().expect("dispatcher switch has a target");
    let task_context = merged.with_job(job.clone());
    let task = Task::new(task_context, job.clone(), dispatcher, wrapped, false);
    task.schedule();

    job.wait_terminal().await;
    match job
        .completion_outcome()
        .expect("with_context job is terminal after wait")
    {
        Err(failure) => Err(failure),
        Ok(()) => value
            .lock()
            .unwrap()
            .take()
            .expect("completed with_context carries a value"),
    }
}
