//! Jobs — the lifecycle handles of the supervision tree.
//!
//! A [`JobHandle`] is a node in the parent/child graph that every coroutine
//! is launched into. The state machine is
//! New → Active → Completing → Completed, with Cancelling → Cancelled on the
//! failure path.
//!
//! # Invariants
//!
//! 1. A job reaches a terminal state at most once.
//! 2. A job reaches a terminal state only after every child has.
//! 3. Entering Cancelling with cause C cancels every active child with a
//!    cancellation failure caused by C.
//! 4. Once a job is cancelling, `is_active` stays false forever.
//!
//! A supervisor job relaxes failure propagation: a failing child does not
//! cancel the parent or its siblings; the child reports its own failure.
//!
//! All transitions run under one short-lived mutex per job. Cross-job calls
//! (cancelling children, notifying the parent) are collected while locked and
//! performed after unlock, so locks are never held across job boundaries.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::cancellable::suspend_cancellable;
use crate::context::{
    ContextElement, CoroutineContext, ElementKey, FailureHandler, TypedElement,
};
use crate::error::{report_unhandled, Failure};

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Coarse phase mirror kept in an atomic for lock-free queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    New = 0,
    Active = 1,
    Completing = 2,
    Cancelling = 3,
    Completed = 4,
    Cancelled = 5,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::New,
            1 => Phase::Active,
            2 => Phase::Completing,
            3 => Phase::Cancelling,
            4 => Phase::Completed,
            _ => Phase::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

type Handler = Box<dyn FnOnce(Option<&Failure>) + Send>;

struct HandlerEntry {
    id: u64,
    on_cancelling: bool,
    f: Option<Handler>,
}

struct ChildEntry {
    id: u64,
    core: Arc<JobCore>,
}

struct Running {
    started: bool,
    /// Cause installed when entering Cancelling. First cause wins; later
    /// causes attach as suppressed.
    cancel_cause: Option<Failure>,
    /// Outcome proposed by the body (or by `complete*`). Present means the
    /// job is completing and only waits for children.
    proposed: Option<Result<(), Failure>>,
    handlers: Vec<HandlerEntry>,
    children: Vec<ChildEntry>,
}

impl Running {
    /// Whether nothing further is expected from the body.
    fn settled(&self, core: &JobCore) -> bool {
        if self.proposed.is_some() {
            return true;
        }
        match &self.cancel_cause {
            None => false,
            // A body that already started will still deliver its outcome; an
            // unstarted or body-less job has nothing left to wait for.
            Some(_) => !core.wait_body || !self.started,
        }
    }
}

enum JobState {
    Running(Running),
    Terminal(Result<(), Failure>),
}

struct ParentLink {
    parent: Weak<JobCore>,
    child_id: u64,
}

pub(crate) struct JobCore {
    name: Mutex<Option<String>>,
    /// Child failures do not cancel this job or its other children.
    supervisor: bool,
    /// Completion requires an explicit proposed outcome from a running body.
    wait_body: bool,
    /// A coroutine frame: its failure is surfaced by an awaiter/caller, so
    /// descendants need not report.
    coroutine: bool,
    /// Failures are rethrown to the enclosing caller (scope frames, timeout
    /// frames) instead of propagating to the parent or being reported.
    scoped: bool,
    /// A root-style coroutine (launch): reports failures its parent refuses.
    reports: bool,
    failure_handler: Mutex<Option<FailureHandler>>,
    phase: AtomicU8,
    state: Mutex<JobState>,
    parent: Mutex<Option<ParentLink>>,
    on_start: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

static IDS: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    IDS.fetch_add(1, Ordering::Relaxed)
}

impl JobCore {
    fn new(
        supervisor: bool,
        wait_body: bool,
        coroutine: bool,
        scoped: bool,
        reports: bool,
        lazy: bool,
    ) -> Arc<JobCore> {
        Arc::new(JobCore {
            name: Mutex::new(None),
            supervisor,
            wait_body,
            coroutine,
            scoped,
            reports,
            failure_handler: Mutex::new(None),
            phase: AtomicU8::new(if lazy { Phase::New } else { Phase::Active } as u8),
            state: Mutex::new(JobState::Running(Running {
                started: !lazy,
                cancel_cause: None,
                proposed: None,
                handlers: Vec::new(),
                children: Vec::new(),
            })),
            parent: Mutex::new(None),
            on_start: Mutex::new(None),
        })
    }

    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Whether an ancestor coroutine frame will surface a propagated failure.
    fn lineage_handles_failures(self: &Arc<Self>) -> bool {
        let mut cursor = Arc::clone(self);
        loop {
            if cursor.coroutine {
                return true;
            }
            let parent = cursor
                .parent
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|l| l.parent.upgrade());
            match parent {
                Some(p) => cursor = p,
                None => return false,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deferred actions — work collected under the lock, run after unlock
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Actions {
    fire: Vec<(Handler, Option<Failure>)>,
    cancel_children: Vec<(Arc<JobCore>, Failure)>,
    finalized: Option<Result<(), Failure>>,
}

impl Actions {
    fn run(mut self, core: &Arc<JobCore>) {
        for (child, cause) in self.cancel_children.drain(..) {
            JobHandle { core: child }.cancel_core(cause);
        }
        for (handler, cause) in self.fire.drain(..) {
            invoke_handler(handler, cause.as_ref());
        }
        if let Some(outcome) = self.finalized.take() {
            after_finalize(core, outcome);
        }
    }
}

fn invoke_handler(handler: Handler, cause: Option<&Failure>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(cause))) {
        let failure = Failure::panicked(payload);
        tracing::error!(failure = %failure, "completion handler panicked");
        report_unhandled(None, &failure);
    }
}

/// Post-terminal bookkeeping: notify the parent, propagate or report the
/// failure, release the start hook.
fn after_finalize(core: &Arc<JobCore>, outcome: Result<(), Failure>) {
    core.on_start.lock().unwrap().take();
    let link = core.parent.lock().unwrap().take();
    let parent = link.as_ref().and_then(|l| l.parent.upgrade());

    if let Err(failure) = &outcome {
        if !failure.is_cancellation() && !core.scoped {
            let handled = match &parent {
                Some(p) => JobHandle { core: Arc::clone(p) }.child_failed(failure),
                None => false,
            };
            if !handled && core.reports {
                let handler = core.failure_handler.lock().unwrap().clone();
                match handler {
                    Some(h) => {
                        let ctx = CoroutineContext::of(h.clone());
                        let guarded =
                            catch_unwind(AssertUnwindSafe(|| h.handle(&ctx, failure)));
                        if let Err(payload) = guarded {
                            let name = core.name.lock().unwrap().clone();
                            report_unhandled(name.as_deref(), &Failure::panicked(payload));
                        }
                    }
                    None => {
                        let name = core.name.lock().unwrap().clone();
                        report_unhandled(name.as_deref(), failure)
                    }
                }
            }
        }
    }

    if let (Some(parent), Some(link)) = (parent, link) {
        parent.on_child_completed(link.child_id);
    }
}

impl JobCore {
    /// Remove a completed child and re-check completion.
    fn on_child_completed(self: &Arc<Self>, child_id: u64) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            if let JobState::Running(running) = &mut *state {
                running.children.retain(|c| c.id != child_id);
                try_finalize_locked(self, &mut state, &mut actions);
            }
        }
        actions.run(self);
    }
}

/// Finalize when settled and childless. Must be called with the state lock
/// held; fills `actions` with the follow-up work.
fn try_finalize_locked(
    core: &Arc<JobCore>,
    state: &mut JobState,
    actions: &mut Actions,
) {
    let running = match state {
        JobState::Running(r) => r,
        JobState::Terminal(_) => return,
    };
    if !running.settled(core) || !running.children.is_empty() {
        // Reflect the completing phase while waiting for children.
        if running.proposed.is_some() && running.cancel_cause.is_none() {
            core.set_phase(Phase::Completing);
        }
        return;
    }

    let outcome = match running.cancel_cause.take() {
        Some(primary) => {
            if let Some(Err(body)) = running.proposed.take() {
                if !body.same(&primary) && !body.is_cancellation() {
                    primary.add_suppressed(body);
                }
            }
            Err(primary)
        }
        None => running.proposed.take().unwrap_or(Ok(())),
    };

    for entry in running.handlers.drain(..) {
        if let Some(f) = entry.f {
            actions.fire.push((f, outcome.as_ref().err().cloned()));
        }
    }
    core.set_phase(match &outcome {
        Ok(()) => Phase::Completed,
        Err(_) => Phase::Cancelled,
    });
    actions.finalized = Some(outcome.clone());
    *state = JobState::Terminal(outcome);
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Shared handle to a job. Clones refer to the same node.
#[derive(Clone)]
pub struct JobHandle {
    core: Arc<JobCore>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({:?})", self.core.phase())
    }
}

impl JobHandle {
    /// A completable job with no body. `complete`/`cancel` drive it to its
    /// terminal state once its children finish.
    pub fn new_job(parent: Option<&JobHandle>) -> JobHandle {
        let handle = JobHandle {
            core: JobCore::new(false, false, false, false, false, false),
        };
        if let Some(parent) = parent {
            parent.attach_child(&handle);
        }
        handle
    }

    /// A completable job whose children fail independently.
    pub fn new_supervisor(parent: Option<&JobHandle>) -> JobHandle {
        let handle = JobHandle {
            core: JobCore::new(true, false, false, false, false, false),
        };
        if let Some(parent) = parent {
            parent.attach_child(&handle);
        }
        handle
    }

    /// A coroutine frame job. `reports` marks launch-style roots that surface
    /// refused failures; `scoped` marks frames that rethrow to their caller.
    pub(crate) fn new_coroutine(
        lazy: bool,
        scoped: bool,
        reports: bool,
        supervisor: bool,
    ) -> JobHandle {
        JobHandle {
            core: JobCore::new(supervisor, true, true, scoped, reports, lazy),
        }
    }

    pub(crate) fn set_failure_handler(&self, handler: Option<FailureHandler>) {
        *self.core.failure_handler.lock().unwrap() = handler;
    }

    pub(crate) fn set_name(&self, name: Option<String>) {
        *self.core.name.lock().unwrap() = name;
    }

    /// The job's diagnostic name, if one was set at launch.
    pub fn name(&self) -> Option<String> {
        self.core.name.lock().unwrap().clone()
    }

    pub(crate) fn set_on_start(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_completed() {
            return;
        }
        *self.core.on_start.lock().unwrap() = Some(Box::new(f));
    }

    /// `true` while the job can still do work: started and not (yet)
    /// cancelling or terminal.
    pub fn is_active(&self) -> bool {
        matches!(self.core.phase(), Phase::Active | Phase::Completing)
    }

    /// `true` once the job is cancelling or has been cancelled/failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.core.phase(), Phase::Cancelling | Phase::Cancelled)
    }

    /// `true` once the job reached either terminal state.
    pub fn is_completed(&self) -> bool {
        matches!(self.core.phase(), Phase::Completed | Phase::Cancelled)
    }

    /// Identity comparison.
    pub fn same(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// `true` when `ancestor` is this job or is reachable from it by walking
    /// up through *scope frames only* (`coroutine_scope`, `with_context`,
    /// timeout frames). A launched coroutine is a boundary: its job does not
    /// count as being "inside" the ancestor for this check, even though it is
    /// a descendant in the supervision tree.
    pub fn is_in_lineage_of(&self, ancestor: &JobHandle) -> bool {
        let mut cursor = Arc::clone(&self.core);
        loop {
            if Arc::ptr_eq(&cursor, &ancestor.core) {
                return true;
            }
            if !cursor.scoped {
                return false;
            }
            let parent = cursor
                .parent
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|l| l.parent.upgrade());
            match parent {
                Some(p) => cursor = p,
                None => return false,
            }
        }
    }

    /// Fail-fast poll point for CPU-bound loops.
    pub fn ensure_active(&self) -> Result<(), Failure> {
        match self.core.phase() {
            Phase::New | Phase::Active | Phase::Completing => Ok(()),
            _ => Err(self
                .cancellation_cause()
                .unwrap_or_else(Failure::cancelled)),
        }
    }

    /// The cancellation failure a suspension inside this job must observe,
    /// if any.
    pub(crate) fn cancellation_cause(&self) -> Option<Failure> {
        let state = self.core.state.lock().unwrap();
        match &*state {
            JobState::Running(r) => r
                .cancel_cause
                .as_ref()
                .map(|c| Failure::cancelled_by(c.clone())),
            JobState::Terminal(Err(f)) => Some(Failure::cancelled_by(f.clone())),
            JobState::Terminal(Ok(())) => {
                Some(Failure::cancelled_msg("job has already completed"))
            }
        }
    }

    /// Terminal outcome, once reached.
    pub fn completion_outcome(&self) -> Option<Result<(), Failure>> {
        match &*self.core.state.lock().unwrap() {
            JobState::Terminal(outcome) => Some(outcome.clone()),
            JobState::Running(_) => None,
        }
    }

    /// Start a lazily-created job. Returns `true` only when this call
    /// performed the transition out of New.
    pub fn start(&self) -> bool {
        {
            let mut state = self.core.state.lock().unwrap();
            match &mut *state {
                JobState::Running(r) if !r.started && r.cancel_cause.is_none() => {
                    r.started = true;
                    self.core.set_phase(Phase::Active);
                }
                _ => return false,
            }
        }
        let hook = self.core.on_start.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    /// Cancel with a plain cancellation signal.
    pub fn cancel(&self) {
        self.cancel_core(Failure::cancelled());
    }

    /// Cancel with an explicit cause.
    pub fn cancel_with(&self, cause: Failure) {
        self.cancel_core(cause);
    }

    /// Cancel every child without cancelling this job.
    pub fn cancel_children(&self, cause: Option<Failure>) {
        let cause = cause.unwrap_or_else(Failure::cancelled);
        for child in self.children() {
            child.cancel_core(Failure::cancelled_by(cause.clone()));
        }
    }

    fn cancel_core(&self, cause: Failure) {
        let mut actions = Actions::default();
        {
            let mut state = self.core.state.lock().unwrap();
            match &mut *state {
                JobState::Terminal(_) => return,
                JobState::Running(running) => {
                    match &running.cancel_cause {
                        Some(first) => {
                            // Idempotent: keep the first cause, attach the rest.
                            first.add_suppressed(cause);
                            return;
                        }
                        None => {
                            running.cancel_cause = Some(cause.clone());
                            self.core.set_phase(Phase::Cancelling);
                            let child_cause = Failure::cancelled_by(cause.clone());
                            for child in &running.children {
                                actions
                                    .cancel_children
                                    .push((Arc::clone(&child.core), child_cause.clone()));
                            }
                            for entry in running.handlers.iter_mut() {
                                if entry.on_cancelling {
                                    if let Some(f) = entry.f.take() {
                                        actions.fire.push((f, Some(cause.clone())));
                                    }
                                }
                            }
                        }
                    }
                    try_finalize_locked(&self.core, &mut state, &mut actions);
                }
            }
        }
        actions.run(&self.core);
    }

    /// Child failure arriving at this parent. Returns `true` when the failure
    /// is propagated (so the child must not report it itself).
    pub(crate) fn child_failed(&self, cause: &Failure) -> bool {
        if cause.is_cancellation() {
            return true;
        }
        if self.core.supervisor {
            return false;
        }
        self.cancel_core(cause.clone());
        self.core.lineage_handles_failures()
    }

    /// Propose this job's body outcome. Returns `false` when a terminal state
    /// was already reached.
    pub(crate) fn complete_with(&self, outcome: Result<(), Failure>) -> bool {
        let mut actions = Actions::default();
        let accepted;
        {
            let mut state = self.core.state.lock().unwrap();
            match &mut *state {
                JobState::Terminal(_) => return false,
                JobState::Running(running) => {
                    if running.proposed.is_some() {
                        return false;
                    }
                    // A failing body that is not already cancelling installs
                    // its failure as the cancellation cause so late-arriving
                    // children and handlers observe it.
                    if let Err(failure) = &outcome {
                        if running.cancel_cause.is_none() {
                            running.cancel_cause = Some(failure.clone());
                            self.core.set_phase(Phase::Cancelling);
                            let child_cause = Failure::cancelled_by(failure.clone());
                            for child in &running.children {
                                actions
                                    .cancel_children
                                    .push((Arc::clone(&child.core), child_cause.clone()));
                            }
                            for entry in running.handlers.iter_mut() {
                                if entry.on_cancelling {
                                    if let Some(f) = entry.f.take() {
                                        actions.fire.push((f, Some(failure.clone())));
                                    }
                                }
                            }
                        }
                    }
                    running.proposed = Some(outcome);
                    accepted = true;
                    try_finalize_locked(&self.core, &mut state, &mut actions);
                }
            }
        }
        actions.run(&self.core);
        accepted
    }

    /// Complete a body-less job normally (its children may still be running).
    pub fn complete(&self) -> bool {
        self.complete_with(Ok(()))
    }

    /// Complete a body-less job exceptionally.
    pub fn complete_exceptionally(&self, failure: Failure) -> bool {
        self.complete_with(Err(failure))
    }

    /// Register `handler` to run on completion (or on entering Cancelling
    /// when `on_cancelling` is set). Fires at most once, inline when the
    /// matching state was already reached and `invoke_immediately` holds.
    pub fn invoke_on_completion_opts(
        &self,
        on_cancelling: bool,
        invoke_immediately: bool,
        handler: impl FnOnce(Option<&Failure>) + Send + 'static,
    ) -> DisposableHandle {
        let id = next_id();
        let mut immediate: Option<Option<Failure>> = None;
        {
            let mut state = self.core.state.lock().unwrap();
            match &mut *state {
                JobState::Terminal(outcome) => {
                    immediate = Some(outcome.as_ref().err().cloned());
                }
                JobState::Running(running) => {
                    if on_cancelling && running.cancel_cause.is_some() {
                        immediate = Some(running.cancel_cause.clone());
                    } else {
                        running.handlers.push(HandlerEntry {
                            id,
                            on_cancelling,
                            f: Some(Box::new(handler)),
                        });
                        return DisposableHandle {
                            core: Arc::downgrade(&self.core),
                            id,
                        };
                    }
                }
            }
        }
        if let Some(cause) = immediate {
            if invoke_immediately {
                invoke_handler(Box::new(handler), cause.as_ref());
            }
        }
        DisposableHandle {
            core: Weak::new(),
            id,
        }
    }

    /// Register a completion handler.
    pub fn invoke_on_completion(
        &self,
        handler: impl FnOnce(Option<&Failure>) + Send + 'static,
    ) -> DisposableHandle {
        self.invoke_on_completion_opts(false, true, handler)
    }

    /// Register a handler that fires as soon as the job starts cancelling —
    /// the resource-release hook.
    pub fn on_cancelling(
        &self,
        handler: impl FnOnce(Option<&Failure>) + Send + 'static,
    ) -> DisposableHandle {
        self.invoke_on_completion_opts(true, true, handler)
    }

    /// Link `child` under this job. When this job is already cancelling or
    /// has failed, the child is cancelled with the same cause before any of
    /// its work can run — both paths go through this job's state lock, so the
    /// hand-off is race-free.
    pub fn attach_child(&self, child: &JobHandle) {
        let child_id = next_id();
        *child.core.parent.lock().unwrap() = Some(ParentLink {
            parent: Arc::downgrade(&self.core),
            child_id,
        });
        let cancel_now: Option<Failure>;
        {
            let mut state = self.core.state.lock().unwrap();
            match &mut *state {
                JobState::Running(running) => {
                    running.children.push(ChildEntry {
                        id: child_id,
                        core: Arc::clone(&child.core),
                    });
                    cancel_now = running
                        .cancel_cause
                        .as_ref()
                        .map(|c| Failure::cancelled_by(c.clone()));
                }
                JobState::Terminal(Err(f)) => {
                    cancel_now = Some(Failure::cancelled_by(f.clone()));
                }
                JobState::Terminal(Ok(())) => {
                    cancel_now = None;
                    *child.core.parent.lock().unwrap() = None;
                }
            }
        }
        if let Some(cause) = cancel_now {
            child.cancel_core(cause);
        }
    }

    /// Snapshot of the live children.
    pub fn children(&self) -> Vec<JobHandle> {
        match &*self.core.state.lock().unwrap() {
            JobState::Running(r) => r
                .children
                .iter()
                .map(|c| JobHandle {
                    core: Arc::clone(&c.core),
                })
                .collect(),
            JobState::Terminal(_) => Vec::new(),
        }
    }

    /// Wait for this job's terminal state without observing the caller's
    /// cancellation — the completion barrier used by scope frames. The wait
    /// still terminates under cancellation because the cancellation reaches
    /// this job through its parent link.
    pub(crate) fn wait_terminal(&self) -> WaitTerminal {
        WaitTerminal {
            job: self.clone(),
            waker: Arc::new(Mutex::new(None)),
            registered: false,
        }
    }

    /// Suspend until this job reaches a terminal state. Starts a lazy job.
    /// Returns the *caller's* cancellation, never the target's failure.
    pub async fn join(&self) -> Result<(), Failure> {
        self.start();
        let target = self.clone();
        suspend_cancellable(move |cc| {
            let resume_cc = cc.clone();
            let handle = target.invoke_on_completion(move |_| {
                resume_cc.resume(Ok(()));
            });
            cc.invoke_on_cancellation(move |_| handle.dispose());
        })
        .await
    }
}

/// Future returned by [`JobHandle::wait_terminal`].
#[must_use = "futures do nothing unless awaited"]
pub(crate) struct WaitTerminal {
    job: JobHandle,
    waker: Arc<Mutex<Option<std::task::Waker>>>,
    registered: bool,
}

impl std::future::Future for WaitTerminal {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        if self.job.is_completed() {
            return std::task::Poll::Ready(());
        }
        *self.waker.lock().unwrap() = Some(cx.waker().clone());
        if !self.registered {
            self.registered = true;
            let waker = Arc::clone(&self.waker);
            self.job.invoke_on_completion(move |_| {
                if let Some(waker) = waker.lock().unwrap().take() {
                    waker.wake();
                }
            });
        }
        if self.job.is_completed() {
            return std::task::Poll::Ready(());
        }
        std::task::Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// DisposableHandle
// ---------------------------------------------------------------------------

/// Registration receipt: disposing removes the handler if it has not fired.
pub struct DisposableHandle {
    core: Weak<JobCore>,
    id: u64,
}

impl DisposableHandle {
    /// A handle whose `dispose` does nothing.
    pub fn noop() -> DisposableHandle {
        DisposableHandle {
            core: Weak::new(),
            id: 0,
        }
    }

    pub fn dispose(&self) {
        if let Some(core) = self.core.upgrade() {
            let mut state = core.state.lock().unwrap();
            if let JobState::Running(running) = &mut *state {
                running.handlers.retain(|h| h.id != self.id);
            }
        }
    }
}

impl fmt::Debug for DisposableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DisposableHandle")
    }
}

// ---------------------------------------------------------------------------
// Context element
// ---------------------------------------------------------------------------

/// The context slot carrying a coroutine's job.
#[derive(Clone, Debug)]
pub struct JobElement(pub JobHandle);

struct JobKey;

impl ContextElement for JobElement {
    fn key(&self) -> ElementKey {
        ElementKey::of::<JobKey>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TypedElement for JobElement {
    fn element_key() -> ElementKey {
        ElementKey::of::<JobKey>()
    }
}

impl CoroutineContext {
    /// The job element, if present.
    pub fn job(&self) -> Option<JobHandle> {
        self.get::<JobElement>().map(|j| j.0)
    }

    /// Shorthand for adding a job element.
    pub fn with_job(&self, job: JobHandle) -> CoroutineContext {
        self.with(JobElement(job))
    }
}
