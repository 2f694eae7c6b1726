//! Cancellable continuations — the single suspension primitive.
//!
//! Every suspension point in the runtime is a [`suspend_cancellable`] call:
//! the block receives a [`CancellableContinuation`] handle, parks it
//! somewhere (a channel cell, a timer entry, a job handler list), and the
//! future suspends until a producer resumes the handle or cancellation wins.
//!
//! The decision is a single cell transitioned under one lock acquisition:
//!
//! * Active → Resumed(value) — the producer won; delivery follows.
//! * Active → Cancelled(cause) — cancellation won; the parked cancellation
//!   handler fires exactly once.
//! * Active → Reserved(value) — a select reserved the cell without
//!   committing; `complete_resume` finishes the transition.
//!
//! Terminal states are sticky. `cancel` after a resume returns `false`;
//! `resume` after a cancel is silently discarded (the value is re-routed
//! through the undelivered callback when one was supplied). A second resume
//! is a programming error and panics.
//!
//! # Prompt cancellation
//!
//! A resume decides the cell, but delivery happens when the suspended task is
//! next polled. If the owning job is cancelled in between, the value is
//! discarded (through the undelivered callback) and the suspension returns
//! the cancellation failure instead: a suspended call that observed
//! cancellation never returns a value.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{report_unhandled, Failure};
use crate::job::{DisposableHandle, JobHandle};
use crate::task::current_job;

type CancelHandler = Box<dyn FnOnce(&Failure) + Send>;
pub(crate) type Undelivered<T> = Box<dyn FnOnce(T) + Send>;

enum CellState<T> {
    Active {
        waker: Option<Waker>,
        cancel_handler: Option<CancelHandler>,
    },
    /// Reserved by `try_resume`; not yet observable by the suspended task.
    Reserved {
        value: Result<T, Failure>,
        on_undelivered: Option<Undelivered<T>>,
        waker: Option<Waker>,
    },
    /// Claimed by a peer for an atomic hand-off; the value arrives with
    /// `complete_claim`, or the claim is released. A cancellation arriving
    /// meanwhile is recorded and applied if the claim is released.
    Claimed {
        waker: Option<Waker>,
        cancel_handler: Option<CancelHandler>,
        pending_cancel: Option<Failure>,
    },
    Resumed {
        value: Result<T, Failure>,
        on_undelivered: Option<Undelivered<T>>,
    },
    Cancelled(Failure),
    /// Value delivered to the suspended task.
    Taken,
}

struct Cell<T> {
    state: Mutex<CellState<T>>,
}

impl<T: Send + 'static> Cell<T> {
    fn new() -> Arc<Self> {
        Arc::new(Cell {
            state: Mutex::new(CellState::Active {
                waker: None,
                cancel_handler: None,
            }),
        })
    }
}

fn invoke_cancel_handler(handler: CancelHandler, cause: &Failure) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(cause))) {
        let failure = Failure::panicked(payload);
        tracing::error!(failure = %failure, "cancellation handler panicked");
        report_unhandled(None, &failure);
    }
}

// ---------------------------------------------------------------------------
// CancellableContinuation
// ---------------------------------------------------------------------------

/// Resumption handle for a parked suspension. Clones refer to the same cell.
pub struct CancellableContinuation<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for CancellableContinuation<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for CancellableContinuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancellableContinuation")
    }
}

/// Receipt for a reserved resume; see
/// [`CancellableContinuation::try_resume`].
#[derive(Debug)]
#[must_use]
pub struct ResumeToken {
    _private: (),
}

impl<T: Send + 'static> CancellableContinuation<T> {
    /// Resume the suspension with `value`.
    ///
    /// Resuming an already-cancelled continuation discards the value.
    /// Resuming twice panics — that is a bug in the caller.
    pub fn resume(&self, value: Result<T, Failure>) {
        self.resume_with_undelivered(value, None::<fn(T)>)
    }

    /// Resume with a callback that receives the value back if it is never
    /// delivered (the continuation was cancelled, or cancellation lands
    /// before delivery). Producers handing over owned resources use this to
    /// avoid losing them.
    pub fn resume_with_undelivered(
        &self,
        value: Result<T, Failure>,
        on_undelivered: Option<impl FnOnce(T) + Send + 'static>,
    ) {
        let on_undelivered: Option<Undelivered<T>> =
            on_undelivered.map(|f| Box::new(f) as Undelivered<T>);
        let waker;
        {
            let mut state = self.cell.state.lock().unwrap();
            match &mut *state {
                CellState::Active {
                    waker: parked_waker,
                    ..
                } => {
                    waker = parked_waker.take();
                    *state = CellState::Resumed {
                        value,
                        on_undelivered,
                    };
                }
                CellState::Cancelled(_) => {
                    drop(state);
                    if let (Ok(v), Some(f)) = (value, on_undelivered) {
                        f(v);
                    }
                    return;
                }
                CellState::Reserved { .. }
                | CellState::Claimed { .. }
                | CellState::Resumed { .. }
                | CellState::Taken => {
                    panic!("continuation resumed twice");
                }
            }
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Attempt to cancel the suspension. Returns `true` only when this call
    /// won the race against a resume; the parked cancellation handler fires
    /// before the suspended task observes the failure.
    pub fn cancel(&self, cause: Failure) -> bool {
        let waker;
        let handler;
        {
            let mut state = self.cell.state.lock().unwrap();
            match &mut *state {
                CellState::Active {
                    waker: parked_waker,
                    cancel_handler,
                } => {
                    waker = parked_waker.take();
                    handler = cancel_handler.take();
                    *state = CellState::Cancelled(cause.clone());
                }
                CellState::Claimed { pending_cancel, .. } => {
                    // The claimant decides; the cancellation is applied only
                    // if the claim is released.
                    if let Some(first) = pending_cancel {
                        first.add_suppressed(cause);
                    } else {
                        *pending_cancel = Some(cause);
                    }
                    return false;
                }
                _ => return false,
            }
        }
        if let Some(handler) = handler {
            invoke_cancel_handler(handler, &cause);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Install the handler that fires exactly once if the suspension is
    /// cancelled. Installing a second handler panics. Installing after the
    /// cell is already cancelled fires the handler inline; installing after a
    /// resume is reported as an illegal state (the handler can never fire).
    pub fn invoke_on_cancellation(&self, handler: impl FnOnce(&Failure) + Send + 'static) {
        let run_now: Option<Failure>;
        {
            let mut state = self.cell.state.lock().unwrap();
            match &mut *state {
                CellState::Active { cancel_handler, .. }
                | CellState::Claimed { cancel_handler, .. } => {
                    if cancel_handler.is_some() {
                        panic!("a cancellation handler is already installed");
                    }
                    *cancel_handler = Some(Box::new(handler));
                    return;
                }
                CellState::Cancelled(cause) => {
                    run_now = Some(cause.clone());
                }
                CellState::Reserved { .. } | CellState::Resumed { .. } | CellState::Taken => {
                    run_now = None;
                }
            }
        }
        match run_now {
            Some(cause) => invoke_cancel_handler(Box::new(handler), &cause),
            None => {
                let failure =
                    Failure::app("cancellation handler installed after completion");
                tracing::error!("cancellation handler installed after completion");
                report_unhandled(None, &failure);
            }
        }
    }

    /// Reserve the resume without committing it. Used by select clauses to
    /// claim the continuation atomically and finish channel bookkeeping
    /// before waking anyone. Returns `None` when the cell is no longer
    /// active.
    pub fn try_resume(
        &self,
        value: Result<T, Failure>,
        on_undelivered: Option<impl FnOnce(T) + Send + 'static>,
    ) -> Option<ResumeToken> {
        let mut state = self.cell.state.lock().unwrap();
        match &mut *state {
            CellState::Active {
                waker,
                cancel_handler: _,
            } => {
                let waker = waker.take();
                *state = CellState::Reserved {
                    value,
                    on_undelivered: on_undelivered.map(|f| Box::new(f) as Undelivered<T>),
                    waker,
                };
                Some(ResumeToken { _private: () })
            }
            _ => None,
        }
    }

    /// Commit a reservation made by [`try_resume`](Self::try_resume).
    pub fn complete_resume(&self, token: ResumeToken) {
        let _ = token;
        let waker;
        {
            let mut state = self.cell.state.lock().unwrap();
            match std::mem::replace(
                &mut *state,
                CellState::Active {
                    waker: None,
                    cancel_handler: None,
                },
            ) {
                CellState::Reserved {
                    value,
                    on_undelivered,
                    waker: parked_waker,
                } => {
                    waker = parked_waker;
                    *state = CellState::Resumed {
                        value,
                        on_undelivered,
                    };
                }
                other => {
                    *state = other;
                    panic!("complete_resume without a live reservation");
                }
            }
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Try to claim the cell for an atomic hand-off. A claim is a state
    /// transition, not a held lock: the claimant either completes it with a
    /// value or releases it, and no other party can decide the cell in
    /// between. `Busy` means another claimant holds the cell right now —
    /// claims are short-lived, so callers retry or move on.
    pub(crate) fn try_claim(&self) -> Claim {
        let mut state = self.cell.state.lock().unwrap();
        match &mut *state {
            CellState::Active {
                waker,
                cancel_handler,
            } => {
                let claimed = CellState::Claimed {
                    waker: waker.take(),
                    cancel_handler: cancel_handler.take(),
                    pending_cancel: None,
                };
                *state = claimed;
                Claim::Token(ClaimToken { _private: () })
            }
            CellState::Claimed { .. } => Claim::Busy,
            _ => Claim::Decided,
        }
    }

    /// Commit a claim with the hand-off outcome. Returns the parked waker;
    /// the caller wakes it after releasing its own locks.
    pub(crate) fn complete_claim(
        &self,
        token: ClaimToken,
        value: Result<T, Failure>,
        on_undelivered: Option<Undelivered<T>>,
    ) -> Option<Waker> {
        let _ = token;
        let mut state = self.cell.state.lock().unwrap();
        match std::mem::replace(
            &mut *state,
            CellState::Resumed {
                value,
                on_undelivered,
            },
        ) {
            CellState::Claimed { waker, .. } => waker,
            _ => unreachable!("complete_claim without a live claim"),
        }
    }

    /// Release a claim without deciding the cell. A cancellation that arrived
    /// while the claim was held is applied now. Returns a waker to wake when
    /// the release settled the cell.
    pub(crate) fn release_claim(&self, token: ClaimToken) -> Option<Waker> {
        let _ = token;
        let waker;
        let fire: Option<(CancelHandler, Failure)>;
        {
            let mut state = self.cell.state.lock().unwrap();
            let previous = std::mem::replace(
                &mut *state,
                CellState::Taken, // placeholder, replaced below
            );
            match previous {
                CellState::Claimed {
                    waker: parked_waker,
                    cancel_handler,
                    pending_cancel: Some(cause),
                } => {
                    *state = CellState::Cancelled(cause.clone());
                    waker = parked_waker;
                    fire = cancel_handler.map(|h| (h, cause));
                }
                CellState::Claimed {
                    waker: parked_waker,
                    cancel_handler,
                    pending_cancel: None,
                } => {
                    *state = CellState::Active {
                        waker: parked_waker,
                        cancel_handler,
                    };
                    waker = None;
                    fire = None;
                }
                _ => unreachable!("release_claim without a live claim"),
            }
        }
        if let Some((handler, cause)) = fire {
            invoke_cancel_handler(handler, &cause);
            return waker;
        }
        None
    }

    /// Claim and complete in one step, retrying through transient peer
    /// claims. `Err` hands the outcome back when the cell is already decided.
    pub(crate) fn try_resume_now(
        &self,
        value: Result<T, Failure>,
        on_undelivered: Option<Undelivered<T>>,
    ) -> Result<Option<Waker>, Result<T, Failure>> {
        loop {
            match self.try_claim() {
                Claim::Token(token) => {
                    return Ok(self.complete_claim(token, value, on_undelivered));
                }
                Claim::Busy => std::thread::yield_now(),
                Claim::Decided => return Err(value),
            }
        }
    }

    /// `true` while no decision has been made.
    pub fn is_active(&self) -> bool {
        matches!(&*self.cell.state.lock().unwrap(), CellState::Active { .. })
    }

    /// `true` once cancellation won the cell.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.cell.state.lock().unwrap(), CellState::Cancelled(_))
    }
}

/// Outcome of [`CancellableContinuation::try_claim`].
pub(crate) enum Claim {
    Token(ClaimToken),
    /// Another claimant holds the cell; retry shortly or move on.
    Busy,
    /// The cell is already resumed or cancelled.
    Decided,
}

/// Receipt for a held claim; must be completed or released.
#[must_use]
pub(crate) struct ClaimToken {
    _private: (),
}

// ---------------------------------------------------------------------------
// The suspension future
// ---------------------------------------------------------------------------

/// Suspend the current coroutine, exposing the continuation to `block`.
///
/// The block runs once, on first poll, after the suspension is wired to the
/// ambient job for cancellation. If the job is already cancelled the block
/// never runs and the cancellation failure is returned directly.
pub fn suspend_cancellable<T, F>(block: F) -> SuspendCancellable<T, F>
where
    T: Send + 'static,
    F: FnOnce(CancellableContinuation<T>),
{
    SuspendCancellable {
        block: Some(block),
        cell: None,
        job_registration: None,
    }
}

/// Future returned by [`suspend_cancellable`].
#[must_use = "futures do nothing unless awaited"]
pub struct SuspendCancellable<T, F> {
    block: Option<F>,
    cell: Option<Arc<Cell<T>>>,
    job_registration: Option<(JobHandle, DisposableHandle)>,
}

impl<T, F> Unpin for SuspendCancellable<T, F> {}

impl<T, F> Future for SuspendCancellable<T, F>
where
    T: Send + 'static,
    F: FnOnce(CancellableContinuation<T>),
{
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(block) = this.block.take() {
            let job = current_job();
            if let Some(job) = &job {
                if let Some(cause) = job.cancellation_cause() {
                    if job.is_cancelled() {
                        return Poll::Ready(Err(cause));
                    }
                }
            }
            let cell = Cell::new();
            this.cell = Some(Arc::clone(&cell));
            if let Some(job) = job {
                let cancel_cell = Arc::clone(&cell);
                let registration = job.invoke_on_completion_opts(true, true, move |cause| {
                    if let Some(cause) = cause {
                        let continuation = CancellableContinuation { cell: cancel_cell };
                        continuation.cancel(Failure::cancelled_by(cause.clone()));
                    }
                });
                this.job_registration = Some((job, registration));
            }
            block(CancellableContinuation {
                cell: Arc::clone(&cell),
            });
        }

        let cell = Arc::clone(this.cell.as_ref().expect("suspension polled before start"));
        let mut state = cell.state.lock().unwrap();
        match &mut *state {
            CellState::Active { waker, .. }
            | CellState::Reserved { waker, .. }
            | CellState::Claimed { waker, .. } => {
                *waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            CellState::Taken => panic!("suspension polled after completion"),
            CellState::Cancelled(_) | CellState::Resumed { .. } => {}
        }
        let decided = std::mem::replace(&mut *state, CellState::Taken);
        drop(state);
        match decided {
            CellState::Cancelled(cause) => {
                this.release_registration();
                Poll::Ready(Err(cause))
            }
            CellState::Resumed {
                value,
                on_undelivered,
            } => {
                // Prompt cancellation: a cancelled job discards the resumed
                // value at delivery time.
                let prompt_cancel = this
                    .job_registration
                    .as_ref()
                    .filter(|(job, _)| job.is_cancelled())
                    .map(|(job, _)| job.cancellation_cause().unwrap_or_else(Failure::cancelled));
                this.release_registration();
                match prompt_cancel {
                    Some(cause) => {
                        if let (Ok(v), Some(f)) = (value, on_undelivered) {
                            f(v);
                        }
                        Poll::Ready(Err(cause))
                    }
                    None => Poll::Ready(value),
                }
            }
            _ => unreachable!(),
        }
    }
}

impl<T, F> SuspendCancellable<T, F> {
    fn release_registration(&mut self) {
        if let Some((_, registration)) = self.job_registration.take() {
            registration.dispose();
        }
    }
}

impl<T, F> Drop for SuspendCancellable<T, F> {
    fn drop(&mut self) {
        // A future dropped mid-suspension abandons its parked waiter; cancel
        // the cell so whoever holds the continuation can clean up.
        if let Some(cell) = self.cell.take() {
            let mut state = cell.state.lock().unwrap();
            if matches!(&*state, CellState::Active { .. } | CellState::Resumed { .. }) {
                let cause = Failure::cancelled_msg("suspension was dropped");
                let decided =
                    std::mem::replace(&mut *state, CellState::Cancelled(cause.clone()));
                drop(state);
                match decided {
                    CellState::Active { cancel_handler, .. } => {
                        if let Some(handler) = cancel_handler {
                            invoke_cancel_handler(handler, &cause);
                        }
                    }
                    CellState::Resumed {
                        value,
                        on_undelivered,
                    } => {
                        if let (Ok(v), Some(f)) = (value, on_undelivered) {
                            f(v);
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }
        self.release_registration();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn poll_once<T: Send + 'static, F: FnOnce(CancellableContinuation<T>)>(
        future: &mut SuspendCancellable<T, F>,
    ) -> Poll<Result<T, Failure>> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn resume_before_poll_completes_immediately() {
        let mut fut = suspend_cancellable(|cc: CancellableContinuation<u32>| {
            cc.resume(Ok(7));
        });
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(7))));
    }

    #[test]
    fn resume_after_poll_delivers_on_next_poll() {
        let slot: Arc<Mutex<Option<CancellableContinuation<u32>>>> =
            Arc::new(Mutex::new(None));
        let slot_in_block = Arc::clone(&slot);
        let mut fut = suspend_cancellable(move |cc| {
            *slot_in_block.lock().unwrap() = Some(cc);
        });
        assert!(poll_once(&mut fut).is_pending());
        slot.lock().unwrap().as_ref().unwrap().resume(Ok(11));
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(11))));
    }

    #[test]
    fn cancel_wins_over_later_resume() {
        let slot: Arc<Mutex<Option<CancellableContinuation<u32>>>> =
            Arc::new(Mutex::new(None));
        let slot_in_block = Arc::clone(&slot);
        let mut fut = suspend_cancellable(move |cc| {
            *slot_in_block.lock().unwrap() = Some(cc);
        });
        assert!(poll_once(&mut fut).is_pending());
        let cc = slot.lock().unwrap().clone().unwrap();
        assert!(cc.cancel(Failure::cancelled()));
        // The late resume is discarded, its value re-routed.
        let undelivered = Arc::new(Mutex::new(None));
        let undelivered_in_cb = Arc::clone(&undelivered);
        cc.resume_with_undelivered(
            Ok(5),
            Some(move |v| *undelivered_in_cb.lock().unwrap() = Some(v)),
        );
        assert_eq!(*undelivered.lock().unwrap(), Some(5));
        match poll_once(&mut fut) {
            Poll::Ready(Err(f)) => assert!(f.is_cancellation()),
            other => panic!("unexpected poll outcome: {other:?}"),
        }
    }

    #[test]
    fn cancel_after_resume_returns_false() {
        let mut fut = suspend_cancellable(|cc: CancellableContinuation<u32>| {
            cc.resume(Ok(1));
            assert!(!cc.cancel(Failure::cancelled()));
        });
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(1))));
    }

    #[test]
    #[should_panic(expected = "resumed twice")]
    fn double_resume_panics() {
        let mut fut = suspend_cancellable(|cc: CancellableContinuation<u32>| {
            cc.resume(Ok(1));
            cc.resume(Ok(2));
        });
        let _ = poll_once(&mut fut);
    }

    #[test]
    fn cancellation_handler_fires_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = Arc::clone(&hits);
        let slot: Arc<Mutex<Option<CancellableContinuation<u32>>>> =
            Arc::new(Mutex::new(None));
        let slot_in_block = Arc::clone(&slot);
        let mut fut = suspend_cancellable(move |cc| {
            cc.invoke_on_cancellation(move |_| {
                hits_in_handler.fetch_add(1, Ordering::SeqCst);
            });
            *slot_in_block.lock().unwrap() = Some(cc);
        });
        assert!(poll_once(&mut fut).is_pending());
        let cc = slot.lock().unwrap().clone().unwrap();
        assert!(cc.cancel(Failure::cancelled()));
        assert!(!cc.cancel(Failure::cancelled()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "already installed")]
    fn second_cancellation_handler_panics() {
        let mut fut = suspend_cancellable(|cc: CancellableContinuation<u32>| {
            cc.invoke_on_cancellation(|_| {});
            cc.invoke_on_cancellation(|_| {});
        });
        let _ = poll_once(&mut fut);
    }

    #[test]
    fn reserve_then_commit_resumes() {
        let slot: Arc<Mutex<Option<CancellableContinuation<u32>>>> =
            Arc::new(Mutex::new(None));
        let slot_in_block = Arc::clone(&slot);
        let mut fut = suspend_cancellable(move |cc| {
            *slot_in_block.lock().unwrap() = Some(cc);
        });
        assert!(poll_once(&mut fut).is_pending());
        let cc = slot.lock().unwrap().clone().unwrap();
        let token = cc.try_resume(Ok(9), None::<fn(u32)>).unwrap();
        // Reserved: a competing cancel loses.
        assert!(!cc.cancel(Failure::cancelled()));
        // A competing reservation loses too.
        assert!(cc.try_resume(Ok(10), None::<fn(u32)>).is_none());
        cc.complete_resume(token);
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(9))));
    }

    #[test]
    fn dropping_suspended_future_cancels_cell() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = Arc::clone(&hits);
        let slot: Arc<Mutex<Option<CancellableContinuation<u32>>>> =
            Arc::new(Mutex::new(None));
        let slot_in_block = Arc::clone(&slot);
        let mut fut = suspend_cancellable(move |cc| {
            cc.invoke_on_cancellation(move |_| {
                hits_in_handler.fetch_add(1, Ordering::SeqCst);
            });
            *slot_in_block.lock().unwrap() = Some(cc);
        });
        assert!(poll_once(&mut fut).is_pending());
        drop(fut);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let cc = slot.lock().unwrap().clone().unwrap();
        assert!(cc.is_cancelled());
    }
}
