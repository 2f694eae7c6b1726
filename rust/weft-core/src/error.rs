//! Failure values that cross suspension boundaries.
//!
//! Every coroutine completes with a `Result<T, Failure>`. A [`Failure`] is a
//! cheap, clonable (`Arc`-backed) value so the same failure instance can be
//! observed by an awaiting parent, attached as a suppressed sibling, and
//! reported to a handler without copying.
//!
//! # Cancellation is control flow
//!
//! Failures whose [`FailureKind`] is a cancellation ([`Cancelled`],
//! [`TimedOut`], [`FlowAborted`]) are a cooperative shutdown signal, not an
//! error condition: they terminate the coroutine that observes them but are
//! never forwarded to the unhandled-failure reporter.
//!
//! # Invariants
//!
//! 1. Cancellation is idempotent — the first accepted cause stays primary and
//!    later causes are attached via [`add_suppressed`](Failure::add_suppressed).
//! 2. [`same`](Failure::same) identity (not structural equality) decides
//!    whether two failures are one instance; aggregation never suppresses a
//!    failure against itself.
//! 3. [`with_origin`](Failure::with_origin) annotates a copy and keeps the
//!    original reachable through [`cause`](Failure::cause) — stack continuity
//!    is restored without losing the original value.
//!
//! [`Cancelled`]: FailureKind::Cancelled
//! [`TimedOut`]: FailureKind::TimedOut
//! [`FlowAborted`]: FailureKind::FlowAborted

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Boxed error payload carried by application failures.
pub type BoxError = Box<dyn StdError + Send + Sync>;

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Classification of a [`Failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailureKind {
    /// Cooperative cancellation signal.
    Cancelled,
    /// Cancellation raised by an expired [`with_timeout`](crate::with_timeout)
    /// frame. `token` identifies the frame that armed the timer so the frame
    /// can tell its own expiry apart from an outer timeout.
    TimedOut { duration: Duration, token: u64 },
    /// A send was attempted on a closed channel.
    ClosedSend,
    /// A receive was attempted on a closed and drained channel.
    ClosedReceive,
    /// A flow emitted outside the coroutine that is collecting it.
    FlowInvariant,
    /// Internal marker used by aborting flow collectors (`first`, `take`).
    /// Swallowed by the collector identified by `owner`, rethrown by others.
    FlowAborted { owner: u64 },
    /// Arbitrary application failure.
    App,
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

struct FailureInner {
    kind: FailureKind,
    message: String,
    cause: Option<Failure>,
    suppressed: Mutex<Vec<Failure>>,
    /// Name of the coroutine that observed this failure at a suspension
    /// boundary, if it was stamped by recovery.
    origin: Option<String>,
    /// Application payload, present only for [`FailureKind::App`].
    source: Option<BoxError>,
}

/// A failure value conveyed across suspension boundaries.
///
/// Clones share the same underlying instance — see [`Failure::same`].
#[derive(Clone)]
pub struct Failure {
    inner: Arc<FailureInner>,
}

impl Failure {
    fn build(
        kind: FailureKind,
        message: impl Into<String>,
        cause: Option<Failure>,
        source: Option<BoxError>,
    ) -> Self {
        Self {
            inner: Arc::new(FailureInner {
                kind,
                message: message.into(),
                cause,
                suppressed: Mutex::new(Vec::new()),
                origin: None,
                source,
            }),
        }
    }

    /// A plain cancellation signal.
    pub fn cancelled() -> Self {
        Self::build(FailureKind::Cancelled, "coroutine was cancelled", None, None)
    }

    /// A cancellation signal with an explanatory message.
    pub fn cancelled_msg(message: impl Into<String>) -> Self {
        Self::build(FailureKind::Cancelled, message, None, None)
    }

    /// A cancellation signal caused by `cause` (e.g. a parent's failure
    /// propagating to its children).
    pub fn cancelled_by(cause: Failure) -> Self {
        // Cancellation caused by cancellation collapses to the original
        // signal; chaining adds nothing for handlers to act on.
        if cause.is_cancellation() {
            return cause;
        }
        Self::build(
            FailureKind::Cancelled,
            "coroutine was cancelled",
            Some(cause),
            None,
        )
    }

    /// Timeout cancellation for the `with_timeout` frame identified by `token`.
    pub fn timed_out(duration: Duration, token: u64) -> Self {
        Self::build(
            FailureKind::TimedOut { duration, token },
            format!("timed out waiting for {duration:?}"),
            None,
            None,
        )
    }

    /// Failure of a send on a closed channel.
    pub fn closed_send(cause: Option<Failure>) -> Self {
        Self::build(FailureKind::ClosedSend, "channel was closed for send", cause, None)
    }

    /// Failure of a receive on a closed, drained channel.
    pub fn closed_receive(cause: Option<Failure>) -> Self {
        Self::build(
            FailureKind::ClosedReceive,
            "channel was closed for receive",
            cause,
            None,
        )
    }

    /// Violation of the flow context-preservation contract.
    pub fn flow_invariant(message: impl Into<String>) -> Self {
        Self::build(FailureKind::FlowInvariant, message, None, None)
    }

    /// Internal abort marker owned by the collector identified by `owner`.
    pub fn flow_aborted(owner: u64) -> Self {
        Self::build(
            FailureKind::FlowAborted { owner },
            "flow was aborted by its collector",
            None,
            None,
        )
    }

    /// An application failure described by a message.
    pub fn app(message: impl Into<String>) -> Self {
        Self::build(FailureKind::App, message, None, None)
    }

    /// An application failure wrapping an error value.
    pub fn from_error(error: impl Into<BoxError>) -> Self {
        let error = error.into();
        let message = error.to_string();
        Self::build(FailureKind::App, message, None, Some(error))
    }

    /// An application failure captured from a panic payload.
    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("coroutine panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("coroutine panicked: {s}")
        } else {
            "coroutine panicked".to_string()
        };
        Self::build(FailureKind::App, message, None, None)
    }

    /// The failure's classification.
    pub fn kind(&self) -> &FailureKind {
        &self.inner.kind
    }

    /// Human-readable description.
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// The failure that caused this one, if any.
    pub fn cause(&self) -> Option<&Failure> {
        self.inner.cause.as_ref()
    }

    /// Coroutine name stamped by [`with_origin`](Self::with_origin), if any.
    pub fn origin(&self) -> Option<&str> {
        self.inner.origin.as_deref()
    }

    /// `true` if this failure is a cooperative cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.inner.kind,
            FailureKind::Cancelled | FailureKind::TimedOut { .. } | FailureKind::FlowAborted { .. }
        )
    }

    /// `true` if this failure came from an expired timeout frame.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, FailureKind::TimedOut { .. })
    }

    /// `true` if `self` and `other` are the same underlying instance.
    pub fn same(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach `other` as a suppressed failure.
    ///
    /// No-op when `other` is this instance, is already attached, or both are
    /// plain cancellation signals (stacking equivalent cancellations carries
    /// no information).
    pub fn add_suppressed(&self, other: Failure) {
        if self.same(&other) {
            return;
        }
        if self.is_cancellation() && other.kind() == &FailureKind::Cancelled {
            return;
        }
        let mut suppressed = self.inner.suppressed.lock().unwrap();
        if suppressed.iter().any(|s| s.same(&other)) {
            return;
        }
        suppressed.push(other);
    }

    /// Snapshot of the suppressed failures attached so far.
    pub fn suppressed(&self) -> Vec<Failure> {
        self.inner.suppressed.lock().unwrap().clone()
    }

    /// A copy of this failure annotated with the name of the coroutine that
    /// observed it, keeping the original reachable as the cause.
    ///
    /// Used when a failure crosses a suspension boundary so reports can name
    /// the coroutine frame the failure surfaced in.
    pub fn with_origin(&self, name: &str) -> Failure {
        if self.inner.origin.as_deref() == Some(name) {
            return self.clone();
        }
        Failure {
            inner: Arc::new(FailureInner {
                kind: self.inner.kind.clone(),
                message: self.inner.message.clone(),
                cause: Some(self.clone()),
                suppressed: Mutex::new(Vec::new()),
                origin: Some(name.to_string()),
                source: None,
            }),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.message)?;
        if let Some(origin) = &self.inner.origin {
            write!(f, " (in coroutine {origin})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Failure");
        s.field("kind", &self.inner.kind)
            .field("message", &self.inner.message);
        if let Some(cause) = &self.inner.cause {
            s.field("cause", cause);
        }
        let suppressed = self.inner.suppressed.lock().unwrap();
        if !suppressed.is_empty() {
            s.field("suppressed", &*suppressed);
        }
        s.finish()
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        if let Some(src) = &self.inner.source {
            return Some(src.as_ref());
        }
        self.inner
            .cause
            .as_ref()
            .map(|c| c as &(dyn StdError + 'static))
    }
}

impl From<BoxError> for Failure {
    fn from(error: BoxError) -> Self {
        Failure::from_error(error)
    }
}

// ---------------------------------------------------------------------------
// Unhandled-failure reporting
// ---------------------------------------------------------------------------

type UnhandledHook = dyn Fn(&Failure) + Send + Sync;

static UNHANDLED_HOOK: Mutex<Option<Arc<UnhandledHook>>> = Mutex::new(None);

/// Replace the process-wide last-resort failure reporter.
///
/// The reporter receives failures that escaped every job and had no
/// `FailureHandler` in context. The default logs through `tracing::error!`.
/// Returns the previously installed hook, if any. Intended for test
/// harnesses asserting on escaped failures.
pub fn set_unhandled_failure_hook(
    hook: Option<Arc<UnhandledHook>>,
) -> Option<Arc<UnhandledHook>> {
    let mut guard = UNHANDLED_HOOK.lock().unwrap();
    std::mem::replace(&mut *guard, hook)
}

/// Deliver `failure` to the installed hook or the default reporter.
pub(crate) fn report_unhandled(origin: Option<&str>, failure: &Failure) {
    let hook = UNHANDLED_HOOK.lock().unwrap().clone();
    match hook {
        Some(hook) => hook(failure),
        None => match origin {
            Some(name) => {
                tracing::error!(coroutine = name, failure = %failure, "unhandled coroutine failure")
            }
            None => tracing::error!(failure = %failure, "unhandled coroutine failure"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_cancellation() {
        assert!(Failure::cancelled().is_cancellation());
        assert!(Failure::timed_out(Duration::from_millis(5), 1).is_cancellation());
        assert!(!Failure::app("boom").is_cancellation());
    }

    #[test]
    fn cancelled_by_cancellation_collapses() {
        let original = Failure::cancelled();
        let chained = Failure::cancelled_by(original.clone());
        assert!(chained.same(&original));
    }

    #[test]
    fn cancelled_by_app_failure_keeps_cause() {
        let cause = Failure::app("boom");
        let cancelled = Failure::cancelled_by(cause.clone());
        assert!(cancelled.is_cancellation());
        assert!(cancelled.cause().unwrap().same(&cause));
    }

    #[test]
    fn suppressed_skips_self_and_duplicates() {
        let primary = Failure::app("primary");
        let other = Failure::app("other");
        primary.add_suppressed(primary.clone());
        primary.add_suppressed(other.clone());
        primary.add_suppressed(other.clone());
        let suppressed = primary.suppressed();
        assert_eq!(suppressed.len(), 1);
        assert!(suppressed[0].same(&other));
    }

    #[test]
    fn plain_cancellations_do_not_stack() {
        let primary = Failure::cancelled();
        primary.add_suppressed(Failure::cancelled());
        assert!(primary.suppressed().is_empty());
    }

    #[test]
    fn with_origin_keeps_original_as_cause() {
        let original = Failure::app("boom");
        let stamped = original.with_origin("worker-1");
        assert_eq!(stamped.origin(), Some("worker-1"));
        assert!(stamped.cause().unwrap().same(&original));
        assert_eq!(stamped.message(), original.message());
    }

    #[test]
    fn timeout_token_is_observable() {
        let f = Failure::timed_out(Duration::from_millis(50), 42);
        match f.kind() {
            FailureKind::TimedOut { duration, token } => {
                assert_eq!(*duration, Duration::from_millis(50));
                assert_eq!(*token, 42);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
