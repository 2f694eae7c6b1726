//! Coroutine context — an immutable, typed, identity-keyed element map.
//!
//! A [`CoroutineContext`] travels with every coroutine and carries the
//! elements that decide how it runs: its dispatcher, its job, its name, its
//! failure handler, and any user-defined elements. Contexts are values:
//! composition never mutates, it builds a new context sharing structure with
//! the old one.
//!
//! Composition `left.plus(right)` folds the elements of `right` over `left`,
//! overriding by key. It is associative but not commutative — the right-hand
//! side wins on key collisions.
//!
//! Lookup is O(depth) over a linked list of elements. Contexts are shallow in
//! practice (a handful of elements), so no map structure is warranted.

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{report_unhandled, Failure};

// ---------------------------------------------------------------------------
// Keys and elements
// ---------------------------------------------------------------------------

/// Identity of a context element slot.
///
/// Keys are compared by the identity of a marker type: two elements share a
/// slot exactly when they declare the same marker, regardless of their
/// concrete type. This is what lets any dispatcher implementation occupy the
/// single dispatcher slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ElementKey(TypeId);

impl ElementKey {
    /// The key identified by marker type `M`.
    pub fn of<M: 'static>() -> Self {
        ElementKey(TypeId::of::<M>())
    }
}

/// An element that can be stored in a [`CoroutineContext`].
///
/// Implementations declare the key slot they occupy and expose themselves for
/// downcasting. Elements are immutable once stored.
pub trait ContextElement: Send + Sync + 'static {
    /// The slot this element occupies.
    fn key(&self) -> ElementKey;

    /// Downcast access to the concrete element.
    fn as_any(&self) -> &dyn Any;

    /// Present when the element must be materialised onto the running thread
    /// around every dispatched slice (e.g. a thread-local carrier).
    fn as_thread_element(&self) -> Option<&dyn ThreadContextElement> {
        None
    }
}

/// A context element mirrored into thread state while its coroutine runs.
///
/// The task runner calls [`update_thread_context`] before polling a slice of
/// the coroutine and [`restore_thread_context`] after, passing back the saved
/// state. Updates and restores are paired even when the slice panics.
///
/// [`update_thread_context`]: ThreadContextElement::update_thread_context
/// [`restore_thread_context`]: ThreadContextElement::restore_thread_context
pub trait ThreadContextElement: ContextElement {
    /// Install this element's thread state, returning what was replaced.
    fn update_thread_context(&self, context: &CoroutineContext) -> Box<dyn Any + Send>;

    /// Restore the thread state captured by the matching update call.
    fn restore_thread_context(&self, context: &CoroutineContext, saved: Box<dyn Any + Send>);
}

/// Convenience trait for elements retrievable through
/// [`CoroutineContext::get`]. The associated key must match what
/// [`ContextElement::key`] returns for every instance.
pub trait TypedElement: ContextElement + Clone {
    /// The slot all instances of this element type occupy.
    fn element_key() -> ElementKey;
}

// ---------------------------------------------------------------------------
// CoroutineContext
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Ctx {
    Empty,
    Single(Arc<dyn ContextElement>),
    /// `left` holds everything added before `element`; lookup walks
    /// right-to-left so later additions shadow earlier ones.
    Combined(Arc<Combined>),
}

struct Combined {
    left: Ctx,
    element: Arc<dyn ContextElement>,
}

/// An immutable element map carried by every coroutine.
#[derive(Clone, Default)]
pub struct CoroutineContext {
    inner: Ctx,
}

impl Default for Ctx {
    fn default() -> Self {
        Ctx::Empty
    }
}

impl CoroutineContext {
    /// The empty context.
    pub fn empty() -> Self {
        Self { inner: Ctx::Empty }
    }

    /// A context holding a single element.
    pub fn of(element: impl ContextElement) -> Self {
        Self {
            inner: Ctx::Single(Arc::new(element)),
        }
    }

    /// `true` when the context holds no elements.
    pub fn is_empty(&self) -> bool {
        matches!(self.inner, Ctx::Empty)
    }

    /// The element in slot `key`, if present.
    pub fn get_raw(&self, key: ElementKey) -> Option<Arc<dyn ContextElement>> {
        let mut cursor = &self.inner;
        loop {
            match cursor {
                Ctx::Empty => return None,
                Ctx::Single(e) => {
                    return if e.key() == key { Some(Arc::clone(e)) } else { None };
                }
                Ctx::Combined(c) => {
                    if c.element.key() == key {
                        return Some(Arc::clone(&c.element));
                    }
                    cursor = &c.left;
                }
            }
        }
    }

    /// The typed element `E`, if present.
    pub fn get<E: TypedElement>(&self) -> Option<E> {
        self.get_raw(E::element_key())?
            .as_any()
            .downcast_ref::<E>()
            .cloned()
    }

    /// A context equal to this one with slot `key` removed.
    pub fn minus_key(&self, key: ElementKey) -> CoroutineContext {
        self.fold(CoroutineContext::empty(), |acc, element| {
            if element.key() == key {
                acc
            } else {
                acc.appended(Arc::clone(element))
            }
        })
    }

    /// Left-to-right fold over the elements, oldest first.
    pub fn fold<A>(&self, init: A, mut op: impl FnMut(A, &Arc<dyn ContextElement>) -> A) -> A {
        fn walk<A>(
            ctx: &Ctx,
            init: A,
            op: &mut impl FnMut(A, &Arc<dyn ContextElement>) -> A,
        ) -> A {
            match ctx {
                Ctx::Empty => init,
                Ctx::Single(e) => op(init, e),
                Ctx::Combined(c) => {
                    let acc = walk(&c.left, init, op);
                    op(acc, &c.element)
                }
            }
        }
        walk(&self.inner, init, &mut op)
    }

    /// Composition: elements of `other` override elements of `self` by key.
    pub fn plus(&self, other: &CoroutineContext) -> CoroutineContext {
        if other.is_empty() {
            return self.clone();
        }
        other.fold(self.clone(), |acc, element| {
            acc.minus_if_present(element.key()).appended(Arc::clone(element))
        })
    }

    /// Shorthand for [`plus`](Self::plus) with a single element.
    pub fn with(&self, element: impl ContextElement) -> CoroutineContext {
        let element: Arc<dyn ContextElement> = Arc::new(element);
        self.with_arc(element)
    }

    pub(crate) fn with_arc(&self, element: Arc<dyn ContextElement>) -> CoroutineContext {
        self.minus_if_present(element.key()).appended(element)
    }

    fn minus_if_present(&self, key: ElementKey) -> CoroutineContext {
        if self.get_raw(key).is_some() {
            self.minus_key(key)
        } else {
            self.clone()
        }
    }

    fn appended(&self, element: Arc<dyn ContextElement>) -> CoroutineContext {
        let inner = match &self.inner {
            Ctx::Empty => Ctx::Single(element),
            other => Ctx::Combined(Arc::new(Combined {
                left: other.clone(),
                element,
            })),
        };
        CoroutineContext { inner }
    }

    /// Number of elements held.
    pub fn len(&self) -> usize {
        self.fold(0usize, |n, _| n + 1)
    }

    /// The elements implementing [`ThreadContextElement`], oldest first.
    pub(crate) fn thread_elements(&self) -> Vec<Arc<dyn ContextElement>> {
        self.fold(Vec::new(), |mut acc, element| {
            if element.as_thread_element().is_some() {
                acc.push(Arc::clone(element));
            }
            acc
        })
    }
}

impl fmt::Debug for CoroutineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoroutineContext[{} elements]", self.len())
    }
}

// ---------------------------------------------------------------------------
// CoroutineName
// ---------------------------------------------------------------------------

/// Human-readable coroutine name for diagnostics and failure reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoroutineName(pub String);

impl CoroutineName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

struct CoroutineNameKey;

impl ContextElement for CoroutineName {
    fn key(&self) -> ElementKey {
        ElementKey::of::<CoroutineNameKey>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TypedElement for CoroutineName {
    fn element_key() -> ElementKey {
        ElementKey::of::<CoroutineNameKey>()
    }
}

impl CoroutineContext {
    /// The coroutine name element, if present.
    pub fn name(&self) -> Option<String> {
        self.get::<CoroutineName>().map(|n| n.0)
    }
}

// ---------------------------------------------------------------------------
// FailureHandler
// ---------------------------------------------------------------------------

/// Context element that receives failures escaping a root coroutine.
///
/// The first handler found walking up the job/context chain wins; without one
/// the failure goes to the process-wide reporter. Cancellation signals are
/// never delivered here.
#[derive(Clone)]
pub struct FailureHandler {
    handler: Arc<dyn Fn(&CoroutineContext, &Failure) + Send + Sync>,
}

impl FailureHandler {
    pub fn new(handler: impl Fn(&CoroutineContext, &Failure) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn handle(&self, context: &CoroutineContext, failure: &Failure) {
        (self.handler)(context, failure);
    }
}

impl fmt::Debug for FailureHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureHandler")
    }
}

struct FailureHandlerKey;

impl ContextElement for FailureHandler {
    fn key(&self) -> ElementKey {
        ElementKey::of::<FailureHandlerKey>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TypedElement for FailureHandler {
    fn element_key() -> ElementKey {
        ElementKey::of::<FailureHandlerKey>()
    }
}

/// Route an escaped failure to the context's handler or the global reporter.
///
/// Cancellation signals are dropped — they are normal completion. A panic
/// inside the handler itself is captured and forwarded to the global
/// reporter; it never unwinds into the caller's state machine.
pub fn handle_failure(context: &CoroutineContext, failure: &Failure) {
    if failure.is_cancellation() {
        return;
    }
    if let Some(handler) = context.get::<FailureHandler>() {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(context, failure)));
        if let Err(payload) = outcome {
            let handler_failure = Failure::panicked(payload);
            handler_failure.add_suppressed(failure.clone());
            report_unhandled(context.name().as_deref(), &handler_failure);
        }
        return;
    }
    report_unhandled(context.name().as_deref(), failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq)]
    struct Tag(&'static str);

    struct TagKey;

    impl ContextElement for Tag {
        fn key(&self) -> ElementKey {
            ElementKey::of::<TagKey>()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl TypedElement for Tag {
        fn element_key() -> ElementKey {
            ElementKey::of::<TagKey>()
        }
    }

    #[test]
    fn empty_context_has_no_elements() {
        let ctx = CoroutineContext::empty();
        assert!(ctx.is_empty());
        assert_eq!(ctx.len(), 0);
        assert!(ctx.get::<Tag>().is_none());
    }

    #[test]
    fn get_returns_stored_element() {
        let ctx = CoroutineContext::of(Tag("a"));
        assert_eq!(ctx.get::<Tag>(), Some(Tag("a")));
    }

    #[test]
    fn plus_overrides_by_key() {
        let left = CoroutineContext::of(Tag("left")).with(CoroutineName::new("job"));
        let right = CoroutineContext::of(Tag("right"));
        let combined = left.plus(&right);
        assert_eq!(combined.get::<Tag>(), Some(Tag("right")));
        assert_eq!(combined.name(), Some("job".to_string()));
        assert_eq!(combined.len(), 2);
    }

    #[test]
    fn plus_is_right_biased_not_commutative() {
        let a = CoroutineContext::of(Tag("a"));
        let b = CoroutineContext::of(Tag("b"));
        assert_eq!(a.plus(&b).get::<Tag>(), Some(Tag("b")));
        assert_eq!(b.plus(&a).get::<Tag>(), Some(Tag("a")));
    }

    #[test]
    fn minus_key_removes_only_that_slot() {
        let ctx = CoroutineContext::of(Tag("a")).with(CoroutineName::new("n"));
        let without_tag = ctx.minus_key(Tag::element_key());
        assert!(without_tag.get::<Tag>().is_none());
        assert_eq!(without_tag.name(), Some("n".to_string()));
    }

    #[test]
    fn fold_visits_oldest_first() {
        let ctx = CoroutineContext::of(CoroutineName::new("n")).with(Tag("t"));
        let keys = ctx.fold(Vec::new(), |mut acc, e| {
            acc.push(e.key());
            acc
        });
        assert_eq!(keys, vec![CoroutineName::element_key(), Tag::element_key()]);
    }

    #[test]
    fn handler_panic_does_not_unwind() {
        let ctx = CoroutineContext::of(FailureHandler::new(|_, _| panic!("handler bug")));
        // Must not propagate the panic.
        handle_failure(&ctx, &Failure::app("boom"));
    }

    #[test]
    fn cancellation_is_not_reported() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = Arc::clone(&hits);
        let ctx = CoroutineContext::of(FailureHandler::new(move |_, _| {
            hits_in_handler.fetch_add(1, Ordering::SeqCst);
        }));
        handle_failure(&ctx, &Failure::cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        handle_failure(&ctx, &Failure::app("boom"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
