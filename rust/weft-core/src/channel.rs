//! Channels — rendezvous and buffered hand-off between coroutines.
//!
//! A [`Channel`] is a single cloneable handle carrying both the send and the
//! receive surface. Values flow through a FIFO buffer bounded by the
//! [`Capacity`]; when the buffer cannot make progress, operations park a
//! cancellable continuation in a waiter queue. Rendezvous is the zero-capacity
//! special case (every send meets a receiver); Conflated is buffered-1 with
//! [`Overflow::DropOldest`].
//!
//! # Delivery guarantees
//!
//! A value sent into a channel is received by exactly one receiver, or
//! dropped through the `on_undelivered_element` hook, or remains buffered
//! until close. The hook is the only contract by which resource-owning
//! producers learn of values the channel let go: cancelled parked sends,
//! values dropped by an overflow policy, buffered values discarded by
//! [`Channel::cancel`], and values discarded by prompt cancellation of a
//! receiver. The hook is called synchronously with no channel lock held and
//! must not block.
//!
//! # Close and cancel
//!
//! `close` stops sends: parked senders fail with the close cause, receivers
//! drain the buffer and then fail. `cancel` is a stronger close that also
//! drops the buffered values through the hook. Both are idempotent; the first
//! cause wins.
//!
//! Waiter queues are strictly FIFO. A waiter whose continuation is no longer
//! claimable (cancelled, or a select that committed elsewhere) is skipped and
//! removed when a peer encounters it. Hand-offs go through the continuation
//! claim protocol, so a waiter is matched by exactly one peer.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

use crate::cancellable::{
    suspend_cancellable, CancellableContinuation, Claim, ClaimToken,
};
use crate::error::Failure;

/// Payload carried by a committed select clause.
pub(crate) type SelectPayload = Box<dyn Any + Send>;
/// The shared continuation of a running select.
pub(crate) type SelectCont = CancellableContinuation<(usize, SelectPayload)>;

type OnUndelivered<E> = Arc<dyn Fn(E) + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Buffering strategy of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// No buffer: every send suspends until a receiver takes the value.
    Rendezvous,
    /// FIFO buffer of the given size.
    Buffered(usize),
    /// Never suspends a sender for lack of space.
    Unlimited,
    /// Keeps only the most recent value (buffered-1 + drop-oldest).
    Conflated,
}

/// What a send does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    /// Park the sender until space frees up.
    #[default]
    Suspend,
    /// Evict the oldest buffered value through the undelivered hook.
    DropOldest,
    /// Drop the value being sent through the undelivered hook.
    DropLatest,
}

// ---------------------------------------------------------------------------
// Waiters
// ---------------------------------------------------------------------------

pub(crate) enum RecvWaiter<E> {
    Direct(CancellableContinuation<E>),
    Select { cc: SelectCont, index: usize },
}

struct ParkedRecv<E> {
    id: u64,
    waiter: RecvWaiter<E>,
}

pub(crate) enum SendWaiter {
    Direct(CancellableContinuation<()>),
    Select { cc: SelectCont, index: usize },
}

struct ParkedSend<E> {
    id: u64,
    value: Option<E>,
    waiter: SendWaiter,
}

/// A held claim on a receive waiter; remembers which shape was claimed.
enum RecvClaim {
    Direct(ClaimToken),
    Select(ClaimToken),
}

/// A held claim on a send waiter.
enum SendClaim {
    Direct(ClaimToken),
    Select(ClaimToken),
}

/// Non-spinning claim outcome used while another claim is already held.
enum PeerAttempt<C> {
    Claimed(C),
    Busy,
    Dead,
}

fn select_value_hook<E: Send + 'static>(
    hook: Option<OnUndelivered<E>>,
) -> Option<Box<dyn FnOnce((usize, SelectPayload)) + Send>> {
    hook.map(|h| {
        Box::new(move |(_, payload): (usize, SelectPayload)| {
            if let Ok(v) = payload.downcast::<E>() {
                h(*v);
            }
        }) as Box<dyn FnOnce((usize, SelectPayload)) + Send>
    })
}

impl<E: Send + 'static> RecvWaiter<E> {
    fn claim(&self) -> PeerAttempt<RecvClaim> {
        match self {
            RecvWaiter::Direct(cc) => match cc.try_claim() {
                Claim::Token(t) => PeerAttempt::Claimed(RecvClaim::Direct(t)),
                Claim::Busy => PeerAttempt::Busy,
                Claim::Decided => PeerAttempt::Dead,
            },
            RecvWaiter::Select { cc, .. } => match cc.try_claim() {
                Claim::Token(t) => PeerAttempt::Claimed(RecvClaim::Select(t)),
                Claim::Busy => PeerAttempt::Busy,
                Claim::Decided => PeerAttempt::Dead,
            },
        }
    }

    fn complete_value(
        &self,
        claim: RecvClaim,
        value: E,
        hook: Option<OnUndelivered<E>>,
    ) -> Option<Waker> {
        match (self, claim) {
            (RecvWaiter::Direct(cc), RecvClaim::Direct(token)) => cc.complete_claim(
                token,
                Ok(value),
                hook.map(|h| Box::new(move |v: E| h(v)) as Box<dyn FnOnce(E) + Send>),
            ),
            (RecvWaiter::Select { cc, index }, RecvClaim::Select(token)) => cc.complete_claim(
                token,
                Ok((*index, Box::new(value) as SelectPayload)),
                select_value_hook(hook),
            ),
            _ => unreachable!("claim shape matches its waiter"),
        }
    }

    /// Spin-claim and deliver; `Err` hands the value back when the waiter is
    /// dead. Safe to spin here: the caller holds no claim of its own.
    fn try_deliver(&self, value: E, hook: Option<OnUndelivered<E>>) -> Result<Option<Waker>, E> {
        loop {
            match self.claim() {
                PeerAttempt::Claimed(claim) => {
                    return Ok(self.complete_value(claim, value, hook));
                }
                PeerAttempt::Busy => std::thread::yield_now(),
                PeerAttempt::Dead => return Err(value),
            }
        }
    }

    fn close(&self, failure: Failure) -> Option<Waker> {
        match self {
            RecvWaiter::Direct(cc) => cc.try_resume_now(Err(failure), None).unwrap_or(None),
            RecvWaiter::Select { cc, .. } => {
                cc.try_resume_now(Err(failure), None).unwrap_or(None)
            }
        }
    }
}

impl SendWaiter {
    fn claim(&self) -> PeerAttempt<SendClaim> {
        match self {
            SendWaiter::Direct(cc) => match cc.try_claim() {
                Claim::Token(t) => PeerAttempt::Claimed(SendClaim::Direct(t)),
                Claim::Busy => PeerAttempt::Busy,
                Claim::Decided => PeerAttempt::Dead,
            },
            SendWaiter::Select { cc, .. } => match cc.try_claim() {
                Claim::Token(t) => PeerAttempt::Claimed(SendClaim::Select(t)),
                Claim::Busy => PeerAttempt::Busy,
                Claim::Decided => PeerAttempt::Dead,
            },
        }
    }

    /// Resume the claimed sender successfully (its value was taken).
    fn complete_ok(&self, claim: SendClaim) -> Option<Waker> {
        match (self, claim) {
            (SendWaiter::Direct(cc), SendClaim::Direct(token)) => {
                cc.complete_claim(token, Ok(()), None)
            }
            (SendWaiter::Select { cc, index }, SendClaim::Select(token)) => cc.complete_claim(
                token,
                Ok((*index, Box::new(()) as SelectPayload)),
                None,
            ),
            _ => unreachable!("claim shape matches its waiter"),
        }
    }

    /// Spin-claim; `None` when the waiter is dead.
    fn try_take(&self) -> Option<SendClaim> {
        loop {
            match self.claim() {
                PeerAttempt::Claimed(claim) => return Some(claim),
                PeerAttempt::Busy => std::thread::yield_now(),
                PeerAttempt::Dead => return None,
            }
        }
    }

    fn close(&self, failure: Failure) -> Option<Waker> {
        match self {
            SendWaiter::Direct(cc) => cc.try_resume_now(Err(failure), None).unwrap_or(None),
            SendWaiter::Select { cc, .. } => {
                cc.try_resume_now(Err(failure), None).unwrap_or(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct CloseState {
    cause: Option<Failure>,
}

struct ChannelState<E> {
    buffer: VecDeque<E>,
    senders: VecDeque<ParkedSend<E>>,
    receivers: VecDeque<ParkedRecv<E>>,
    closed: Option<CloseState>,
    sent: u64,
    received: u64,
}

struct ChannelInner<E> {
    capacity: usize,
    overflow: Overflow,
    on_undelivered: Option<OnUndelivered<E>>,
    ids: AtomicU64,
    state: Mutex<ChannelState<E>>,
}

/// Side effects collected under the lock, performed after unlock.
struct Effects<E> {
    wakes: Vec<Waker>,
    dropped: Vec<E>,
}

impl<E> Effects<E> {
    fn new() -> Self {
        Self {
            wakes: Vec::new(),
            dropped: Vec::new(),
        }
    }

    fn wake(&mut self, waker: Option<Waker>) {
        if let Some(waker) = waker {
            self.wakes.push(waker);
        }
    }
}

impl<E: Send + 'static> ChannelInner<E> {
    fn run_effects(&self, mut effects: Effects<E>) {
        for value in effects.dropped.drain(..) {
            if let Some(hook) = &self.on_undelivered {
                hook(value);
            }
        }
        for waker in effects.wakes.drain(..) {
            waker.wake();
        }
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn closed_send_failure(state: &ChannelState<E>) -> Failure {
        let cause = state.closed.as_ref().and_then(|c| c.cause.clone());
        Failure::closed_send(cause)
    }

    fn closed_receive_failure(state: &ChannelState<E>) -> Failure {
        let cause = state.closed.as_ref().and_then(|c| c.cause.clone());
        Failure::closed_receive(cause)
    }

    /// Pull parked senders into freed buffer space. Lock held; no claim held
    /// by the caller.
    fn refill_from_senders(&self, state: &mut ChannelState<E>, effects: &mut Effects<E>) {
        while state.buffer.len() < self.capacity {
            let Some(mut entry) = state.senders.pop_front() else {
                return;
            };
            match entry.waiter.try_take() {
                Some(claim) => {
                    let value = entry.value.take().expect("parked sender holds its value");
                    state.buffer.push_back(value);
                    state.sent = state.sent.wrapping_add(1);
                    effects.wake(entry.waiter.complete_ok(claim));
                }
                None => {
                    // Dead waiter: its value was never sent.
                    if let Some(value) = entry.value.take() {
                        effects.dropped.push(value);
                    }
                }
            }
        }
    }

    /// Take a value for a receiver: buffer first, then a parked sender.
    /// Lock held; no claim held by the caller.
    fn take_value(&self, state: &mut ChannelState<E>, effects: &mut Effects<E>) -> Option<E> {
        if let Some(value) = state.buffer.pop_front() {
            state.received = state.received.wrapping_add(1);
            self.refill_from_senders(state, effects);
            return Some(value);
        }
        // Rendezvous hand-off from a parked sender.
        loop {
            let mut entry = state.senders.pop_front()?;
            match entry.waiter.try_take() {
                Some(claim) => {
                    let value = entry.value.take().expect("parked sender holds its value");
                    state.sent = state.sent.wrapping_add(1);
                    state.received = state.received.wrapping_add(1);
                    effects.wake(entry.waiter.complete_ok(claim));
                    return Some(value);
                }
                None => {
                    if let Some(value) = entry.value.take() {
                        effects.dropped.push(value);
                    }
                }
            }
        }
    }

    /// Deliver `value` to a parked receiver, or return it. Lock held; no
    /// claim held by the caller.
    fn offer_to_receiver(
        &self,
        state: &mut ChannelState<E>,
        effects: &mut Effects<E>,
        mut value: E,
    ) -> Result<(), E> {
        while let Some(entry) = state.receivers.pop_front() {
            match entry.waiter.try_deliver(value, self.on_undelivered.clone()) {
                Ok(waker) => {
                    state.sent = state.sent.wrapping_add(1);
                    state.received = state.received.wrapping_add(1);
                    effects.wake(waker);
                    return Ok(());
                }
                Err(back) => value = back,
            }
        }
        Err(value)
    }

    fn remove_parked_send(&self, id: u64) -> Option<E> {
        let mut state = self.state.lock().unwrap();
        let position = state.senders.iter().position(|entry| entry.id == id)?;
        let mut entry = state.senders.remove(position)?;
        entry.value.take()
    }

    fn remove_parked_recv(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.receivers.retain(|entry| entry.id != id);
    }
}

// ---------------------------------------------------------------------------
// Errors of the non-suspending operations
// ---------------------------------------------------------------------------

/// Error of [`Channel::try_send`]; the value is handed back.
#[derive(Debug, thiserror::Error)]
pub enum TrySendError<E> {
    #[error("channel buffer is full")]
    Full(E),
    #[error("channel is closed for send")]
    Closed(E),
}

/// Error of [`Channel::try_receive`].
#[derive(Debug, thiserror::Error)]
pub enum TryReceiveError {
    #[error("channel has no buffered values")]
    Empty,
    #[error("channel is closed for receive")]
    Closed(Option<Failure>),
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A rendezvous or buffered channel. Clones share the same underlying state.
pub struct Channel<E> {
    inner: Arc<ChannelInner<E>>,
}

impl<E> Clone for Channel<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> fmt::Debug for Channel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Channel")
            .field("buffered", &state.buffer.len())
            .field("sent", &state.sent)
            .field("received", &state.received)
            .field("closed", &state.closed.is_some())
            .finish()
    }
}

impl<E: Send + 'static> Channel<E> {
    /// A channel with the given capacity and [`Overflow::Suspend`].
    pub fn new(capacity: Capacity) -> Self {
        Self::with_options(capacity, Overflow::Suspend, None)
    }

    /// A channel with explicit overflow policy and undelivered-element hook.
    pub fn with_options(
        capacity: Capacity,
        overflow: Overflow,
        on_undelivered: Option<Arc<dyn Fn(E) + Send + Sync>>,
    ) -> Self {
        let (capacity, overflow) = match capacity {
            Capacity::Rendezvous => (0, overflow),
            Capacity::Buffered(n) => (n, overflow),
            Capacity::Unlimited => (usize::MAX, overflow),
            Capacity::Conflated => (1, Overflow::DropOldest),
        };
        Self {
            inner: Arc::new(ChannelInner {
                capacity,
                overflow,
                on_undelivered,
                ids: AtomicU64::new(1),
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::new(),
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                    closed: None,
                    sent: 0,
                    received: 0,
                }),
            }),
        }
    }

    /// Send `value`, suspending while the channel cannot accept it.
    pub async fn send(&self, value: E) -> Result<(), Failure> {
        let inner = Arc::clone(&self.inner);
        suspend_cancellable(move |cc| {
            let mut effects = Effects::new();
            let decision;
            {
                let mut state = inner.state.lock().unwrap();
                if state.closed.is_some() {
                    let failure = ChannelInner::closed_send_failure(&state);
                    effects.dropped.push(value);
                    decision = Some(Err(failure));
                } else {
                    match inner.offer_to_receiver(&mut state, &mut effects, value) {
                        Ok(()) => decision = Some(Ok(())),
                        Err(value) => {
                            if state.buffer.len() < inner.capacity {
                                state.buffer.push_back(value);
                                state.sent = state.sent.wrapping_add(1);
                                decision = Some(Ok(()));
                            } else {
                                match inner.overflow {
                                    Overflow::Suspend => {
                                        let id = inner.next_id();
                                        state.senders.push_back(ParkedSend {
                                            id,
                                            value: Some(value),
                                            waiter: SendWaiter::Direct(cc.clone()),
                                        });
                                        let channel = Arc::clone(&inner);
                                        cc.invoke_on_cancellation(move |_| {
                                            if let Some(v) = channel.remove_parked_send(id) {
                                                if let Some(hook) = &channel.on_undelivered {
                                                    hook(v);
                                                }
                                            }
                                        });
                                        decision = None;
                                    }
                                    Overflow::DropOldest => {
                                        let evicted = state.buffer.pop_front();
                                        state.buffer.push_back(value);
                                        state.sent = state.sent.wrapping_add(1);
                                        if let Some(old) = evicted {
                                            effects.dropped.push(old);
                                        }
                                        decision = Some(Ok(()));
                                    }
                                    Overflow::DropLatest => {
                                        effects.dropped.push(value);
                                        decision = Some(Ok(()));
                                    }
                                }
                            }
                        }
                    }
                }
            }
            inner.run_effects(effects);
            if let Some(result) = decision {
                cc.resume(result);
            }
        })
        .await
    }

    /// Non-suspending send.
    pub fn try_send(&self, value: E) -> Result<(), TrySendError<E>> {
        let mut effects = Effects::new();
        let result;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed.is_some() {
                return Err(TrySendError::Closed(value));
            }
            match self.inner.offer_to_receiver(&mut state, &mut effects, value) {
                Ok(()) => result = Ok(()),
                Err(value) => {
                    if state.buffer.len() < self.inner.capacity {
                        state.buffer.push_back(value);
                        state.sent = state.sent.wrapping_add(1);
                        result = Ok(());
                    } else {
                        match self.inner.overflow {
                            Overflow::Suspend => {
                                drop(state);
                                self.inner.run_effects(effects);
                                return Err(TrySendError::Full(value));
                            }
                            Overflow::DropOldest => {
                                let evicted = state.buffer.pop_front();
                                state.buffer.push_back(value);
                                state.sent = state.sent.wrapping_add(1);
                                if let Some(old) = evicted {
                                    effects.dropped.push(old);
                                }
                                result = Ok(());
                            }
                            Overflow::DropLatest => {
                                effects.dropped.push(value);
                                result = Ok(());
                            }
                        }
                    }
                }
            }
        }
        self.inner.run_effects(effects);
        result
    }

    /// Receive the next value, suspending while none is available.
    pub async fn receive(&self) -> Result<E, Failure> {
        let inner = Arc::clone(&self.inner);
        suspend_cancellable(move |cc| {
            let mut effects = Effects::new();
            let decision;
            {
                let mut state = inner.state.lock().unwrap();
                if let Some(value) = inner.take_value(&mut state, &mut effects) {
                    decision = Some(Ok(value));
                } else if state.closed.is_some() {
                    decision = Some(Err(ChannelInner::closed_receive_failure(&state)));
                } else {
                    let id = inner.next_id();
                    state.receivers.push_back(ParkedRecv {
                        id,
                        waiter: RecvWaiter::Direct(cc.clone()),
                    });
                    let channel = Arc::clone(&inner);
                    cc.invoke_on_cancellation(move |_| channel.remove_parked_recv(id));
                    decision = None;
                }
            }
            inner.run_effects(effects);
            match decision {
                Some(Ok(value)) => {
                    // Prompt cancellation of the receiver re-routes the value.
                    let hook = inner.on_undelivered.clone();
                    cc.resume_with_undelivered(Ok(value), hook.map(|h| move |v: E| h(v)));
                }
                Some(Err(failure)) => cc.resume(Err(failure)),
                None => {}
            }
        })
        .await
    }

    /// Non-suspending receive.
    pub fn try_receive(&self) -> Result<E, TryReceiveError> {
        let mut effects = Effects::new();
        let result;
        {
            let mut state = self.inner.state.lock().unwrap();
            match self.inner.take_value(&mut state, &mut effects) {
                Some(value) => result = Ok(value),
                None if state.closed.is_some() => {
                    let cause = state.closed.as_ref().and_then(|c| c.cause.clone());
                    result = Err(TryReceiveError::Closed(cause));
                }
                None => result = Err(TryReceiveError::Empty),
            }
        }
        self.inner.run_effects(effects);
        result
    }

    fn close_core(&self, cause: Option<Failure>, drop_buffer: bool) -> bool {
        let mut effects = Effects::new();
        let newly_closed;
        {
            let mut state = self.inner.state.lock().unwrap();
            newly_closed = state.closed.is_none();
            if newly_closed {
                state.closed = Some(CloseState {
                    cause: cause.clone(),
                });
                let send_failure = ChannelInner::closed_send_failure(&state);
                while let Some(mut entry) = state.senders.pop_front() {
                    effects.wake(entry.waiter.close(send_failure.clone()));
                    if let Some(value) = entry.value.take() {
                        effects.dropped.push(value);
                    }
                }
                // Receivers only park on an empty buffer, so anything parked
                // here can never be matched again.
                let recv_failure = ChannelInner::closed_receive_failure(&state);
                while let Some(entry) = state.receivers.pop_front() {
                    effects.wake(entry.waiter.close(recv_failure.clone()));
                }
            }
            if drop_buffer {
                while let Some(value) = state.buffer.pop_front() {
                    effects.dropped.push(value);
                }
            }
        }
        self.inner.run_effects(effects);
        newly_closed
    }

    /// Close the channel for send. Buffered values remain receivable.
    /// Returns `true` when this call performed the close.
    pub fn close(&self) -> bool {
        self.close_core(None, false)
    }

    /// Close with a cause that subsequent operations observe.
    pub fn close_with(&self, cause: Failure) -> bool {
        self.close_core(Some(cause), false)
    }

    /// Close and drop all buffered values through the undelivered hook.
    pub fn cancel(&self) {
        self.close_core(Some(Failure::cancelled_msg("channel was cancelled")), true);
    }

    /// [`cancel`](Self::cancel) with an explicit cause.
    pub fn cancel_with(&self, cause: Failure) {
        self.close_core(Some(cause), true);
    }

    /// `true` once the channel is closed for send.
    pub fn is_closed_for_send(&self) -> bool {
        self.inner.state.lock().unwrap().closed.is_some()
    }

    /// `true` once closed and fully drained.
    pub fn is_closed_for_receive(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.closed.is_some() && state.buffer.is_empty() && state.senders.is_empty()
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total values accepted into the channel so far.
    pub fn sent_count(&self) -> u64 {
        self.inner.state.lock().unwrap().sent
    }

    /// Total values handed to receivers so far.
    pub fn received_count(&self) -> u64 {
        self.inner.state.lock().unwrap().received
    }

    /// Iterator-style consumption; ends on a clean close.
    pub fn iter(&self) -> ChannelIter<E> {
        ChannelIter {
            channel: self.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Select registration (called by the select builder)
// ---------------------------------------------------------------------------

impl<E: Send + 'static> Channel<E> {
    /// Register a receive clause: match immediately through the select's
    /// shared continuation, or park a select waiter for peers to claim.
    ///
    /// The select's own continuation is claimed before any peer. When a peer
    /// is transiently claimed by someone else, everything is released and the
    /// registration retried, so two claim holders never wait on each other.
    pub(crate) fn register_select_receive(&self, cc: &SelectCont, index: usize) {
        let inner = &self.inner;
        loop {
            let mut effects = Effects::new();
            let mut retry = false;
            {
                let mut state = inner.state.lock().unwrap();
                let own = match cc.try_claim() {
                    Claim::Token(token) => token,
                    Claim::Busy => {
                        drop(state);
                        std::thread::yield_now();
                        continue;
                    }
                    Claim::Decided => return,
                };

                if let Some(value) = state.buffer.pop_front() {
                    state.received = state.received.wrapping_add(1);
                    let hook = inner.on_undelivered.clone();
                    effects.wake(cc.complete_claim(
                        own,
                        Ok((index, Box::new(value) as SelectPayload)),
                        select_value_hook(hook),
                    ));
                    inner.refill_from_senders(&mut state, &mut effects);
                } else {
                    // No buffered value: try a parked sender, else park.
                    let mut own = Some(own);
                    loop {
                        let Some(mut entry) = state.senders.pop_front() else {
                            break;
                        };
                        match entry.waiter.claim() {
                            PeerAttempt::Claimed(peer) => {
                                let value =
                                    entry.value.take().expect("parked sender holds its value");
                                state.sent = state.sent.wrapping_add(1);
                                state.received = state.received.wrapping_add(1);
                                effects.wake(entry.waiter.complete_ok(peer));
                                let hook = inner.on_undelivered.clone();
                                effects.wake(cc.complete_claim(
                                    own.take().expect("own claim held"),
                                    Ok((index, Box::new(value) as SelectPayload)),
                                    select_value_hook(hook),
                                ));
                                break;
                            }
                            PeerAttempt::Busy => {
                                // Never wait on a peer while holding a claim.
                                state.senders.push_front(entry);
                                effects.wake(
                                    cc.release_claim(own.take().expect("own claim held")),
                                );
                                retry = true;
                                break;
                            }
                            PeerAttempt::Dead => {
                                if let Some(value) = entry.value.take() {
                                    effects.dropped.push(value);
                                }
                            }
                        }
                    }
                    if let Some(own) = own {
                        if retry {
                            unreachable!("own claim is consumed on retry");
                        }
                        if state.closed.is_some() {
                            let failure = ChannelInner::closed_receive_failure(&state);
                            effects.wake(cc.complete_claim(own, Err(failure), None));
                        } else {
                            match cc.release_claim(own) {
                                Some(waker) => {
                                    // Cancelled while claimed; nothing to park.
                                    effects.wake(Some(waker));
                                }
                                None => {
                                    state.receivers.push_back(ParkedRecv {
                                        id: inner.next_id(),
                                        waiter: RecvWaiter::Select {
                                            cc: cc.clone(),
                                            index,
                                        },
                                    });
                                }
                            }
                        }
                    }
                }
            }
            inner.run_effects(effects);
            if retry {
                if !cc.is_active() {
                    return;
                }
                std::thread::yield_now();
                continue;
            }
            return;
        }
    }

    /// Register a send clause carrying `value`.
    pub(crate) fn register_select_send(&self, value: E, cc: &SelectCont, index: usize) {
        let inner = &self.inner;
        let mut slot = Some(value);
        loop {
            let mut effects = Effects::new();
            let mut retry = false;
            {
                let mut state = inner.state.lock().unwrap();
                if state.closed.is_some() {
                    let failure = ChannelInner::closed_send_failure(&state);
                    if let Ok(waker) = cc.try_resume_now(Err(failure), None) {
                        effects.wake(waker);
                    }
                    if let Some(v) = slot.take() {
                        effects.dropped.push(v);
                    }
                    drop(state);
                    inner.run_effects(effects);
                    return;
                }

                let own = match cc.try_claim() {
                    Claim::Token(token) => token,
                    Claim::Busy => {
                        drop(state);
                        std::thread::yield_now();
                        continue;
                    }
                    Claim::Decided => {
                        // Another clause won; the value was never sent.
                        if let Some(v) = slot.take() {
                            effects.dropped.push(v);
                        }
                        drop(state);
                        inner.run_effects(effects);
                        return;
                    }
                };

                let mut own = Some(own);
                // Hand-off to a parked receiver.
                loop {
                    let Some(entry) = state.receivers.pop_front() else {
                        break;
                    };
                    match entry.waiter.claim() {
                        PeerAttempt::Claimed(peer) => {
                            let v = slot.take().expect("send clause value taken once");
                            state.sent = state.sent.wrapping_add(1);
                            state.received = state.received.wrapping_add(1);
                            let hook = inner.on_undelivered.clone();
                            effects.wake(entry.waiter.complete_value(peer, v, hook));
                            effects.wake(cc.complete_claim(
                                own.take().expect("own claim held"),
                                Ok((index, Box::new(()) as SelectPayload)),
                                None,
                            ));
                            break;
                        }
                        PeerAttempt::Busy => {
                            state.receivers.push_front(entry);
                            effects.wake(cc.release_claim(own.take().expect("own claim held")));
                            retry = true;
                            break;
                        }
                        PeerAttempt::Dead => continue,
                    }
                }

                if let Some(own) = own.take() {
                    if retry {
                        unreachable!("own claim is consumed on retry");
                    }
                    let v = slot.take().expect("send clause value taken once");
                    if state.buffer.len() < inner.capacity {
                        state.buffer.push_back(v);
                        state.sent = state.sent.wrapping_add(1);
                        effects.wake(cc.complete_claim(
                            own,
                            Ok((index, Box::new(()) as SelectPayload)),
                            None,
                        ));
                    } else {
                        match inner.overflow {
                            Overflow::Suspend => match cc.release_claim(own) {
                                Some(waker) => {
                                    // Cancelled while claimed.
                                    effects.wake(Some(waker));
                                    effects.dropped.push(v);
                                }
                                None => {
                                    state.senders.push_back(ParkedSend {
                                        id: inner.next_id(),
                                        value: Some(v),
                                        waiter: SendWaiter::Select {
                                            cc: cc.clone(),
                                            index,
                                        },
                                    });
                                }
                            },
                            Overflow::DropOldest => {
                                if let Some(old) = state.buffer.pop_front() {
                                    effects.dropped.push(old);
                                }
                                state.buffer.push_back(v);
                                state.sent = state.sent.wrapping_add(1);
                                effects.wake(cc.complete_claim(
                                    own,
                                    Ok((index, Box::new(()) as SelectPayload)),
                                    None,
                                ));
                            }
                            Overflow::DropLatest => {
                                effects.dropped.push(v);
                                effects.wake(cc.complete_claim(
                                    own,
                                    Ok((index, Box::new(()) as SelectPayload)),
                                    None,
                                ));
                            }
                        }
                    }
                }
            }
            inner.run_effects(effects);
            if retry {
                if !cc.is_active() {
                    if let Some(v) = slot.take() {
                        if let Some(hook) = &inner.on_undelivered {
                            hook(v);
                        }
                    }
                    return;
                }
                std::thread::yield_now();
                continue;
            }
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Sequential consumer over a channel. A clean close ends the iteration; a
/// close with a cause (and the caller's own cancellation) surfaces as an
/// error item.
pub struct ChannelIter<E> {
    channel: Channel<E>,
}

impl<E: Send + 'static> ChannelIter<E> {
    pub async fn next(&mut self) -> Option<Result<E, Failure>> {
        match self.channel.receive().await {
            Ok(value) => Some(Ok(value)),
            Err(failure) => match failure.kind() {
                crate::error::FailureKind::ClosedReceive if failure.cause().is_none() => None,
                _ => Some(Err(failure)),
            },
        }
    }
}
