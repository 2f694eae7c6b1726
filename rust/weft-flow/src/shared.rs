//! SharedFlow — hot multicast with replay and backpressure policy.
//!
//! A [`MutableSharedFlow`] owns a ring of the last `replay + extra_buffer`
//! values and a slot per subscriber (read index + at most one parked
//! collector). New subscribers observe the replay cache, then subsequent
//! emissions. Under the [`Overflow::Suspend`] policy an emitter parks when
//! the slowest subscriber blocks buffer progression; the drop policies never
//! park — laggards skip dropped values ([`Overflow::DropOldest`]) or new
//! values are discarded ([`Overflow::DropLatest`]).
//!
//! Emissions are totally ordered; every subscriber observes a suffix-free
//! subsequence of that order (a prefix per value index, with gaps only under
//! the drop policies).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::cancellable::{suspend_cancellable, CancellableContinuation};
use weft_core::channel::Overflow;
use weft_core::error::Failure;

use crate::flow::{CollectorRef, Flow, RawFlow};
use crate::state::MutableStateFlow;

struct SubSlot<T> {
    id: u64,
    /// Index of the next value this subscriber will take.
    index: u64,
    /// Parked collector; resumed with `None` to re-check under the lock.
    waiter: Option<CancellableContinuation<Option<T>>>,
}

/// An emitter parked with its value; the value enters the buffer only when
/// the emitter is admitted, preserving emission order.
struct ParkedEmit<T> {
    id: u64,
    value: T,
    cc: CancellableContinuation<()>,
}

struct SharedState<T> {
    buffer: VecDeque<T>,
    /// Index of `buffer[0]`.
    head: u64,
    /// Values below this index are invisible to new subscribers
    /// (`reset_replay_cache`).
    replay_barrier: u64,
    subscribers: Vec<SubSlot<T>>,
    emitters: VecDeque<ParkedEmit<T>>,
    next_id: u64,
}

impl<T> SharedState<T> {
    fn total(&self) -> u64 {
        self.head + self.buffer.len() as u64
    }

    fn min_subscriber_index(&self) -> u64 {
        self.subscribers
            .iter()
            .map(|s| s.index)
            .min()
            .unwrap_or_else(|| self.total())
    }
}

struct SharedInner<T> {
    replay: usize,
    extra: usize,
    overflow: Overflow,
    state: Mutex<SharedState<T>>,
    subscriptions: MutableStateFlow<usize>,
}

/// A hot multicast flow with a replay cache.
pub struct MutableSharedFlow<T: Clone + Send + Sync + 'static> {
    inner: Arc<SharedInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for MutableSharedFlow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Waiters to resume after the state lock is released. A cancelled waiter
/// ignores the resume.
struct Resumes<T: Send + 'static> {
    subscribers: Vec<CancellableContinuation<Option<T>>>,
    emitters: Vec<CancellableContinuation<()>>,
}

impl<T: Send + 'static> Resumes<T> {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            emitters: Vec::new(),
        }
    }

    fn run(self) {
        for waiter in self.subscribers {
            // No value in hand: the subscriber re-checks under the lock.
            waiter.resume(Ok(None));
        }
        for waiter in self.emitters {
            waiter.resume(Ok(()));
        }
    }
}

impl<T: Clone + Send + Sync + 'static> MutableSharedFlow<T> {
    /// A shared flow replaying the last `replay` values, with `extra_buffer`
    /// additional slots decoupling emitters from slow subscribers.
    ///
    /// # Panics
    ///
    /// Panics when a drop policy is combined with a zero-sized buffer — there
    /// would be nothing to drop from.
    pub fn new(replay: usize, extra_buffer: usize, overflow: Overflow) -> Self {
        assert!(
            matches!(overflow, Overflow::Suspend) || replay + extra_buffer > 0,
            "a drop overflow policy requires a positive buffer"
        );
        Self {
            inner: Arc::new(SharedInner {
                replay,
                extra: extra_buffer,
                overflow,
                state: Mutex::new(SharedState {
                    buffer: VecDeque::new(),
                    head: 0,
                    replay_barrier: 0,
                    subscribers: Vec::new(),
                    emitters: VecDeque::new(),
                    next_id: 1,
                }),
                subscriptions: MutableStateFlow::new(0),
            }),
        }
    }

    fn capacity(&self) -> usize {
        self.inner.replay + self.inner.extra
    }

    /// `true` when one more value fits: either the buffer has room, or the
    /// slowest subscriber has moved past the head so the oldest value can be
    /// evicted to make room.
    fn can_accept(&self, state: &SharedState<T>) -> bool {
        state.buffer.len() < self.capacity()
            || state.min_subscriber_index() > state.head
            || state.head < state.replay_barrier
    }

    fn evict(&self, state: &mut SharedState<T>) {
        let min_sub = state.min_subscriber_index();
        while !state.buffer.is_empty()
            && state.head < min_sub
            && (state.buffer.len() > self.inner.replay || state.head < state.replay_barrier)
        {
            state.buffer.pop_front();
            state.head += 1;
        }
    }

    /// Evict values no live subscriber needs (keeping the replay window),
    /// then admit parked emitters in FIFO order while room lasts. Lock held;
    /// resumes collected into `resumes`.
    fn advance(&self, state: &mut SharedState<T>, resumes: &mut Resumes<T>) {
        self.evict(state);
        while self.can_accept(state) {
            let Some(parked) = state.emitters.pop_front() else {
                break;
            };
            self.append(state, parked.value, resumes);
            resumes.emitters.push(parked.cc);
            self.evict(state);
        }
    }

    /// Append `value` and wake subscribers parked at the old tail. Lock held.
    fn append(&self, state: &mut SharedState<T>, value: T, resumes: &mut Resumes<T>) {
        state.buffer.push_back(value);
        let total = state.total();
        for slot in state.subscribers.iter_mut() {
            if slot.index < total {
                if let Some(waiter) = slot.waiter.take() {
                    resumes.subscribers.push(waiter);
                }
            }
        }
    }

    /// Emit without suspending. Returns `false` when the value was not
    /// accepted (Suspend policy with a full buffer and live subscribers).
    pub fn try_emit(&self, value: T) -> bool {
        let mut resumes = Resumes::new();
        let accepted;
        {
            let mut state = self.inner.state.lock().unwrap();
            accepted = self.emit_locked(&mut state, value, &mut resumes).is_ok();
        }
        resumes.run();
        accepted
    }

    /// Emit, suspending under the Suspend policy while the slowest
    /// subscriber blocks buffer progression.
    pub async fn emit(&self, value: T) -> Result<(), Failure> {
        let this = self.clone();
        suspend_cancellable(move |cc| {
            let mut resumes = Resumes::new();
            let accepted;
            {
                let mut state = this.inner.state.lock().unwrap();
                match this.emit_locked(&mut state, value, &mut resumes) {
                    Ok(()) => accepted = true,
                    Err(value) => {
                        accepted = false;
                        let id = state.next_id;
                        state.next_id += 1;
                        state.emitters.push_back(ParkedEmit {
                            id,
                            value,
                            cc: cc.clone(),
                        });
                        let cleanup = this.clone();
                        cc.invoke_on_cancellation(move |_| {
                            // A cancelled parked emit never delivers.
                            cleanup
                                .inner
                                .state
                                .lock()
                                .unwrap()
                                .emitters
                                .retain(|e| e.id != id);
                        });
                    }
                }
            }
            resumes.run();
            if accepted {
                cc.resume(Ok(()));
            }
        })
        .await
    }

    /// Core emission step. `Err` hands the value back when the emitter must
    /// park.
    fn emit_locked(
        &self,
        state: &mut SharedState<T>,
        value: T,
        resumes: &mut Resumes<T>,
    ) -> Result<(), T> {
        if state.subscribers.is_empty() {
            // No one to wait for: append and keep only the replay window.
            state.buffer.push_back(value);
            while state.buffer.len() > self.inner.replay {
                state.buffer.pop_front();
                state.head += 1;
            }
            return Ok(());
        }
        match self.inner.overflow {
            Overflow::Suspend => {
                // FIFO with already-parked emitters; no queue jumping.
                if !state.emitters.is_empty() || !self.can_accept(state) {
                    return Err(value);
                }
                self.append(state, value, resumes);
                self.evict(state);
                Ok(())
            }
            Overflow::DropOldest => {
                self.append(state, value, resumes);
                while state.buffer.len() > self.capacity() {
                    state.buffer.pop_front();
                    state.head += 1;
                }
                // Laggards jump forward, dropping what they missed.
                for slot in state.subscribers.iter_mut() {
                    if slot.index < state.head {
                        slot.index = state.head;
                    }
                }
                Ok(())
            }
            Overflow::DropLatest => {
                if state.buffer.len() >= self.capacity() {
                    // The new value is dropped.
                    return Ok(());
                }
                self.append(state, value, resumes);
                Ok(())
            }
        }
    }

    /// Drop the replay cache: new subscribers start from the next emission.
    pub fn reset_replay_cache(&self) {
        let mut resumes = Resumes::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.replay_barrier = state.total();
            self.advance(&mut state, &mut resumes);
        }
        resumes.run();
    }

    /// Number of active subscribers, observable as a state flow.
    pub fn subscription_count(&self) -> MutableStateFlow<usize> {
        self.inner.subscriptions.clone()
    }

    /// The emissions of this shared flow as a never-completing flow handle.
    pub fn as_flow(&self) -> Flow<T> {
        Flow::plain(SharedAsFlow {
            shared: self.clone(),
        })
    }

    fn register(&self) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let replay_start = state
            .total()
            .saturating_sub(self.inner.replay as u64)
            .max(state.head)
            .max(state.replay_barrier);
        state.subscribers.push(SubSlot {
            id,
            index: replay_start,
            waiter: None,
        });
        drop(state);
        self.inner.subscriptions.update(|n| n + 1);
        id
    }

    fn unregister(&self, id: u64) {
        let mut resumes = Resumes::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.subscribers.retain(|s| s.id != id);
            // The slowest subscriber may just have left.
            self.advance(&mut state, &mut resumes);
        }
        resumes.run();
        self.inner.subscriptions.update(|n| n.saturating_sub(1));
    }

    /// Take the next value for subscriber `id`, or park `cc`.
    fn take_or_park(&self, id: u64, cc: &CancellableContinuation<Option<T>>) -> Option<T> {
        let mut resumes = Resumes::new();
        let taken;
        {
            let mut state = self.inner.state.lock().unwrap();
            let head = state.head;
            let total = state.total();
            let slot_index = {
                let slot = state
                    .subscribers
                    .iter_mut()
                    .find(|s| s.id == id)
                    .expect("subscriber slot is registered");
                if slot.index < total {
                    let index = slot.index;
                    slot.index += 1;
                    Some(index)
                } else {
                    slot.waiter = Some(cc.clone());
                    None
                }
            };
            taken = slot_index.map(|index| {
                let value = state.buffer[(index - head) as usize].clone();
                self.advance(&mut state, &mut resumes);
                value
            });
        }
        resumes.run();
        taken
    }
}

struct SharedAsFlow<T: Clone + Send + Sync + 'static> {
    shared: MutableSharedFlow<T>,
}

struct SharedSubscription<T: Clone + Send + Sync + 'static> {
    shared: MutableSharedFlow<T>,
    id: u64,
}

impl<T: Clone + Send + Sync + 'static> Drop for SharedSubscription<T> {
    fn drop(&mut self) {
        self.shared.unregister(self.id);
    }
}

impl<T: Clone + Send + Sync + 'static> RawFlow<T> for SharedAsFlow<T> {
    fn collect_raw(
        self: Arc<Self>,
        collector: CollectorRef<T>,
    ) -> BoxFuture<'static, Result<(), Failure>> {
        async move {
            let id = self.shared.register();
            let subscription = SharedSubscription {
                shared: self.shared.clone(),
                id,
            };
            loop {
                let shared = subscription.shared.clone();
                let value = suspend_cancellable(move |cc| {
                    if let Some(value) = shared.take_or_park(id, &cc) {
                        cc.resume(Ok(Some(value)));
                    }
                    // Parked: an emitter resumes us with no value in hand;
                    // the next round takes it under the lock.
                })
                .await?;
                match value {
                    Some(value) => collector.emit(value).await?,
                    None => continue,
                }
            }
        }
        .boxed()
    }
}
