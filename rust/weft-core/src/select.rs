//! Select — an atomic choice among suspending clauses.
//!
//! A [`Select`] registers its clauses in declaration order. Registration
//! tries an immediate match first; if none of the clauses can complete at
//! once, each parks a registration that peers later try to commit. All
//! clauses share one decision cell, so exactly one commit wins; losing
//! registrations become dead waiters that peers skip and remove.
//!
//! Cancellation of the enclosing coroutine cancels the shared cell: pending
//! commits fail and parked registrations are released lazily.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancellable::suspend_cancellable;
use crate::channel::{Channel, SelectCont, SelectPayload};
use crate::dispatch::Runnable;
use crate::error::Failure;
use crate::job::JobHandle;
use crate::scope::Deferred;
use crate::time::{schedule_after, TimerHandle};

type Register = Box<dyn FnOnce(&SelectCont, usize) -> Option<TimerHandle> + Send>;
type Handler<R> = Box<dyn FnOnce(SelectPayload) -> Result<R, Failure> + Send>;

struct Clause<R> {
    register: Register,
    handler: Handler<R>,
}

/// Builder for an atomic choice over suspending operations.
///
/// Clauses are tried in declaration order on the fast path; on the slow path
/// the first peer to commit wins.
#[must_use]
pub struct Select<R> {
    clauses: Vec<Clause<R>>,
}

impl<R: Send + 'static> Default for Select<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> Select<R> {
    pub fn new() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    /// Clause: a value becomes receivable on `channel`.
    pub fn on_receive<E: Send + 'static>(
        mut self,
        channel: &Channel<E>,
        handler: impl FnOnce(E) -> Result<R, Failure> + Send + 'static,
    ) -> Self {
        let channel = channel.clone();
        self.clauses.push(Clause {
            register: Box::new(move |cc, index| {
                channel.register_select_receive(cc, index);
                None
            }),
            handler: Box::new(move |payload| {
                let value = payload
                    .downcast::<E>()
                    .expect("receive clause payload carries the element");
                handler(*value)
            }),
        });
        self
    }

    /// Clause: `value` becomes sendable on `channel`.
    pub fn on_send<E: Send + 'static>(
        mut self,
        channel: &Channel<E>,
        value: E,
        handler: impl FnOnce() -> Result<R, Failure> + Send + 'static,
    ) -> Self {
        let channel = channel.clone();
        self.clauses.push(Clause {
            register: Box::new(move |cc, index| {
                channel.register_select_send(value, cc, index);
                None
            }),
            handler: Box::new(move |_| handler()),
        });
        self
    }

    /// Clause: `job` reaches a terminal state. Starts a lazy job.
    pub fn on_join(
        mut self,
        job: &JobHandle,
        handler: impl FnOnce() -> Result<R, Failure> + Send + 'static,
    ) -> Self {
        let job = job.clone();
        self.clauses.push(Clause {
            register: Box::new(move |cc, index| {
                job.start();
                let cc = cc.clone();
                job.invoke_on_completion(move |_| {
                    let _ = cc.try_resume_now(
                        Ok((index, Box::new(()) as SelectPayload)),
                        None,
                    );
                });
                None
            }),
            handler: Box::new(move |_| handler()),
        });
        self
    }

    /// Clause: `deferred` completes; the handler receives its result.
    pub fn on_await<T: Clone + Send + 'static>(
        mut self,
        deferred: &Deferred<T>,
        handler: impl FnOnce(Result<T, Failure>) -> Result<R, Failure> + Send + 'static,
    ) -> Self {
        let deferred = deferred.clone();
        self.clauses.push(Clause {
            register: Box::new(move |cc, index| {
                deferred.job().start();
                let cc = cc.clone();
                let source = deferred.clone();
                deferred.job().invoke_on_completion(move |_| {
                    let result = source
                        .try_value()
                        .expect("completed deferred carries a result");
                    let _ = cc.try_resume_now(
                        Ok((index, Box::new(result) as SelectPayload)),
                        None,
                    );
                });
                None
            }),
            handler: Box::new(move |payload| {
                let result = payload
                    .downcast::<Result<T, Failure>>()
                    .expect("await clause payload carries the result");
                handler(*result)
            }),
        });
        self
    }

    /// Clause: `duration` elapses with no other clause committed.
    pub fn on_timeout(
        mut self,
        duration: Duration,
        handler: impl FnOnce() -> Result<R, Failure> + Send + 'static,
    ) -> Self {
        self.clauses.push(Clause {
            register: Box::new(move |cc, index| {
                let cc = cc.clone();
                Some(schedule_after(
                    duration,
                    Runnable::new(move || {
                        let _ = cc.try_resume_now(
                            Ok((index, Box::new(()) as SelectPayload)),
                            None,
                        );
                    }),
                ))
            }),
            handler: Box::new(move |_| handler()),
        });
        self
    }

    /// Register all clauses and suspend until one commits; run its handler.
    pub async fn run(self) -> Result<R, Failure> {
        let mut handlers: Vec<Option<Handler<R>>> = Vec::with_capacity(self.clauses.len());
        let mut registers: Vec<Register> = Vec::with_capacity(self.clauses.len());
        for clause in self.clauses {
            handlers.push(Some(clause.handler));
            registers.push(clause.register);
        }
        assert!(
            !registers.is_empty(),
            "select requires at least one clause"
        );

        let timers: Arc<Mutex<Vec<TimerHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let timers_in_block = Arc::clone(&timers);
        let committed = suspend_cancellable(move |cc| {
            for (index, register) in registers.into_iter().enumerate() {
                if !cc.is_active() {
                    // An earlier clause already committed; skip the rest.
                    break;
                }
                if let Some(timer) = register(&cc, index) {
                    timers_in_block.lock().unwrap().push(timer);
                }
            }
        })
        .await;

        for timer in timers.lock().unwrap().drain(..) {
            timer.dispose();
        }

        let (index, payload) = committed?;
        let handler = handlers
            .get_mut(index)
            .and_then(|h| h.take())
            .expect("committed clause has a handler");
        handler(payload)
    }
}
