//! Timed suspensions: `delay`, `with_timeout`, and the shared timer.
//!
//! Dispatchers may implement [`Delay`] to take over timed resumes (test and
//! virtual-time integrations do); everything else falls back to one shared
//! timer thread ordering pending entries in a binary heap. Disposing a
//! [`TimerHandle`] releases the scheduled task — the entry stays in the heap
//! and is skipped when its deadline pops.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::cancellable::suspend_cancellable;
use crate::dispatch::Runnable;
use crate::error::{Failure, FailureKind};
use crate::job::JobHandle;
use crate::task::{current_context, yield_now, ContextFuture};

// ---------------------------------------------------------------------------
// Delay capability
// ---------------------------------------------------------------------------

/// Optional dispatcher capability: schedule a task after a wall-clock delay.
pub trait Delay: Send + Sync {
    /// Schedule `task` to run after `duration`.
    fn schedule_resume_after_delay(&self, duration: Duration, task: Runnable) -> TimerHandle;

    /// Schedule a timeout action. Defaults to
    /// [`schedule_resume_after_delay`](Self::schedule_resume_after_delay);
    /// integrations that distinguish timeouts from resumes override this.
    fn invoke_on_timeout(&self, duration: Duration, task: Runnable) -> TimerHandle {
        self.schedule_resume_after_delay(duration, task)
    }
}

/// Receipt for a scheduled task; disposing prevents a not-yet-fired task from
/// running.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn noop() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn dispose(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Shared timer thread
// ---------------------------------------------------------------------------

struct TimerEntry {
    at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Runnable,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Inverted so the max-heap surfaces the earliest deadline.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerShared {
    entries: Mutex<BinaryHeap<TimerEntry>>,
    tick: Condvar,
    seq: AtomicU64,
}

static TIMER: Lazy<Arc<TimerShared>> = Lazy::new(|| {
    let shared = Arc::new(TimerShared {
        entries: Mutex::new(BinaryHeap::new()),
        tick: Condvar::new(),
        seq: AtomicU64::new(0),
    });
    let worker = Arc::clone(&shared);
    thread::Builder::new()
        .name("weft-timer".to_string())
        .spawn(move || timer_loop(worker))
        .expect("failed to spawn timer thread");
    shared
});

fn timer_loop(shared: Arc<TimerShared>) {
    let mut due: Vec<TimerEntry> = Vec::new();
    loop {
        {
            let mut entries = shared.entries.lock().unwrap();
            loop {
                let now = Instant::now();
                while entries.peek().is_some_and(|e| e.at <= now) {
                    due.push(entries.pop().unwrap());
                }
                if !due.is_empty() {
                    break;
                }
                match entries.peek().map(|e| e.at) {
                    Some(at) => {
                        let wait = at.saturating_duration_since(now);
                        let (guard, _) = shared.tick.wait_timeout(entries, wait).unwrap();
                        entries = guard;
                    }
                    None => {
                        entries = shared.tick.wait(entries).unwrap();
                    }
                }
            }
        }
        for entry in due.drain(..) {
            if !entry.cancelled.load(Ordering::Acquire) {
                entry.task.run();
            }
        }
    }
}

fn timer_schedule(duration: Duration, task: Runnable) -> TimerHandle {
    let shared = Lazy::force(&TIMER);
    let cancelled = Arc::new(AtomicBool::new(false));
    let entry = TimerEntry {
        at: Instant::now() + duration,
        seq: shared.seq.fetch_add(1, Ordering::Relaxed),
        cancelled: Arc::clone(&cancelled),
        task,
    };
    shared.entries.lock().unwrap().push(entry);
    shared.tick.notify_one();
    TimerHandle { cancelled }
}

/// Schedule `task` after `duration` through the ambient dispatcher's delay
/// capability, or the shared timer when it has none.
pub(crate) fn schedule_after(duration: Duration, task: Runnable) -> TimerHandle {
    if let Some(context) = current_context() {
        if let Some(dispatcher) = context.dispatcher() {
            if let Some(delay) = dispatcher.delay() {
                return delay.schedule_resume_after_delay(duration, task);
            }
        }
    }
    timer_schedule(duration, task)
}

// ---------------------------------------------------------------------------
// delay
// ---------------------------------------------------------------------------

/// Suspend the current coroutine for `duration`. Cancellable: cancellation
/// releases the scheduled resume and surfaces at this call.
pub async fn delay(duration: Duration) -> Result<(), Failure> {
    if duration.is_zero() {
        return yield_now().await;
    }
    suspend_cancellable(move |cc| {
        let resume_cc = cc.clone();
        let handle = schedule_after(
            duration,
            Runnable::new(move || resume_cc.resume(Ok(()))),
        );
        cc.invoke_on_cancellation(move |_| handle.dispose());
    })
    .await
}

// ---------------------------------------------------------------------------
// with_timeout
// ---------------------------------------------------------------------------

static TIMEOUT_TOKENS: AtomicU64 = AtomicU64::new(1);

async fn with_timeout_inner<T, F>(duration: Duration, body: F) -> (u64, Result<T, Failure>)
where
    F: Future<Output = Result<T, Failure>>,
{
    let token = TIMEOUT_TOKENS.fetch_add(1, Ordering::Relaxed);
    let parent_context = current_context().unwrap_or_default();
    let frame = JobHandle::new_coroutine(false, true, false, false);
    frame.set_name(parent_context.name());
    if let Some(parent) = parent_context.job() {
        parent.attach_child(&frame);
    }
    let scope_context = parent_context.with_job(frame.clone());

    let timer_frame = frame.clone();
    let timeout_failure = Failure::timed_out(duration, token);
    let handle = schedule_after(
        duration,
        Runnable::new(move || timer_frame.cancel_with(timeout_failure)),
    );

    let body_result = ContextFuture::new(scope_context, body).await;
    handle.dispose();
    frame.complete_with(match &body_result {
        Ok(_) => Ok(()),
        Err(failure) => Err(failure.clone()),
    });
    frame.wait_terminal().await;

    let result = match frame
        .completion_outcome()
        .expect("timeout frame is terminal after wait")
    {
        Ok(()) => body_result,
        Err(failure) => Err(failure),
    };
    (token, result)
}

/// Run `body` with a deadline. On expiry the block's own frame is cancelled
/// with a timeout failure that surfaces at the next suspension inside the
/// block; the enclosing coroutine continues. Any timer armed here is released
/// when the block completes first.
pub async fn with_timeout<T, F>(duration: Duration, body: F) -> Result<T, Failure>
where
    F: Future<Output = Result<T, Failure>>,
{
    let (_, result) = with_timeout_inner(duration, body).await;
    result
}

/// Like [`with_timeout`], but this frame's own expiry yields `Ok(None)`
/// instead of a failure. An outer frame's timeout still propagates.
pub async fn with_timeout_or_null<T, F>(
    duration: Duration,
    body: F,
) -> Result<Option<T>, Failure>
where
    F: Future<Output = Result<T, Failure>>,
{
    let (token, result) = with_timeout_inner(duration, body).await;
    match result {
        Ok(value) => Ok(Some(value)),
        Err(failure) => match failure.kind() {
            FailureKind::TimedOut { token: seen, .. } if *seen == token => Ok(None),
            _ => Err(failure),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::run_blocking;

    #[test]
    fn delay_suspends_for_roughly_the_duration() {
        let started = Instant::now();
        run_blocking(async move {
            delay(Duration::from_millis(25)).await?;
            Ok(())
        })
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn timeout_fires_and_outer_continues() {
        let result = run_blocking(async move {
            let timed: Result<&str, Failure> = with_timeout(Duration::from_millis(20), async {
                delay(Duration::from_secs(5)).await?;
                Ok("ok")
            })
            .await;
            let failure = timed.unwrap_err();
            assert!(failure.is_timeout());
            // The outer coroutine keeps running.
            Ok("outer-alive")
        })
        .unwrap();
        assert_eq!(result, "outer-alive");
    }

    #[test]
    fn timeout_that_never_fires_returns_the_value() {
        let result = run_blocking(async move {
            with_timeout(Duration::from_secs(5), async {
                delay(Duration::from_millis(1)).await?;
                Ok(42)
            })
            .await
        })
        .unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn with_timeout_or_null_maps_own_expiry_only() {
        let result = run_blocking(async move {
            with_timeout_or_null(Duration::from_millis(20), async {
                delay(Duration::from_secs(5)).await?;
                Ok(1)
            })
            .await
        })
        .unwrap();
        assert_eq!(result, None);

        // An outer expiry is not swallowed by the inner frame.
        let outer = run_blocking(async move {
            with_timeout(Duration::from_millis(20), async {
                with_timeout_or_null(Duration::from_secs(10), async {
                    delay(Duration::from_secs(5)).await?;
                    Ok(1)
                })
                .await
            })
            .await
        });
        assert!(outer.unwrap_err().is_timeout());
    }
}
