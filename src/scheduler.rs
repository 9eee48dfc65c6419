//! Timer abstraction driving the one-second admission windows.
//!
//! The throttler never sleeps itself: it asks a [`Scheduler`] to run a task
//! once a delay has elapsed. [`TokioScheduler`] backs this with the tokio
//! timer, while [`ManualScheduler`] keeps a virtual clock that only moves
//! when told to, which makes admission timing fully deterministic in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Result, ThrottleError};

/// Work run once when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Source of one-shot timers.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`, unless the returned handle is cancelled first.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Handle to an outstanding timer.
///
/// Dropping the handle does not cancel the timer; call [`TimerHandle::cancel`].
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Release the timer; its task will not run if it has not already.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Scheduler backed by `tokio::time::sleep` on a captured runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on
    pub fn try_current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| ThrottleError::NoRuntime)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        // deadline is fixed now, not when the spawned task is first polled
        let deadline = tokio::time::Instant::now() + delay;
        let join: JoinHandle<()> = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            task();
        });
        TimerHandle::new(move || join.abort())
    }
}

struct ManualTimer {
    task: TimerTask,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    // keyed by (deadline, insertion order) so equal deadlines fire FIFO
    timers: BTreeMap<(Duration, u64), ManualTimer>,
}

/// Scheduler with a virtual clock advanced explicitly by the caller.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.state().now
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn pending(&self) -> usize {
        self.state()
            .timers
            .values()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Move the clock forward, firing every timer that falls due on the way.
    ///
    /// Timers scheduled by a firing task are honoured if they fall due
    /// within the same advance. Tasks run without the internal lock held.
    pub fn advance(&self, by: Duration) {
        let target = self.now() + by;
        loop {
            let due = {
                let mut state = self.state();
                let key = match state.timers.keys().next() {
                    Some(&key) if key.0 <= target => key,
                    _ => break,
                };
                state.now = key.0;
                state.timers.remove(&key)
            };
            if let Some(timer) = due {
                if !timer.cancelled.load(Ordering::SeqCst) {
                    (timer.task)();
                }
            }
        }
        let mut state = self.state();
        // a nested advance from inside a task may already be further along
        state.now = state.now.max(target);
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state();
            let deadline = state.now + delay;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.timers.insert(
                (deadline, seq),
                ManualTimer {
                    task,
                    cancelled: cancelled.clone(),
                },
            );
        }
        TimerHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}
