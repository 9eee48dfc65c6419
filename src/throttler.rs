//! Admission control for throttled transformations.
//!
//! Every submitted item goes through the admission gate: a bypass predicate
//! may answer it directly, otherwise it runs immediately if the current
//! one-second window has budget left, or waits in the overflow queue. When a
//! window's timer fires the window closes and up to `qps` queued items are
//! re-admitted, opening the next window on demand.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::completion::{Completion, ItemResult, Pending};
use crate::config::ThrottlerConfig;
use crate::error::{ItemError, Result, ThrottleError};
use crate::metrics::{MetricsCollector, ThrottleMetrics};
use crate::queue::OverflowQueue;
use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};
use crate::window::{Window, WINDOW};

/// Caller-supplied transformation: receives the payload and must complete the handle.
pub type TransformFn<T, R> = Arc<dyn Fn(T, Completion<R>) + Send + Sync>;

/// Fast path: `Some(result)` answers the item without throttling.
pub type BypassFn<T, R> = Arc<dyn Fn(&T) -> Option<R> + Send + Sync>;

/// End-of-stream hook; may hand back trailing results.
pub type FlushFn<R> = Box<dyn FnOnce(Completion<Vec<R>>) + Send>;

/// How the admission gate handled a submitted item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Admission {
    /// Answered by the bypass predicate, no budget consumed
    Bypassed,
    /// Handed to the transformation in the current window
    Admitted,
    /// Waiting in the overflow queue for a later window
    Queued,
}

/// An input payload together with the handle that receives its outcome.
struct Item<T, R> {
    payload: T,
    done: Completion<R>,
}

struct State<T, R> {
    window: Window,
    queue: OverflowQueue<Item<T, R>>,
    timer: Option<TimerHandle>,
    // at most one drain loop runs at a time
    draining: bool,
    shut_down: bool,
}

struct Shared<T, R> {
    id: Uuid,
    qps: u32,
    transform: Option<TransformFn<T, R>>,
    bypass: Option<BypassFn<T, R>>,
    flush: Mutex<Option<FlushFn<R>>>,
    scheduler: Arc<dyn Scheduler>,
    metrics: MetricsCollector,
    state: Mutex<State<T, R>>,
}

/// Limits how many transformations start per one-second window.
///
/// Cloning yields another handle to the same throttler. The window timer is
/// cancelled when [`Throttler::shutdown`] is called or the last handle is
/// dropped.
pub struct Throttler<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for Throttler<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, R> fmt::Debug for Throttler<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttler")
            .field("id", &self.shared.id)
            .field("qps", &self.shared.qps)
            .finish_non_exhaustive()
    }
}

impl<T, R> Throttler<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub fn builder() -> ThrottlerBuilder<T, R> {
        ThrottlerBuilder::new()
    }

    /// Run `payload` through the admission gate.
    ///
    /// The outcome always reaches `done`, including when an error is also
    /// returned here.
    pub fn submit(&self, payload: T, done: Completion<R>) -> Result<Admission> {
        self.shared.metrics.record_submitted();
        self.shared.admit(Item { payload, done })
    }

    /// Submit `payload` and return a future resolving to its outcome
    pub fn call(&self, payload: T) -> Result<Pending<R>> {
        let (done, pending) = Completion::channel();
        self.submit(payload, done)?;
        Ok(pending)
    }

    /// Run the end-of-stream hook.
    ///
    /// The hook runs at most once; later calls complete with no trailing values.
    pub fn flush(&self, done: Completion<Vec<R>>) {
        let hook = self.shared.lock_flush().take();
        match hook {
            Some(hook) => {
                debug!(throttler = %self.shared.id, "Running flush hook");
                hook(done);
            }
            None => done.succeed(Vec::new()),
        }
    }

    /// Cancel the window timer and fail every queued item.
    pub fn shutdown(&self) {
        let (timer, queued) = {
            let mut state = self.shared.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.window.close();
            (state.timer.take(), state.queue.drain_all())
        };

        if let Some(timer) = timer {
            timer.cancel();
        }
        if !queued.is_empty() {
            warn!(
                throttler = %self.shared.id,
                queued = queued.len(),
                "Shutting down with items still queued"
            );
        }
        for item in queued {
            item.done.fail(ItemError::ShutDown);
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn qps(&self) -> u32 {
        self.shared.qps
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state().queue.len()
    }

    pub fn is_window_open(&self) -> bool {
        self.shared.state().window.is_open()
    }

    /// Items admitted into the currently open window
    pub fn admitted_in_window(&self) -> u32 {
        self.shared.state().window.admitted()
    }

    pub fn metrics(&self) -> ThrottleMetrics {
        let queue_len = self.queue_len();
        self.shared.metrics.snapshot(queue_len)
    }
}

impl<T, R> Shared<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn state(&self) -> MutexGuard<'_, State<T, R>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_flush(&self) -> MutexGuard<'_, Option<FlushFn<R>>> {
        self.flush.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_bypass(&self, payload: &T) -> Option<R> {
        self.bypass.as_ref().and_then(|bypass| bypass(payload))
    }

    fn admit(self: &Arc<Self>, item: Item<T, R>) -> Result<Admission> {
        if self.state().shut_down {
            item.done.fail(ItemError::ShutDown);
            return Err(ThrottleError::ShutDown);
        }

        if let Some(value) = self.try_bypass(&item.payload) {
            self.metrics.record_bypassed();
            item.done.succeed(value);
            return Ok(Admission::Bypassed);
        }

        let Some(transform) = self.transform.as_ref() else {
            item.done.fail(ItemError::NotImplemented);
            return Err(ThrottleError::NotImplemented);
        };

        let item = {
            let mut state = self.state();
            if state.shut_down {
                drop(state);
                item.done.fail(ItemError::ShutDown);
                return Err(ThrottleError::ShutDown);
            }

            // queued items keep priority over newcomers
            if state.draining || !state.queue.is_empty() {
                state.queue.enqueue(item);
                self.metrics.record_queued();
                debug!(throttler = %self.id, queued = state.queue.len(), "Queued behind waiting items");
                return Ok(Admission::Queued);
            }

            if !state.window.is_open() {
                self.open_window(&mut state);
            }
            if !state.window.try_admit() {
                state.queue.enqueue(item);
                self.metrics.record_queued();
                debug!(throttler = %self.id, queued = state.queue.len(), "Window exhausted, item queued");
                return Ok(Admission::Queued);
            }
            debug!(
                throttler = %self.id,
                admitted = state.window.admitted(),
                capacity = state.window.capacity(),
                "Item admitted"
            );
            item
        };

        self.metrics.record_admitted();
        transform(item.payload, item.done);
        Ok(Admission::Admitted)
    }

    fn open_window(self: &Arc<Self>, state: &mut State<T, R>) {
        state.window.open();
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = self.scheduler.schedule(
            WINDOW,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.close_window();
                }
            }),
        );
        if let Some(stale) = state.timer.replace(timer) {
            stale.cancel();
        }
        self.metrics.record_window_opened();
        info!(throttler = %self.id, capacity = self.qps, "Window opened");
    }

    fn close_window(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            let admitted = state.window.admitted();
            state.window.close();
            state.timer = None;
            if state.draining {
                // the running drain sees the fresh budget on its next pass
                debug!(throttler = %self.id, admitted, "Window closed while draining");
                return;
            }
            state.draining = true;
            info!(
                throttler = %self.id,
                admitted,
                queued = state.queue.len(),
                "Window closed"
            );
        }
        self.drain();
    }

    /// Re-admit queued items while the current window has room.
    fn drain(self: &Arc<Self>) {
        loop {
            let batch = {
                let mut state = self.state();
                if state.shut_down {
                    state.draining = false;
                    return;
                }
                let room = state.window.remaining() as usize;
                let batch = state.queue.dequeue_up_to(room);
                if batch.is_empty() {
                    state.draining = false;
                    return;
                }
                batch
            };

            // waiting items may have become answerable, e.g. through a cache
            let mut candidates = Vec::with_capacity(batch.len());
            for item in batch {
                match self.try_bypass(&item.payload) {
                    Some(value) => {
                        self.metrics.record_bypassed();
                        self.metrics.record_drained(1);
                        item.done.succeed(value);
                    }
                    None => candidates.push(item),
                }
            }
            if candidates.is_empty() {
                continue;
            }

            let Some(transform) = self.transform.as_ref() else {
                for item in candidates {
                    item.done.fail(ItemError::NotImplemented);
                }
                continue;
            };

            let admitted = {
                let mut state = self.state();
                if state.shut_down {
                    state.draining = false;
                    drop(state);
                    for item in candidates {
                        item.done.fail(ItemError::ShutDown);
                    }
                    return;
                }

                let mut admitted = Vec::with_capacity(candidates.len());
                let mut overflow = Vec::new();
                for item in candidates {
                    if !state.window.is_open() {
                        self.open_window(&mut state);
                    }
                    if state.window.try_admit() {
                        admitted.push(item);
                    } else {
                        overflow.push(item);
                    }
                }
                if !overflow.is_empty() {
                    debug!(
                        throttler = %self.id,
                        overflow = overflow.len(),
                        "Drained items exceed window, requeued at head"
                    );
                    state.queue.requeue_front(overflow);
                }
                admitted
            };

            self.metrics.record_drained(admitted.len());
            debug!(throttler = %self.id, released = admitted.len(), "Drained queued items");
            for item in admitted {
                self.metrics.record_admitted();
                transform(item.payload, item.done);
            }
        }
    }
}

impl<T, R> Drop for Shared<T, R> {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }
}

/// Builder wiring the transformation, bypass predicate, flush hook and
/// timer source into a [`Throttler`].
pub struct ThrottlerBuilder<T, R> {
    config: ThrottlerConfig,
    transform: Option<TransformFn<T, R>>,
    bypass: Option<BypassFn<T, R>>,
    flush: Option<FlushFn<R>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl<T, R> Default for ThrottlerBuilder<T, R> {
    fn default() -> Self {
        Self {
            config: ThrottlerConfig::default(),
            transform: None,
            bypass: None,
            flush: None,
            scheduler: None,
        }
    }
}

impl<T, R> ThrottlerBuilder<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn qps(mut self, qps: u32) -> Self {
        self.config.qps = qps;
        self
    }

    pub fn config(mut self, config: ThrottlerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(T, Completion<R>) + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Use an async function as the transformation.
    ///
    /// Each admitted item is spawned onto the current tokio runtime.
    pub fn transform_async<F, Fut>(self, transform: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ItemResult<R>> + Send + 'static,
    {
        self.transform(move |payload, done: Completion<R>| match Handle::try_current() {
            Ok(handle) => {
                let work = transform(payload);
                handle.spawn(async move { done.complete(work.await) });
            }
            Err(_) => done.fail(ItemError::transform(ThrottleError::NoRuntime)),
        })
    }

    pub fn bypass<F>(mut self, bypass: F) -> Self
    where
        F: Fn(&T) -> Option<R> + Send + Sync + 'static,
    {
        self.bypass = Some(Arc::new(bypass));
        self
    }

    pub fn flush<F>(mut self, flush: F) -> Self
    where
        F: FnOnce(Completion<Vec<R>>) + Send + 'static,
    {
        self.flush = Some(Box::new(flush));
        self
    }

    pub fn scheduler<S>(mut self, scheduler: S) -> Self
    where
        S: Scheduler + 'static,
    {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    /// Validate the configuration and create the throttler.
    ///
    /// Without an explicit scheduler this must be called from within a tokio
    /// runtime. A missing transformation is not an error here; it surfaces as
    /// `NotImplemented` on the first submission that needs it.
    pub fn build(self) -> Result<Throttler<T, R>> {
        self.config.validate()?;
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::try_current()?),
        };

        let id = Uuid::new_v4();
        debug!(throttler = %id, qps = self.config.qps, "Throttler created");

        Ok(Throttler {
            shared: Arc::new(Shared {
                id,
                qps: self.config.qps,
                transform: self.transform,
                bypass: self.bypass,
                flush: Mutex::new(self.flush),
                scheduler,
                metrics: MetricsCollector::new(),
                state: Mutex::new(State {
                    window: Window::new(self.config.qps),
                    queue: OverflowQueue::new(),
                    timer: None,
                    draining: false,
                    shut_down: false,
                }),
            }),
        })
    }
}
