//! Worker pool draining the work queue for one run kind
//!
//! Per dequeued id:
//! - the record is resolved through the TTL cache
//! - a vanished or finished run is handed to [`Reconcile::retire`]
//! - anything else goes to [`Reconcile::reconcile`]
//!
//! The result feeds the queue: an error backs off, a requested requeue resets
//! the backoff and schedules the id again, success resets the backoff. Every
//! pass is timed and counted by outcome in [`runsync_common::metrics`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use runsync_common::metrics::{ReconcileOutcome, ReconcileTimer};
use runsync_console::{RunKind, RunRecord, RunSource};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::poller::{run_cache, Poller, RunCache};
use crate::publisher::Invalidator;
use crate::queue::WorkQueue;
use crate::supervisor::Supervised;

/// Polls without progress tolerated before a controller counts as stalled
pub const STALL_FACTOR: u32 = 5;

// =============================================================================
// Action
// =============================================================================

/// What to do with an id after a successful pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
    refresh: bool,
}

impl Action {
    /// Process the id again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
            refresh: false,
        }
    }

    /// Wait for the next poll or push notification
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
            refresh: false,
        }
    }

    /// Drop the cached record so the next pass fetches it again. Used after
    /// the remote state was changed by this pass.
    pub fn with_refresh(mut self) -> Self {
        self.refresh = true;
        self
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }

    pub fn refreshes(&self) -> bool {
        self.refresh
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Per-run logic plugged into a [`Controller`]
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    /// Bring local state for a live run in line with its record
    async fn reconcile(&self, record: &RunRecord) -> Result<Action, Self::Error>;

    /// Clean up local state for a run that vanished upstream or finished
    async fn retire(&self, kind: RunKind, id: &str) -> Result<(), Self::Error>;
}

// =============================================================================
// Controller
// =============================================================================

/// Tuning for one controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub kind: RunKind,
    pub poll_interval: Duration,
    /// Upper bound of the random delay before a polled run is queued
    pub poll_jitter: Duration,
    pub cache_ttl: Duration,
    pub workers: usize,
    pub page_size: usize,
}

impl ControllerConfig {
    pub fn new(kind: RunKind) -> Self {
        Self {
            kind,
            poll_interval: Duration::from_secs(120),
            poll_jitter: Duration::from_secs(120),
            cache_ttl: Duration::from_secs(60),
            workers: 20,
            page_size: 100,
        }
    }
}

/// What a worker did with one id
enum Pass {
    Reconciled(Action),
    Retired,
}

impl Pass {
    fn into_action(self) -> Action {
        match self {
            Self::Reconciled(action) => action,
            Self::Retired => Action::await_change(),
        }
    }
}

fn outcome(result: &Result<Pass, EngineError>) -> ReconcileOutcome {
    match result {
        Err(_) => ReconcileOutcome::Error,
        Ok(Pass::Retired) => ReconcileOutcome::Retired,
        Ok(Pass::Reconciled(action)) if action.requeue_after().is_some() => {
            ReconcileOutcome::Requeue
        }
        Ok(Pass::Reconciled(_)) => ReconcileOutcome::AwaitChange,
    }
}

#[derive(Default)]
struct Heartbeat {
    epoch: Option<Instant>,
    last_poll: Option<Instant>,
    last_reconcile: Option<Instant>,
}

/// Queue, cache, poller and worker pool for one run kind
pub struct Controller<R> {
    config: ControllerConfig,
    cache: Arc<RunCache>,
    queue: Arc<WorkQueue>,
    poller: Poller,
    reconciler: Arc<R>,
    heartbeat: Mutex<Heartbeat>,
    restart_signal: Notify,
}

impl<R: Reconcile> Controller<R> {
    pub fn new(config: ControllerConfig, source: Arc<dyn RunSource>, reconciler: Arc<R>) -> Self {
        let cache = Arc::new(run_cache(source.clone(), config.kind, config.cache_ttl));
        let queue = Arc::new(WorkQueue::default());
        let poller = Poller::new(
            source,
            config.kind,
            config.page_size,
            config.poll_jitter,
            cache.clone(),
            queue.clone(),
        );
        Self {
            config,
            cache,
            queue,
            poller,
            reconciler,
            heartbeat: Mutex::new(Heartbeat {
                epoch: Some(Instant::now()),
                ..Default::default()
            }),
            restart_signal: Notify::new(),
        }
    }

    pub fn kind(&self) -> RunKind {
        self.config.kind
    }

    pub fn cache(&self) -> &Arc<RunCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Push invalidator bound to this controller's cache and queue
    pub fn invalidator(&self) -> Invalidator {
        Invalidator::new(self.config.kind, self.cache.clone(), self.queue.clone())
    }

    /// One poll pass; records the poll time on success
    pub async fn poll(&self) -> Result<usize, EngineError> {
        let n = self.poller.poll().await?;
        self.heartbeat.lock().last_poll = Some(Instant::now());
        Ok(n)
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.heartbeat.lock().last_poll
    }

    pub fn last_reconcile(&self) -> Option<Instant> {
        self.heartbeat.lock().last_reconcile
    }

    /// Take one id off the queue and process it. Returns false once the
    /// queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(id) = self.queue.get().await else {
            return false;
        };

        let timer = ReconcileTimer::start(self.config.kind.prefix());
        let result = self.process(&id).await;
        timer.finish(outcome(&result));
        self.handle_result(&id, result.map(Pass::into_action));
        self.queue.done(&id);
        true
    }

    async fn process(&self, id: &str) -> Result<Pass, EngineError> {
        let kind = self.config.kind;
        let record = match self.cache.get(id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                info!(kind = %kind, run = %id, "run no longer exists upstream");
                self.retire(id).await?;
                return Ok(Pass::Retired);
            }
            Err(e) => return Err(e.into()),
        };

        if record.is_ignorable() {
            debug!(kind = %kind, run = %id, status = %record.status, "run finished");
            self.retire(id).await?;
            return Ok(Pass::Retired);
        }

        let action = self
            .reconciler
            .reconcile(&record)
            .await
            .map_err(|e| EngineError::Reconcile(e.to_string()))?;
        self.heartbeat.lock().last_reconcile = Some(Instant::now());
        Ok(Pass::Reconciled(action))
    }

    async fn retire(&self, id: &str) -> Result<(), EngineError> {
        self.reconciler
            .retire(self.config.kind, id)
            .await
            .map_err(|e| EngineError::Reconcile(e.to_string()))
    }

    fn handle_result(&self, id: &str, result: Result<Action, EngineError>) {
        match result {
            Err(e) => {
                warn!(
                    kind = %self.config.kind,
                    run = %id,
                    error = %e,
                    requeues = self.queue.num_requeues(id),
                    "reconciliation failed"
                );
                self.queue.add_rate_limited(id);
            }
            Ok(action) => {
                self.queue.forget(id);
                if action.refreshes() {
                    self.cache.expire(id);
                }
                if let Some(after) = action.requeue_after() {
                    self.queue.add_after(id, after);
                }
            }
        }
    }

    /// Discard queued work and cached records and restart the poll loop.
    /// In-flight ids are not preserved; the next poll rediscovers them.
    pub fn restart(&self) {
        self.queue.reset();
        self.cache.wipe();
        {
            let mut hb = self.heartbeat.lock();
            hb.epoch = Some(Instant::now());
            hb.last_poll = None;
        }
        self.restart_signal.notify_one();
    }

    /// Stop intake and release workers
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Run the poll loop and worker pool until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            kind = %self.config.kind,
            workers = self.config.workers,
            interval_secs = self.config.poll_interval.as_secs(),
            "starting controller"
        );

        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            let ctrl = self.clone();
            workers.spawn(async move { while ctrl.process_next_work_item().await {} });
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.restart_signal.notified() => {
                    ticker.reset_immediately();
                    continue;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.restart_signal.notified() => {
                    warn!(kind = %self.config.kind, "poll abandoned by restart");
                    ticker.reset_immediately();
                }
                result = self.poll() => {
                    if let Err(e) = result {
                        warn!(kind = %self.config.kind, error = %e, "poll failed");
                    }
                }
            }
        }

        self.shutdown();
        while workers.join_next().await.is_some() {}
        info!(kind = %self.config.kind, "controller stopped");
    }
}

impl<R: Reconcile> Supervised for Controller<R> {
    fn name(&self) -> String {
        self.config.kind.to_string()
    }

    /// Stalled when no poll succeeded within [`STALL_FACTOR`] intervals of the
    /// last poll, start or restart
    fn is_stalled(&self, now: Instant) -> bool {
        let hb = self.heartbeat.lock();
        let Some(since) = hb.last_poll.or(hb.epoch) else {
            return false;
        };
        now.saturating_duration_since(since) > self.config.poll_interval * STALL_FACTOR
    }

    fn restart(&self) {
        Controller::restart(self)
    }
}
