//! Liveness supervision
//!
//! A controller whose poll loop stops making progress is restarted: its queue
//! and cache are discarded and polling starts over.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default interval between liveness checks
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Something the supervisor can check and restart
pub trait Supervised: Send + Sync {
    fn name(&self) -> String;
    fn is_stalled(&self, now: Instant) -> bool;
    fn restart(&self);
}

/// Restarts stalled controllers
pub struct Supervisor {
    targets: Vec<Arc<dyn Supervised>>,
    interval: Duration,
}

impl Supervisor {
    pub fn new(targets: Vec<Arc<dyn Supervised>>) -> Self {
        Self {
            targets,
            interval: CHECK_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Restart every stalled target; returns how many were restarted
    pub fn check(&self) -> usize {
        let now = Instant::now();
        let mut restarted = 0;
        for target in &self.targets {
            if target.is_stalled(now) {
                warn!(controller = %target.name(), "controller stalled, restarting");
                target.restart();
                restarted += 1;
            }
        }
        restarted
    }

    /// True when no target is stalled
    pub fn healthy(&self) -> bool {
        let now = Instant::now();
        self.targets.iter().all(|t| !t.is_stalled(now))
    }

    /// Names of stalled targets
    pub fn stalled(&self) -> Vec<String> {
        let now = Instant::now();
        self.targets
            .iter()
            .filter(|t| t.is_stalled(now))
            .map(|t| t.name())
            .collect()
    }

    /// Check periodically until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.check();
                }
            }
        }
    }
}
