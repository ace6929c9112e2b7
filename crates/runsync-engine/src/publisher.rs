//! Push invalidation
//!
//! Out-of-band change notifications arrive keyed by topic and run id. Each
//! notification drops the cached record and queues the id with no delay, so a
//! change is picked up without waiting for the next poll.

use std::sync::Arc;

use dashmap::DashMap;
use runsync_console::RunKind;
use tracing::debug;

use crate::poller::RunCache;
use crate::queue::WorkQueue;

/// Receiver of change notifications for one run kind
pub trait Publisher: Send + Sync {
    fn publish(&self, id: &str);
}

/// Topic carrying change notifications for a run kind
pub fn topic(kind: RunKind) -> &'static str {
    match kind {
        RunKind::Gate => "gate.event",
        RunKind::Stack => "stack.event",
        RunKind::Sentinel => "sentinel.event",
    }
}

/// Expires the cache entry and enqueues the id immediately
#[derive(Clone)]
pub struct Invalidator {
    kind: RunKind,
    cache: Arc<RunCache>,
    queue: Arc<WorkQueue>,
}

impl Invalidator {
    pub fn new(kind: RunKind, cache: Arc<RunCache>, queue: Arc<WorkQueue>) -> Self {
        Self { kind, cache, queue }
    }
}

impl Publisher for Invalidator {
    fn publish(&self, id: &str) {
        debug!(kind = %self.kind, run = %id, "invalidating run");
        self.cache.expire(id);
        self.queue.add(id);
    }
}

/// Routes notifications by topic
#[derive(Default)]
pub struct PublisherRegistry {
    publishers: DashMap<String, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the publisher for a topic
    pub fn register(&self, topic: impl Into<String>, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(topic.into(), publisher);
    }

    /// Deliver a notification; false when no publisher handles the topic
    pub fn publish(&self, topic: &str, id: &str) -> bool {
        let Some(publisher) = self.publishers.get(topic).map(|p| p.value().clone()) else {
            return false;
        };
        publisher.publish(id);
        true
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.publishers.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }
}
