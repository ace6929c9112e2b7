//! Periodic discovery of active runs

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use runsync_console::{ConsoleError, Pager, RunKind, RunRecord, RunSource};
use tracing::debug;

use crate::cache::{Cache, Retriever};
use crate::queue::WorkQueue;

/// Cache of remote run records keyed by run id
pub type RunCache = Cache<RunRecord, ConsoleError>;

/// Cache whose misses fetch single runs of `kind` from `source`
pub fn run_cache(source: Arc<dyn RunSource>, kind: RunKind, ttl: Duration) -> RunCache {
    let retrieve: Retriever<RunRecord, ConsoleError> = Arc::new(move |id: String| {
        let source = source.clone();
        async move { source.get_run(kind, &id).await }.boxed()
    });
    Cache::new(ttl, retrieve).named(kind.prefix())
}

/// Random delay in `[0, bound]`
pub fn jitter(bound: Duration) -> Duration {
    let max = bound.as_millis().min(u64::MAX as u128) as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// Lists every active run of one kind, seeds the cache and enqueues each id
pub struct Poller {
    source: Arc<dyn RunSource>,
    kind: RunKind,
    page_size: usize,
    jitter: Duration,
    cache: Arc<RunCache>,
    queue: Arc<WorkQueue>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn RunSource>,
        kind: RunKind,
        page_size: usize,
        jitter: Duration,
        cache: Arc<RunCache>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            source,
            kind,
            page_size,
            jitter,
            cache,
            queue,
        }
    }

    /// One pass over all pages; returns how many runs were enqueued.
    ///
    /// Each id is delayed by a random jitter of at most the configured bound
    /// so re-checks spread out instead of arriving together.
    pub async fn poll(&self) -> Result<usize, ConsoleError> {
        let mut pager = Pager::new(self.source.as_ref(), self.kind, self.page_size);
        let mut enqueued = 0;

        while let Some(items) = pager.next_page().await? {
            for record in items {
                let id = record.id.clone();
                self.cache.seed(&id, record);
                self.queue.add_after(&id, jitter(self.jitter));
                enqueued += 1;
            }
        }

        debug!(kind = %self.kind, enqueued, "poll complete");
        Ok(enqueued)
    }
}
