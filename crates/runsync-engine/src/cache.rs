//! TTL cache over a remote fetch function
//!
//! Entries are live while younger than the TTL. A miss or a stale entry calls
//! the retriever; only a successful fetch is stored, so a failed fetch is
//! retried on the very next lookup instead of being memoized.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use runsync_common::metrics::{record_cache_lookup, CacheResult};
use tokio::time::Instant;

/// Fetches the current value for an id
pub type Retriever<T, E> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

struct Entry<T> {
    value: T,
    created: Instant,
}

/// Concurrent keyed cache with age-based liveness
pub struct Cache<T, E> {
    name: String,
    entries: DashMap<String, Entry<T>>,
    ttl: Duration,
    retrieve: Retriever<T, E>,
}

impl<T, E> Cache<T, E>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, retrieve: Retriever<T, E>) -> Self {
        Self {
            name: "default".to_string(),
            entries: DashMap::new(),
            ttl,
            retrieve,
        }
    }

    /// Name reported on lookup metrics
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached value if live, otherwise a fresh fetch via [`Cache::set`]
    pub async fn get(&self, id: &str) -> Result<T, E> {
        if let Some(value) = self.live(id) {
            record_cache_lookup(&self.name, CacheResult::Hit);
            return Ok(value);
        }
        record_cache_lookup(&self.name, CacheResult::Miss);
        self.set(id).await
    }

    /// Fetch unconditionally and store the result on success
    pub async fn set(&self, id: &str) -> Result<T, E> {
        let value = (self.retrieve)(id.to_string()).await?;
        self.seed(id, value.clone());
        Ok(value)
    }

    /// Store a value fetched elsewhere (e.g. from a listing)
    pub fn seed(&self, id: &str, value: T) {
        self.entries.insert(
            id.to_string(),
            Entry {
                value,
                created: Instant::now(),
            },
        );
    }

    /// Drop one entry
    pub fn expire(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Drop every entry
    pub fn wipe(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&self, id: &str) -> Option<T> {
        let entry = self.entries.get(id)?;
        (entry.created.elapsed() < self.ttl).then(|| entry.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    fn counting_cache(ttl: Duration, fail: bool) -> (Cache<String, String>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let retrieve: Retriever<String, String> = Arc::new(move |id: String| {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if fail {
                    Err(format!("fetch {} failed", id))
                } else {
                    Ok(format!("{}@{}", id, n))
                }
            }
            .boxed()
        });
        (Cache::new(ttl, retrieve), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn get_within_ttl_fetches_once() {
        let (cache, calls) = counting_cache(Duration::from_secs(30), false);

        assert_eq!(cache.get("a").await.unwrap(), "a@1");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("a").await.unwrap(), "a@1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(cache.get("a").await.unwrap(), "a@2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_forces_refetch() {
        let (cache, calls) = counting_cache(Duration::from_secs(30), false);

        cache.get("a").await.unwrap();
        cache.expire("a");
        assert_eq!(cache.get("a").await.unwrap(), "a@2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_stored() {
        let (cache, calls) = counting_cache(Duration::from_secs(30), true);

        assert!(cache.get("a").await.is_err());
        assert!(cache.is_empty());
        assert!(cache.get("a").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn seeded_values_are_served_without_fetching() {
        let (cache, calls) = counting_cache(Duration::from_secs(30), false);

        cache.seed("b", "seeded".to_string());
        assert_eq!(cache.get("b").await.unwrap(), "seeded");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wipe_clears_everything() {
        let (cache, calls) = counting_cache(Duration::from_secs(30), false);

        cache.get("a").await.unwrap();
        cache.get("b").await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.wipe();
        assert!(cache.is_empty());
        cache.get("a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
