use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{CacheEntry, QueryKey};

struct Slot<T> {
    entry: Arc<CacheEntry<T>>,
    last_used: AtomicU64,
}

/// Memoizes paginated results per [`QueryKey`] for the lifetime of a session.
///
/// With a capacity set, the least recently used entry is evicted once the
/// cache grows past it. Without one the cache only grows.
pub struct QueryCache<T> {
    entries: DashMap<QueryKey, Slot<T>>,
    endpoint_index: DashMap<Arc<str>, DashSet<QueryKey>>,
    refresh_locks: DashMap<QueryKey, Arc<Mutex<()>>>,
    capacity: Option<NonZeroUsize>,
    clock: AtomicU64,
}

impl<T> Default for QueryCache<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> QueryCache<T> {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: NonZeroUsize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    pub fn with_capacity(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            entries: DashMap::new(),
            endpoint_index: DashMap::new(),
            refresh_locks: DashMap::new(),
            capacity,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: &QueryKey) -> Option<Arc<CacheEntry<T>>> {
        let slot = self.entries.get(key)?;
        slot.last_used.store(self.tick(), Ordering::Relaxed);
        Some(slot.entry.clone())
    }

    pub fn set(&self, key: QueryKey, entry: CacheEntry<T>) -> Arc<CacheEntry<T>> {
        let entry = Arc::new(entry);
        let slot = Slot {
            entry: entry.clone(),
            last_used: AtomicU64::new(self.tick()),
        };
        self.endpoint_index
            .entry(key.endpoint.clone())
            .or_default()
            .insert(key.clone());
        self.entries.insert(key.clone(), slot);
        self.evict_over_capacity(&key);
        entry
    }

    fn evict_over_capacity(&self, keep: &QueryKey) {
        let Some(capacity) = self.capacity else {
            return;
        };

        while self.entries.len() > capacity.get() {
            let victim = self
                .entries
                .iter()
                .filter(|r| r.key() != keep)
                .min_by_key(|r| r.value().last_used.load(Ordering::Relaxed))
                .map(|r| r.key().clone());

            match victim {
                Some(key) => {
                    debug!(endpoint = %key.endpoint, "evicting least recently used entry");
                    self.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &QueryKey) {
        self.entries.remove(key);
        if let Some(set) = self.endpoint_index.get(&key.endpoint) {
            set.remove(key);
            if set.is_empty() {
                drop(set);
                self.endpoint_index
                    .remove_if(&key.endpoint, |_, v| v.is_empty());
            }
        }
        self.refresh_locks.remove(key);
    }

    /// Drops every entry derived for `endpoint`. Returns how many were removed.
    pub fn invalidate_endpoint(&self, endpoint: &str) -> usize {
        let keys: Vec<QueryKey> = match self.endpoint_index.remove(endpoint) {
            Some((_, keys)) => keys.into_iter().collect(),
            None => return 0,
        };

        for key in &keys {
            self.entries.remove(key);
            self.refresh_locks.remove(key);
        }
        debug!(endpoint, removed = keys.len(), "invalidated endpoint");
        keys.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.endpoint_index.clear();
        self.refresh_locks.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot of every cached entry, in no particular order.
    pub fn values(&self) -> Vec<Arc<CacheEntry<T>>> {
        self.entries.iter().map(|r| r.value().entry.clone()).collect()
    }

    /// Runs `f` while holding the refresh lock for `key`, so at most one
    /// fetch per key is in flight.
    pub async fn with_refresh_lock<F, Fut, R, E>(&self, key: &QueryKey, f: F) -> Result<R, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<R, E>>,
    {
        let lock = self
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let _guard = lock.lock().await;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(endpoint: &str, params: &str) -> QueryKey {
        QueryKey {
            endpoint: Arc::from(endpoint),
            params_canonical: Arc::from(params),
        }
    }

    fn entry(result: u32) -> CacheEntry<u32> {
        CacheEntry {
            result,
            pagination: None,
        }
    }

    #[test]
    fn get_returns_the_stored_entry() {
        let cache = QueryCache::unbounded();
        let stored = cache.set(key("users", "a"), entry(1));
        let fetched = cache.get(&key("users", "a")).unwrap();
        assert!(Arc::ptr_eq(&stored, &fetched));
        assert!(cache.get(&key("users", "b")).is_none());
    }

    #[test]
    fn last_write_wins() {
        let cache = QueryCache::unbounded();
        cache.set(key("users", "a"), entry(1));
        cache.set(key("users", "a"), entry(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("users", "a")).unwrap().result, 2);
    }

    #[test]
    fn bounded_cache_evicts_least_recently_used() {
        let cache = QueryCache::bounded(NonZeroUsize::new(2).unwrap());
        cache.set(key("users", "a"), entry(1));
        cache.set(key("users", "b"), entry(2));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get(&key("users", "a")).is_some());
        cache.set(key("users", "c"), entry(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key("users", "a")));
        assert!(!cache.contains(&key("users", "b")));
        assert!(cache.contains(&key("users", "c")));
    }

    #[test]
    fn bounded_cache_of_one_keeps_newest() {
        let cache = QueryCache::bounded(NonZeroUsize::new(1).unwrap());
        cache.set(key("users", "a"), entry(1));
        cache.set(key("users", "b"), entry(2));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key("users", "b")));
    }

    #[test]
    fn invalidate_endpoint_only_touches_that_endpoint() {
        let cache = QueryCache::unbounded();
        cache.set(key("users", "a"), entry(1));
        cache.set(key("users", "b"), entry(2));
        cache.set(key("messages", "a"), entry(3));

        assert_eq!(cache.invalidate_endpoint("users"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key("messages", "a")));
        assert_eq!(cache.invalidate_endpoint("users"), 0);
    }

    #[tokio::test]
    async fn refresh_lock_serializes_same_key() {
        let cache: Arc<QueryCache<u32>> = Arc::new(QueryCache::unbounded());
        let k = key("users", "a");

        let c1 = cache.clone();
        let k1 = k.clone();
        let first = tokio::spawn(async move {
            c1.with_refresh_lock(&k1, || async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                if c1.get(&k1).is_none() {
                    c1.set(k1.clone(), entry(1));
                }
                Ok::<_, ()>(())
            })
            .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let seen = cache
            .with_refresh_lock(&k, || async { Ok::<_, ()>(cache.get(&k).map(|e| e.result)) })
            .await
            .unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(seen, Some(1));
    }
}
