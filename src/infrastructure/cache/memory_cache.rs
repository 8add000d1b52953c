//! In-memory LRU cache with cost, count and age limits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::domain::entities::{CacheKey, LifecycleEvent};

/// Limits for a [`MemoryCache`]. `MAX` values mean unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheConfig {
    /// Total cost limit.
    pub cost_limit: u64,
    /// Entry count limit.
    pub count_limit: u64,
    /// Maximum time since last access.
    pub age_limit: Duration,
    /// Interval of the background trim pass.
    pub trim_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            cost_limit: u64::MAX,
            count_limit: u64::MAX,
            age_limit: Duration::MAX,
            trim_interval: Duration::from_secs(5),
        }
    }
}

struct Entry<V> {
    value: V,
    cost: u64,
    last_access: Instant,
}

struct Inner<V> {
    lru: LruCache<CacheKey, Entry<V>>,
    total_cost: u64,
    cost_limit: u64,
    count_limit: u64,
    age_limit: Duration,
}

impl<V> Inner<V> {
    fn total_count(&self) -> u64 {
        self.lru.len() as u64
    }

    fn remove_all(&mut self) -> Vec<Entry<V>> {
        self.total_cost = 0;
        let mut removed = Vec::with_capacity(self.lru.len());
        while let Some((_, entry)) = self.lru.pop_lru() {
            removed.push(entry);
        }
        removed
    }

    fn pop_tail(&mut self) -> Option<(CacheKey, Entry<V>)> {
        let (key, entry) = self.lru.pop_lru()?;
        self.total_cost -= entry.cost;
        Some((key, entry))
    }
}

struct Shared<V> {
    inner: Mutex<Inner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> Shared<V> {
    fn clear(&self) {
        let removed = self.inner.lock().remove_all();
        debug!(entries = removed.len(), "memory cache cleared");
    }

    /// Removes tail entries one lock acquisition at a time while `over`
    /// holds. Evicted values are dropped outside the lock.
    fn trim_while(&self, reason: &str, mut over: impl FnMut(&Inner<V>) -> bool) {
        loop {
            let evicted = {
                let mut inner = self.inner.lock();
                if inner.lru.is_empty() || !over(&inner) {
                    return;
                }
                inner.pop_tail()
            };
            if let Some((key, _)) = evicted {
                trace!(key = %key, reason, "memory cache evicted");
            }
        }
    }

    fn trim_to_cost(&self, limit: u64) {
        if limit == 0 {
            self.clear();
            return;
        }
        if limit == u64::MAX {
            return;
        }
        self.trim_while("cost", |inner| inner.total_cost > limit);
    }

    fn trim_to_count(&self, limit: u64) {
        if limit == 0 {
            self.clear();
            return;
        }
        if limit == u64::MAX {
            return;
        }
        self.trim_while("count", |inner| inner.total_count() > limit);
    }

    fn trim_to_age(&self, limit: Duration) {
        if limit.is_zero() {
            self.clear();
            return;
        }
        if limit == Duration::MAX {
            return;
        }
        let now = Instant::now();
        self.trim_while("age", |inner| {
            inner
                .lru
                .peek_lru()
                .is_some_and(|(_, entry)| now.saturating_duration_since(entry.last_access) > limit)
        });
    }

    fn trim_to_limits(&self) {
        let (cost, count, age) = {
            let inner = self.inner.lock();
            (inner.cost_limit, inner.count_limit, inner.age_limit)
        };
        self.trim_to_cost(cost);
        self.trim_to_count(count);
        self.trim_to_age(age);
    }
}

impl<V: Send + 'static> Shared<V> {
    /// Runs `trim` on the blocking pool, or inline outside a runtime.
    fn schedule(self: &Arc<Self>, trim: impl FnOnce(&Self) + Send + 'static) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                drop(handle.spawn_blocking(move || trim(&*shared)));
            }
            Err(_) => trim(&**self),
        }
    }
}

/// Thread-safe LRU cache keyed by [`CacheKey`].
///
/// Every entry carries a caller-supplied cost. Inserting past the count
/// limit evicts the least recently used entry immediately; exceeding the cost
/// limit schedules a trim on the blocking pool. A background pass enforces
/// all limits, including age, on a fixed interval.
pub struct MemoryCache<V> {
    shared: Arc<Shared<V>>,
    trim_task: Option<JoinHandle<()>>,
}

impl<V: Clone + Send + Sync + 'static> MemoryCache<V> {
    /// Creates a cache. Inside a tokio runtime the periodic trim pass starts
    /// immediately.
    #[must_use]
    pub fn new(config: MemoryCacheConfig) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                total_cost: 0,
                cost_limit: config.cost_limit,
                count_limit: config.count_limit,
                age_limit: config.age_limit,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });

        let trim_task = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| spawn_trim_loop(&handle, &shared, config.trim_interval));

        Self { shared, trim_task }
    }

    /// Returns the value for `key` and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut inner = self.shared.inner.lock();
        if let Some(entry) = inner.lru.get_mut(key) {
            entry.last_access = Instant::now();
            self.shared.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "memory cache hit");
            Some(entry.value.clone())
        } else {
            self.shared.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "memory cache miss");
            None
        }
    }

    /// Returns true if `key` is cached, without touching its recency.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.shared.inner.lock().lru.contains(key)
    }

    /// Inserts or replaces `key` as the most recently used entry.
    pub fn put(&self, key: CacheKey, value: V, cost: u64) {
        let (evicted, over_cost) = {
            let mut inner = self.shared.inner.lock();
            let entry = Entry {
                value,
                cost,
                last_access: Instant::now(),
            };
            if let Some(old) = inner.lru.put(key.clone(), entry) {
                inner.total_cost -= old.cost;
            }
            inner.total_cost += cost;

            let evicted = if inner.total_count() > inner.count_limit {
                inner.pop_tail()
            } else {
                None
            };
            (evicted, inner.total_cost > inner.cost_limit)
        };

        debug!(key = %key, cost, "memory cache stored");
        if let Some((evicted, _)) = evicted {
            trace!(key = %evicted, reason = "count", "memory cache evicted");
        }
        if over_cost {
            self.shared.schedule(|shared| {
                let limit = shared.inner.lock().cost_limit;
                shared.trim_to_cost(limit);
            });
        }
    }

    /// Removes `key`. Returns true if it was cached.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut inner = self.shared.inner.lock();
            let removed = inner.lru.pop(key);
            if let Some(entry) = &removed {
                inner.total_cost -= entry.cost;
            }
            removed
        };
        removed.is_some()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.shared.clear();
    }

    /// Sets the cost limit and trims to it in the background.
    pub fn set_cost_limit(&self, limit: u64) {
        self.shared.inner.lock().cost_limit = limit;
        self.shared.schedule(move |shared| shared.trim_to_cost(limit));
    }

    /// Sets the count limit and trims to it in the background.
    pub fn set_count_limit(&self, limit: u64) {
        self.shared.inner.lock().count_limit = limit;
        self.shared.schedule(move |shared| shared.trim_to_count(limit));
    }

    /// Sets the age limit and trims to it in the background.
    pub fn set_age_limit(&self, limit: Duration) {
        self.shared.inner.lock().age_limit = limit;
        self.shared.schedule(move |shared| shared.trim_to_age(limit));
    }

    /// Evicts least recently used entries until the total cost is at most
    /// `limit`. A limit of 0 clears the cache.
    pub fn trim_to_cost(&self, limit: u64) {
        self.shared.trim_to_cost(limit);
    }

    /// Evicts least recently used entries until at most `limit` remain.
    pub fn trim_to_count(&self, limit: u64) {
        self.shared.trim_to_count(limit);
    }

    /// Evicts entries not accessed within `limit`.
    pub fn trim_to_age(&self, limit: Duration) {
        self.shared.trim_to_age(limit);
    }

    /// Sum of the costs of all entries.
    #[must_use]
    pub fn total_cost(&self) -> u64 {
        self.shared.inner.lock().total_cost
    }

    /// Number of entries.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.shared.inner.lock().total_count()
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.shared.hits.load(Ordering::Relaxed);
        let misses = self.shared.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let (size, total_cost) = {
            let inner = self.shared.inner.lock();
            (inner.lru.len(), inner.total_cost)
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            size,
            total_cost,
        }
    }

    /// Clears the cache on memory pressure or backgrounding.
    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        if event.releases_memory() {
            info!(?event, "clearing memory cache");
            self.clear();
        }
    }

    /// Follows lifecycle signals until the sender closes or the cache is
    /// dropped.
    pub fn watch_lifecycle(&self, mut events: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.releases_memory() => {
                        let Some(shared) = weak.upgrade() else {
                            break;
                        };
                        info!(?event, "clearing memory cache");
                        shared.clear();
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        if let Some(task) = self.trim_task.take() {
            task.abort();
        }
    }
}

fn spawn_trim_loop<V: Send + 'static>(
    handle: &tokio::runtime::Handle,
    shared: &Arc<Shared<V>>,
    period: Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let trimmed = tokio::task::spawn_blocking(move || shared.trim_to_limits()).await;
            if trimmed.is_err() {
                tracing::error!("memory cache trim task panicked");
            }
        }
    })
}

/// Statistics about cache performance.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached entries.
    pub size: usize,
    /// Sum of entry costs.
    pub total_cost: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} entries ({} bytes), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.total_cost, self.hit_rate, self.hits, self.misses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s)
    }

    fn cache(config: MemoryCacheConfig) -> MemoryCache<u32> {
        MemoryCache::new(config)
    }

    fn with_count(limit: u64) -> MemoryCache<u32> {
        cache(MemoryCacheConfig {
            count_limit: limit,
            ..MemoryCacheConfig::default()
        })
    }

    #[test]
    fn test_put_and_get() {
        let cache = with_count(10);
        cache.put(key("a"), 1, 10);
        assert_eq!(cache.get(&key("a")), Some(1));
        assert_eq!(cache.get(&key("b")), None);
        assert_eq!(cache.total_cost(), 10);
    }

    #[test]
    fn test_count_overflow_evicts_least_recently_used() {
        let cache = with_count(3);
        cache.put(key("a"), 1, 1);
        cache.put(key("b"), 2, 1);
        cache.put(key("c"), 3, 1);
        assert_eq!(cache.get(&key("a")), Some(1));

        cache.put(key("d"), 4, 1);
        assert!(!cache.contains(&key("b")));

        cache.put(key("e"), 5, 1);
        assert!(!cache.contains(&key("c")));
        assert!(cache.contains(&key("a")));
        assert_eq!(cache.total_count(), 3);
    }

    #[test]
    fn test_replace_updates_cost() {
        let cache = with_count(10);
        cache.put(key("a"), 1, 100);
        cache.put(key("a"), 2, 30);
        assert_eq!(cache.total_cost(), 30);
        assert_eq!(cache.total_count(), 1);
        assert_eq!(cache.get(&key("a")), Some(2));
    }

    #[test]
    fn test_cost_overflow_trims_inline_without_runtime() {
        let cache = cache(MemoryCacheConfig {
            cost_limit: 100,
            ..MemoryCacheConfig::default()
        });
        cache.put(key("a"), 1, 60);
        cache.put(key("b"), 2, 60);
        assert!(!cache.contains(&key("a")));
        assert_eq!(cache.total_cost(), 60);
    }

    #[tokio::test]
    async fn test_cost_overflow_trims_in_background() {
        let cache = cache(MemoryCacheConfig {
            cost_limit: 100,
            ..MemoryCacheConfig::default()
        });
        cache.put(key("a"), 1, 60);
        cache.put(key("b"), 2, 60);
        for _ in 0..100 {
            if cache.total_cost() <= 100 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(cache.total_cost(), 60);
        assert!(cache.contains(&key("b")));
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = with_count(10);
        cache.put(key("a"), 1, 5);
        cache.put(key("b"), 2, 7);
        assert!(cache.remove(&key("a")));
        assert!(!cache.remove(&key("a")));
        assert_eq!(cache.total_cost(), 7);

        cache.clear();
        assert_eq!(cache.total_count(), 0);
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_zero_limit_clears() {
        let cache = with_count(10);
        cache.put(key("a"), 1, 5);
        cache.trim_to_count(0);
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_trim_to_age() {
        let cache = with_count(10);
        cache.put(key("old"), 1, 1);
        std::thread::sleep(Duration::from_millis(30));
        cache.put(key("new"), 2, 1);

        cache.trim_to_age(Duration::from_millis(15));
        assert!(!cache.contains(&key("old")));
        assert!(cache.contains(&key("new")));
    }

    #[test]
    fn test_set_count_limit_trims() {
        let cache = with_count(10);
        for i in 0..5 {
            cache.put(key(&i.to_string()), i, 1);
        }
        cache.set_count_limit(2);
        assert_eq!(cache.total_count(), 2);
        assert!(cache.contains(&key("3")) && cache.contains(&key("4")));
    }

    #[test]
    fn test_stats() {
        let cache = with_count(10);
        cache.put(key("a"), 1, 3);
        let _ = cache.get(&key("a"));
        let _ = cache.get(&key("missing"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.total_cost, 3);
        assert!(stats.to_string().contains("50.0% hit rate"));
    }

    #[test]
    fn test_memory_warning_clears() {
        let cache = with_count(10);
        cache.put(key("a"), 1, 1);
        cache.handle_lifecycle(LifecycleEvent::BecameActive);
        assert_eq!(cache.total_count(), 1);
        cache.handle_lifecycle(LifecycleEvent::MemoryWarning);
        assert_eq!(cache.total_count(), 0);
    }

    #[tokio::test]
    async fn test_background_pass_enforces_age() {
        let cache = cache(MemoryCacheConfig {
            age_limit: Duration::from_millis(20),
            trim_interval: Duration::from_millis(10),
            ..MemoryCacheConfig::default()
        });
        cache.put(key("a"), 1, 1);
        assert!(cache.contains(&key("a")));

        for _ in 0..100 {
            if cache.total_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.total_count(), 0);
    }
}
