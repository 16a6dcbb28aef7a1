//! Category-partitioned cache with TTL expiry and LRU eviction.
//!
//! One [`PerformanceCache`] is built per process and shared (via `Arc`) by
//! every component that caches something: ranked context lists, tool
//! outputs, history snapshots. Each category is an independent shard with
//! its own entry limit and its own mutex, so writers on different
//! categories never contend and writers on the same key never interleave.
//!
//! Values are stored as JSON. Typed access goes through [`PerformanceCache::get`]
//! and [`PerformanceCache::set`]; a value that fails to (de)serialize is
//! logged and treated as a miss.
//!
//! Expired entries are removed lazily when touched, and proactively by the
//! background sweeper started with [`PerformanceCache::spawn_sweeper`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;

/// Floor for the sweep period; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// A single cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub category: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_access: Instant,
    /// Monotonic per-shard counter; the smallest tick is the LRU entry.
    access_tick: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct CategoryShard {
    entries: HashMap<String, CacheEntry>,
    max_entries: usize,
    tick: u64,
}

impl CategoryShard {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    /// Remove the least-recently-used entry, returning its key.
    fn evict_lru(&mut self) -> Option<String> {
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.access_tick)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&lru_key);
        Some(lru_key)
    }
}

/// Snapshot of cache diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared key/value cache partitioned by category.
#[derive(Debug)]
pub struct PerformanceCache {
    config: CacheConfig,
    shards: RwLock<HashMap<String, Arc<Mutex<CategoryShard>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl PerformanceCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            shards: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// TTL callers should use when they have no specific one.
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    fn shard(&self, category: &str) -> Arc<Mutex<CategoryShard>> {
        {
            let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
            if let Some(shard) = shards.get(category) {
                return Arc::clone(shard);
            }
        }
        let mut shards = self.shards.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(shards.entry(category.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(CategoryShard::new(
                self.config.max_entries_for(category),
            )))
        }))
    }

    fn existing_shards(&self) -> Vec<Arc<Mutex<CategoryShard>>> {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        shards.values().cloned().collect()
    }

    /// Look up a raw JSON value. Expired entries are removed and reported as
    /// a miss.
    pub fn get_value(&self, key: &str, category: &str) -> Option<serde_json::Value> {
        let shard = self.shard(category);
        let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let expired = match shard.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            shard.entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!("[cache] {category}/{key} expired on access");
            return None;
        }

        let tick = shard.next_tick();
        let entry = shard.entries.get_mut(key)?;
        entry.access_tick = tick;
        entry.last_access = now;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Store a raw JSON value. Inserting a new key into a full category
    /// first drops expired entries, then evicts the least-recently-used one.
    pub fn set_value(&self, key: &str, value: serde_json::Value, category: &str, ttl: Duration) {
        let shard = self.shard(category);
        let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let tick = shard.next_tick();

        if let Some(entry) = shard.entries.get_mut(key) {
            entry.value = value;
            entry.created_at = now;
            entry.expires_at = now + ttl;
            entry.last_access = now;
            entry.access_tick = tick;
            return;
        }

        if shard.entries.len() >= shard.max_entries {
            let expired = shard.remove_expired(now);
            self.expirations.fetch_add(expired as u64, Ordering::Relaxed);
        }
        while shard.entries.len() >= shard.max_entries {
            match shard.evict_lru() {
                Some(evicted) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("[cache] evicted LRU entry {category}/{evicted}");
                }
                None => break,
            }
        }

        shard.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                category: category.to_string(),
                created_at: now,
                expires_at: now + ttl,
                last_access: now,
                access_tick: tick,
            },
        );
    }

    /// Typed lookup. Returns an error when the stored value doesn't
    /// deserialize into `T`.
    pub fn try_get<T: DeserializeOwned>(
        &self,
        key: &str,
        category: &str,
    ) -> Result<Option<T>, CacheError> {
        let Some(value) = self.get_value(key, category) else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| CacheError::Deserialize {
                category: category.to_string(),
                key: key.to_string(),
                source,
            })
    }

    /// Typed lookup where a deserialization failure counts as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str, category: &str) -> Option<T> {
        match self.try_get(key, category) {
            Ok(v) => v,
            Err(e) => {
                warn!("[cache] {e}; treating as miss");
                None
            }
        }
    }

    /// Typed store.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        category: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(|source| CacheError::Serialize {
            category: category.to_string(),
            key: key.to_string(),
            source,
        })?;
        self.set_value(key, value, category, ttl);
        Ok(())
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str, category: &str) -> bool {
        let shard = self.shard(category);
        let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
        shard.entries.remove(key).is_some()
    }

    /// Remove every entry of a category. Returns how many were removed.
    pub fn clear_category(&self, category: &str) -> usize {
        let shard = self.shard(category);
        let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
        let removed = shard.entries.len();
        shard.entries.clear();
        removed
    }

    /// Remove every expired entry in every category.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed: usize = self
            .existing_shards()
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove_expired(now)
            })
            .sum();
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("[cache] sweep removed {removed} expired entries");
        }
        removed
    }

    /// Start the periodic expiry sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.sweep_expired();
            }
        })
    }

    /// Stored entries in a category, including not-yet-swept expired ones.
    pub fn len(&self, category: &str) -> usize {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        shards.get(category).map_or(0, |shard| {
            shard.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
        })
    }

    /// Whether a category holds no entries.
    pub fn is_empty(&self, category: &str) -> bool {
        self.len(category) == 0
    }

    /// Current diagnostics.
    pub fn stats(&self) -> CacheStats {
        let entries: usize = self
            .existing_shards()
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).entries.len())
            .sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries,
        }
    }
}

impl Default for PerformanceCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// FNV-1a hash, used for cache keys and content hashes.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(10);

    fn small_cache(max: usize) -> PerformanceCache {
        PerformanceCache::new(CacheConfig {
            default_max_entries: max,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_round_trips() {
        let cache = small_cache(10);
        cache.set("k", &json!({"answer": 42}), "ctx", TTL).unwrap();
        assert_eq!(cache.get_value("k", "ctx"), Some(json!({"answer": 42})));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = small_cache(10);
        cache.set("k", "v", "ctx", TTL).unwrap();

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert_eq!(cache.get::<String>("k", "ctx").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get::<String>("k", "ctx"), None);
        // Lazy removal on access.
        assert_eq!(cache.len("ctx"), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lru_evicts_exactly_least_recently_used() {
        let cache = small_cache(3);
        cache.set("a", &1, "tools", TTL).unwrap();
        cache.set("b", &2, "tools", TTL).unwrap();
        cache.set("c", &3, "tools", TTL).unwrap();

        // Touch "a" so "b" becomes the LRU entry.
        assert_eq!(cache.get::<i32>("a", "tools"), Some(1));
        cache.set("d", &4, "tools", TTL).unwrap();

        assert_eq!(cache.len("tools"), 3);
        assert_eq!(cache.get::<i32>("b", "tools"), None);
        assert_eq!(cache.get::<i32>("a", "tools"), Some(1));
        assert_eq!(cache.get::<i32>("c", "tools"), Some(3));
        assert_eq!(cache.get::<i32>("d", "tools"), Some(4));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn categories_have_independent_limits() {
        let cache = PerformanceCache::new(
            CacheConfig {
                default_max_entries: 1,
                ..Default::default()
            }
            .with_category_limit("big", 5),
        );
        for i in 0..5 {
            cache.set(&format!("k{i}"), &i, "big", TTL).unwrap();
            cache.set(&format!("k{i}"), &i, "small", TTL).unwrap();
        }
        assert_eq!(cache.len("big"), 5);
        assert_eq!(cache.len("small"), 1);
        assert_eq!(cache.get::<i32>("k4", "small"), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_existing_key_does_not_evict() {
        let cache = small_cache(2);
        cache.set("a", &1, "c", TTL).unwrap();
        cache.set("b", &2, "c", TTL).unwrap();
        cache.set("a", &10, "c", TTL).unwrap();
        assert_eq!(cache.len("c"), 2);
        assert_eq!(cache.get::<i32>("a", "c"), Some(10));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_category_drops_expired_before_lru() {
        let cache = small_cache(2);
        cache.set("short", &1, "c", Duration::from_secs(1)).unwrap();
        cache.set("long", &2, "c", TTL).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.set("new", &3, "c", TTL).unwrap();
        assert_eq!(cache.get::<i32>("long", "c"), Some(2));
        assert_eq!(cache.get::<i32>("new", "c"), Some(3));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_and_clear() {
        let cache = small_cache(10);
        cache.set("a", &1, "c", TTL).unwrap();
        cache.set("b", &2, "c", TTL).unwrap();
        assert!(cache.delete("a", "c"));
        assert!(!cache.delete("a", "c"));
        assert_eq!(cache.clear_category("c"), 1);
        assert!(cache.is_empty("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_type_is_a_miss() {
        #[derive(Debug, Deserialize)]
        struct Shape {
            #[allow(dead_code)]
            sides: u32,
        }

        let cache = small_cache(10);
        cache.set("k", "not a shape", "c", TTL).unwrap();
        assert!(cache.try_get::<Shape>("k", "c").is_err());
        assert!(cache.get::<Shape>("k", "c").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_untouched_expired_entries() {
        let cache = small_cache(10);
        cache.set("a", &1, "x", Duration::from_secs(1)).unwrap();
        cache.set("b", &2, "y", Duration::from_secs(1)).unwrap();
        cache.set("c", &3, "y", TTL).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.sweep_expired(), 2);
        assert_eq!(cache.len("x"), 0);
        assert_eq!(cache.len("y"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_runs_periodically() {
        let cache = Arc::new(PerformanceCache::new(CacheConfig {
            sweep_interval: Duration::from_millis(50),
            ..Default::default()
        }));
        let handle = cache.spawn_sweeper();
        cache
            .set("k", &1, "c", Duration::from_millis(10))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.len("c"), 0);

        drop(cache);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_category_limit_still_holds_one_entry() {
        let cache = PerformanceCache::new(CacheConfig::default().with_category_limit("ctx", 0));
        cache.set("a", &1, "ctx", TTL).unwrap();
        cache.set("b", &2, "ctx", TTL).unwrap();
        assert_eq!(cache.len("ctx"), 1);
        assert_eq!(cache.get::<i32>("b", "ctx"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_sweep_interval_does_not_panic_the_sweeper() {
        let cache = Arc::new(PerformanceCache::new(CacheConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        }));
        let handle = cache.spawn_sweeper();
        cache.set("k", &1, "c", Duration::from_millis(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.len("c"), 0);

        drop(cache);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(handle.is_finished());
        assert!(handle.await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_keep_limit() {
        let cache = Arc::new(small_cache(50));
        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    cache.set(&format!("{t}-{i}"), &i, "shared", TTL).unwrap();
                    cache.get::<i32>(&format!("{t}-{i}"), "shared");
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(cache.len("shared"), 50);
        let stats = cache.stats();
        assert_eq!(stats.evictions, 800 - 50);
    }

    #[test]
    fn hit_rate_computation() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            evictions: 0,
            expirations: 0,
            entries: 0,
        };
        assert!((stats.hit_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn fnv_is_deterministic_and_discriminating() {
        assert_eq!(fnv1a(b"billing"), fnv1a(b"billing"));
        assert_ne!(fnv1a(b"billing"), fnv1a(b"shipping"));
    }
}
