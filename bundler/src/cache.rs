//! TTL + LRU cache for bundle results.
//!
//! One mutex guards the whole cache; the LRU order lives in an
//! [`lru::LruCache`] so promote-on-hit and evict-on-insert are O(1).
//! Expired entries are removed lazily on `get` and proactively by a
//! background sweeper that halts on [`BundleCache::close`].
//!
//! The cache does not deduplicate concurrent misses; that is the
//! service's single-flight lock (see `service.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::fingerprint::project_prefix;
use crate::result::BundleResult;

/// Cache construction options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Maximum number of entries. Inserting past this evicts from the LRU end.
    pub max_size: usize,
    /// Entry time-to-live, measured from insertion.
    pub ttl: Duration,
    /// Sweep period for the background expiry task. `None` disables the
    /// sweeper (expiry still happens lazily on `get`).
    pub cleanup_interval: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_size: 128,
            ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Counters exposed by [`BundleCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Live entry count.
    pub current_size: usize,
    /// Bytes currently held by live entries.
    pub current_bytes: usize,
    /// Cumulative bytes ever stored (never decreases).
    pub total_bytes_stored: u64,
}

impl CacheStats {
    /// Emit the counters as a structured tracing event.
    pub fn emit(&self) {
        tracing::info!(
            target: "forge.bundler.cache",
            hits = self.hits,
            misses = self.misses,
            evictions = self.evictions,
            expirations = self.expirations,
            current_size = self.current_size,
            current_bytes = self.current_bytes,
            total_bytes_stored = self.total_bytes_stored,
            "bundle_cache_stats"
        );
    }

    /// Hit ratio over all lookups, 0.0 when none happened.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Point-in-time bookkeeping view of one live entry, from
/// [`BundleCache::entry_stats`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EntryStats {
    /// Milliseconds since insertion.
    pub age_ms: u64,
    /// Milliseconds since the last hit (or insertion when never hit).
    pub idle_ms: u64,
    pub access_count: u64,
    pub size_bytes: usize,
}

/// One cached bundle with its bookkeeping.
struct CacheItem {
    result: BundleResult,
    created_at: Instant,
    last_access: Instant,
    access_count: u64,
    size_bytes: usize,
}

struct CacheInner {
    entries: LruCache<String, CacheItem>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    current_bytes: usize,
    total_bytes_stored: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> bool {
        if let Some(item) = self.entries.pop(key) {
            self.current_bytes -= item.size_bytes;
            true
        } else {
            false
        }
    }
}

/// Content-addressed bundle cache with TTL + LRU semantics.
pub struct BundleCache {
    inner: Arc<Mutex<CacheInner>>,
    max_size: usize,
    ttl: Duration,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn lock_inner(inner: &Mutex<CacheInner>) -> MutexGuard<'_, CacheInner> {
    // A panic mid-operation cannot leave the counters inconsistent enough
    // to matter; recover the guard instead of propagating the poison.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BundleCache {
    /// Create a cache. When `cleanup_interval` is set, spawns the sweeper
    /// task (requires a running Tokio runtime).
    pub fn new(options: CacheOptions) -> Self {
        let max_size = options.max_size.max(1);
        let inner = Arc::new(Mutex::new(CacheInner {
            entries: LruCache::unbounded(),
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            current_bytes: 0,
            total_bytes_stored: 0,
        }));
        let shutdown = Arc::new(Notify::new());

        let sweeper = options.cleanup_interval.map(|period| {
            let inner = Arc::clone(&inner);
            let shutdown = Arc::clone(&shutdown);
            let ttl = options.ttl;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let removed = sweep_expired(&inner, ttl);
                            if removed > 0 {
                                debug!(removed, "bundle cache sweep removed expired entries");
                            }
                        }
                        _ = shutdown.notified() => break,
                    }
                }
            })
        });

        Self {
            inner,
            max_size,
            ttl: options.ttl,
            closed: AtomicBool::new(false),
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Look up a result. Expired entries are removed and counted as a miss
    /// plus an expiration; hits promote the entry to most-recently used.
    pub fn get(&self, key: &str) -> Option<BundleResult> {
        let mut inner = lock_inner(&self.inner);

        let expired = match inner.entries.peek(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(item) => item.created_at.elapsed() >= self.ttl,
        };

        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        let item = inner.entries.get_mut(key)?;
        item.last_access = Instant::now();
        item.access_count += 1;
        let result = item.result.clone();
        inner.hits += 1;
        Some(result)
    }

    /// Insert or refresh a result. Existing keys are updated in place and
    /// promoted; new keys evict from the LRU end while the cache is full.
    pub fn set(&self, key: &str, result: BundleResult) {
        let size_bytes = result.size_bytes();
        let now = Instant::now();
        let mut inner = lock_inner(&self.inner);

        if inner.entries.contains(key) {
            inner.remove(key);
        } else {
            while inner.entries.len() >= self.max_size {
                if let Some((evicted_key, item)) = inner.entries.pop_lru() {
                    inner.current_bytes -= item.size_bytes;
                    inner.evictions += 1;
                    debug!(key = %evicted_key, "bundle cache evicted LRU entry");
                } else {
                    break;
                }
            }
        }

        inner.entries.push(
            key.to_string(),
            CacheItem {
                result,
                created_at: now,
                last_access: now,
                access_count: 0,
                size_bytes,
            },
        );
        inner.current_bytes += size_bytes;
        inner.total_bytes_stored += size_bytes as u64;
    }

    /// Remove one key. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        lock_inner(&self.inner).remove(key)
    }

    /// Remove every key starting with `prefix`. Returns the removed count.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut inner = lock_inner(&self.inner);
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        if !keys.is_empty() {
            info!(prefix, removed = keys.len(), "bundle cache prefix invalidation");
        }
        keys.len()
    }

    /// Remove every cached bundle for a project. Keys share the project
    /// segment of the fingerprint, so this is a prefix sweep.
    pub fn invalidate_by_project_id(&self, project_id: &str) -> usize {
        self.invalidate_by_prefix(&project_prefix(project_id))
    }

    /// Drop all entries. Hit/miss counters are preserved.
    pub fn clear(&self) {
        let mut inner = lock_inner(&self.inner);
        inner.entries.clear();
        inner.current_bytes = 0;
    }

    /// Bookkeeping for one live entry, without promoting it or touching
    /// the hit/miss counters. `None` for absent keys.
    pub fn entry_stats(&self, key: &str) -> Option<EntryStats> {
        let inner = lock_inner(&self.inner);
        inner.entries.peek(key).map(|item| EntryStats {
            age_ms: item.created_at.elapsed().as_millis() as u64,
            idle_ms: item.last_access.elapsed().as_millis() as u64,
            access_count: item.access_count,
            size_bytes: item.size_bytes,
        })
    }

    /// Snapshot the statistics counters.
    pub fn stats(&self) -> CacheStats {
        let inner = lock_inner(&self.inner);
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            current_size: inner.entries.len(),
            current_bytes: inner.current_bytes,
            total_bytes_stored: inner.total_bytes_stored,
        }
    }

    /// Live keys, most-recently used first. Test and debugging aid.
    pub fn keys(&self) -> Vec<String> {
        lock_inner(&self.inner)
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Halt the background sweeper. Idempotent; the cache remains usable
    /// for lookups afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        if let Some(handle) = lock_sweeper(&self.sweeper).take() {
            handle.abort();
        }
    }
}

fn lock_sweeper(
    sweeper: &Mutex<Option<tokio::task::JoinHandle<()>>>,
) -> MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
    sweeper.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for BundleCache {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remove all TTL-expired entries. Returns the removed count.
fn sweep_expired(inner: &Mutex<CacheInner>, ttl: Duration) -> usize {
    let mut inner = lock_inner(inner);
    let expired: Vec<String> = inner
        .entries
        .iter()
        .filter(|(_, item)| item.created_at.elapsed() >= ttl)
        .map(|(k, _)| k.clone())
        .collect();
    for key in &expired {
        inner.remove(key);
    }
    inner.expirations += expired.len() as u64;
    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(hash: &str, body: &str) -> BundleResult {
        BundleResult {
            output_js: body.to_string(),
            output_css: None,
            source_map: None,
            duration_ms: 1,
            warnings: vec![],
            errors: vec![],
            success: true,
            hash: hash.to_string(),
            metafile: None,
        }
    }

    fn cache(max_size: usize, ttl: Duration) -> BundleCache {
        BundleCache::new(CacheOptions {
            max_size,
            ttl,
            cleanup_interval: None,
        })
    }

    #[test]
    fn test_get_miss_then_hit() {
        let cache = cache(4, Duration::from_secs(60));
        assert!(cache.get("k1").is_none());
        cache.set("k1", result("k1", "js"));
        assert_eq!(cache.get("k1").unwrap().hash, "k1");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.current_size, 1);
    }

    #[test]
    fn test_hit_rate() {
        let cache = cache(4, Duration::from_secs(60));
        assert_eq!(cache.stats().hit_rate(), 0.0);
        cache.set("a", result("a", "x"));
        let _ = cache.get("a");
        let _ = cache.get("a");
        let _ = cache.get("b");
        let stats = cache.stats();
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
        stats.emit();
    }

    #[test]
    fn test_hits_plus_misses_equals_gets() {
        let cache = cache(4, Duration::from_secs(60));
        cache.set("a", result("a", "x"));
        let mut gets = 0u64;
        for key in ["a", "b", "a", "c", "a", "a"] {
            let _ = cache.get(key);
            gets += 1;
        }
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, gets);
    }

    #[test]
    fn test_lru_discipline_keeps_most_recent() {
        let cache = cache(3, Duration::from_secs(60));
        for key in ["k1", "k2", "k3", "k4", "k5"] {
            cache.set(key, result(key, "x"));
        }
        // No gets: exactly the 3 most recent sets survive.
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["k3", "k4", "k5"]);
        assert_eq!(cache.stats().evictions, 2);
        assert!(cache.stats().current_size <= 3);
    }

    #[test]
    fn test_entry_stats_track_accesses_without_promoting() {
        let cache = cache(4, Duration::from_secs(60));
        cache.set("k", result("k", "body"));

        let fresh = cache.entry_stats("k").unwrap();
        assert_eq!(fresh.access_count, 0);
        assert_eq!(fresh.size_bytes, 4);

        let _ = cache.get("k");
        let _ = cache.get("k");
        let after = cache.entry_stats("k").unwrap();
        assert_eq!(after.access_count, 2);
        assert!(after.idle_ms <= after.age_ms);

        // Reading stats is not a lookup.
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 2);

        assert!(cache.entry_stats("missing").is_none());
    }

    #[test]
    fn test_get_promotes_to_mru() {
        let cache = cache(2, Duration::from_secs(60));
        cache.set("old", result("old", "x"));
        cache.set("new", result("new", "x"));
        // Touch "old" so "new" becomes the LRU victim.
        assert!(cache.get("old").is_some());
        cache.set("newest", result("newest", "x"));

        assert!(cache.get("old").is_some());
        assert!(cache.get("new").is_none());
    }

    #[test]
    fn test_set_existing_key_updates_in_place() {
        let cache = cache(2, Duration::from_secs(60));
        cache.set("k", result("k", "v1"));
        cache.set("k", result("k", "longer-v2"));
        assert_eq!(cache.stats().current_size, 1);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("k").unwrap().output_js, "longer-v2");
        assert_eq!(cache.stats().current_bytes, "longer-v2".len());
    }

    #[test]
    fn test_ttl_expiry_counts_miss_and_expiration() {
        let cache = cache(4, Duration::from_millis(10));
        cache.set("k", result("k", "x"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("k").is_none());

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.current_size, 0);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = cache(8, Duration::from_secs(60));
        cache.set("a", result("a", "x"));
        cache.set("b", result("b", "y"));

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.stats().current_size, 1);

        cache.clear();
        assert_eq!(cache.stats().current_size, 0);
        assert_eq!(cache.stats().current_bytes, 0);
    }

    #[test]
    fn test_invalidate_by_prefix() {
        let cache = cache(8, Duration::from_secs(60));
        cache.set("aaa111", result("1", "x"));
        cache.set("aaa222", result("2", "x"));
        cache.set("bbb333", result("3", "x"));

        assert_eq!(cache.invalidate_by_prefix("aaa"), 2);
        assert_eq!(cache.stats().current_size, 1);
        assert!(cache.get("bbb333").is_some());
    }

    #[test]
    fn test_invalidate_by_project_id_matches_fingerprint_keys() {
        use crate::config::BundleConfig;
        use crate::fingerprint::fingerprint;

        let cache = cache(8, Duration::from_secs(60));
        let files: crate::SourceFiles =
            [("index.js".to_string(), "x".to_string())].into_iter().collect();
        let key_a = fingerprint("proj-a", &BundleConfig::default(), &files);
        let key_b = fingerprint("proj-b", &BundleConfig::default(), &files);
        cache.set(&key_a, result(&key_a, "x"));
        cache.set(&key_b, result(&key_b, "x"));

        assert_eq!(cache.invalidate_by_project_id("proj-a"), 1);
        assert!(cache.get(&key_a).is_none());
        assert!(cache.get(&key_b).is_some());
    }

    #[test]
    fn test_total_bytes_stored_is_cumulative() {
        let cache = cache(1, Duration::from_secs(60));
        cache.set("a", result("a", "1234"));
        cache.set("b", result("b", "5678"));
        // "a" was evicted but the cumulative counter keeps its bytes.
        assert_eq!(cache.stats().total_bytes_stored, 8);
        assert_eq!(cache.stats().current_bytes, 4);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let cache = BundleCache::new(CacheOptions {
            max_size: 8,
            ttl: Duration::from_millis(10),
            cleanup_interval: Some(Duration::from_millis(20)),
        });
        cache.set("k", result("k", "x"));
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Swept in the background: gone without a get, counted as expired.
        let stats = cache.stats();
        assert_eq!(stats.current_size, 0);
        assert!(stats.expirations >= 1);
        assert_eq!(stats.misses, 0);
        cache.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let cache = BundleCache::new(CacheOptions {
            max_size: 8,
            ttl: Duration::from_secs(60),
            cleanup_interval: Some(Duration::from_secs(60)),
        });
        cache.close();
        cache.close();
        // Cache still answers lookups after close.
        cache.set("k", result("k", "x"));
        assert!(cache.get("k").is_some());
    }
}
