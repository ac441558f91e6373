//! Bounded TTL+LRU response cache
//!
//! Storage failures are absorbed at this boundary: callers see a miss,
//! never an error. The logical request must keep working when the cache
//! does not.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache entry with expiry metadata
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
    size_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration, size_bytes: usize) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl,
            access_count: 0,
            size_bytes,
        }
    }

    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Cache statistics for the observability boundary
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expired: u64,
    pub invalidations: u64,
    pub absorbed_errors: u64,
    pub memory_bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

/// Bounded TTL+LRU cache for enrichment payloads
pub struct ResponseCache<V>
where
    V: Clone + Serialize,
{
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    invalidations: AtomicU64,
    absorbed_errors: AtomicU64,
    memory_bytes: AtomicU64,
}

impl<V> ResponseCache<V>
where
    V: Clone + Serialize,
{
    pub fn new(config: &CacheConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl: config.default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            absorbed_errors: AtomicU64::new(0),
            memory_bytes: AtomicU64::new(0),
        }
    }

    /// Look up a key. Storage errors degrade to a miss; a key that errors
    /// on read is proactively invalidated to avoid tight failure loops.
    pub fn get(&self, key: &str) -> Option<V> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => {
                self.absorbed_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("cache read failed for '{}', treating as miss: {}", key, e);
                self.recover_key(key);
                None
            }
        }
    }

    fn try_get(&self, key: &str) -> Result<Option<V>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                let size = entry.size_bytes as u64;
                entries.pop(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.memory_bytes.fetch_sub(size, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some(entry) => {
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Insert with the configured default TTL.
    pub fn insert(&self, key: &str, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL. Overwrites refresh the entry;
    /// population is last-writer-wins. Storage errors are absorbed.
    pub fn insert_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        if let Err(e) = self.try_insert(key, value, ttl) {
            self.absorbed_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("cache write failed for '{}', continuing uncached: {}", key, e);
        }
    }

    fn try_insert(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        let size_bytes = serde_json::to_vec(&value)
            .map_err(|e| Error::Cache(format!("size estimate failed: {}", e)))?
            .len();

        let mut entries = self.entries.lock();

        // Full and inserting a fresh key: the LRU victim is accounted
        // before `put` would drop it silently.
        if entries.len() == usize::from(entries.cap()) && !entries.contains(key) {
            if let Some((_, victim)) = entries.pop_lru() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.memory_bytes
                    .fetch_sub(victim.size_bytes as u64, Ordering::Relaxed);
            }
        }

        if let Some(old) = entries.put(key.to_string(), CacheEntry::new(value, ttl, size_bytes)) {
            self.memory_bytes
                .fetch_sub(old.size_bytes as u64, Ordering::Relaxed);
        }
        self.memory_bytes.fetch_add(size_bytes as u64, Ordering::Relaxed);
        self.insertions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a key. Returns whether an entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.pop(key) {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            self.memory_bytes
                .fetch_sub(entry.size_bytes as u64, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Error-recovery path: drop a key that produced a read error so the
    /// next caller repopulates instead of re-hitting the same failure.
    pub fn recover_key(&self, key: &str) {
        if self.invalidate(key) {
            log::info!("invalidated cache key '{}' after read error", key);
        }
    }

    /// Reclaim expired entries nobody reads again. Returns the number of
    /// entries removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(entry) = entries.pop(key) {
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.memory_bytes
                    .fetch_sub(entry.size_bytes as u64, Ordering::Relaxed);
            }
        }
        if !stale.is_empty() {
            log::debug!("cache sweep reclaimed {} expired entries", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.memory_bytes.store(0, Ordering::Relaxed);
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            absorbed_errors: self.absorbed_errors.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(max_entries: usize, ttl: Duration) -> ResponseCache<Vec<String>> {
        ResponseCache::new(&CacheConfig {
            max_entries,
            default_ttl: ttl,
            sweep_interval: Duration::from_secs(60),
        })
    }

    #[test]
    fn set_then_get_until_ttl() {
        let cache = test_cache(10, Duration::from_millis(80));
        cache.insert("music:20s:paris:none", vec!["indie rock".to_string()]);

        assert_eq!(
            cache.get("music:20s:paris:none"),
            Some(vec!["indie rock".to_string()])
        );

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(cache.get("music:20s:paris:none"), None);
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn capacity_bound_evicts_lru() {
        let cache = test_cache(2, Duration::from_secs(60));
        cache.insert("a", vec!["1".to_string()]);
        cache.insert("b", vec!["2".to_string()]);
        // Touch "a" so "b" is the LRU victim
        assert!(cache.get("a").is_some());
        cache.insert("c", vec!["3".to_string()]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn overwrite_refreshes_entry() {
        let cache = test_cache(10, Duration::from_secs(60));
        cache.insert("k", vec!["old".to_string()]);
        cache.insert("k", vec!["new".to_string()]);
        assert_eq!(cache.get("k"), Some(vec!["new".to_string()]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let cache = test_cache(10, Duration::from_millis(40));
        cache.insert("a", vec!["1".to_string()]);
        cache.insert("b", vec!["2".to_string()]);
        std::thread::sleep(Duration::from_millis(60));
        cache.insert_with_ttl("c", vec!["3".to_string()], Duration::from_secs(60));

        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn invalidate_and_recover() {
        let cache = test_cache(10, Duration::from_secs(60));
        cache.insert("k", vec!["v".to_string()]);
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        // Recovery on an absent key is a no-op
        cache.recover_key("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn memory_estimate_tracks_entries() {
        let cache = test_cache(10, Duration::from_secs(60));
        assert_eq!(cache.memory_bytes(), 0);
        cache.insert("k", vec!["abcdef".to_string()]);
        let with_entry = cache.memory_bytes();
        assert!(with_entry > 0);
        cache.invalidate("k");
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[test]
    fn hit_rate_reflects_traffic() {
        let cache = test_cache(10, Duration::from_secs(60));
        cache.insert("k", vec!["v".to_string()]);
        assert!(cache.get("k").is_some());
        assert!(cache.get("missing").is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
