//! TTL Cache Implementation
//!
//! Best-effort cache of API payloads on top of a [`KeyValueStore`].
//! Entries carry their own timestamp and TTL and expire lazily on read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::store::KeyValueStore;

/// Prefix applied to every cache key so clearing never touches unrelated storage
pub const CACHE_PREFIX: &str = "cloudfiles_cache_";

/// Persisted cache record
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    data: serde_json::Value,
    /// Milliseconds since the Unix epoch
    timestamp: i64,
    /// Time to live in milliseconds
    ttl: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        let elapsed = now_ms.saturating_sub(self.timestamp).max(0) as u64;
        elapsed >= self.ttl
    }
}

/// Key/value cache with per-entry TTL
pub struct TtlCache {
    store: Arc<dyn KeyValueStore>,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

impl TtlCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn storage_key(key: &str) -> String {
        format!("{CACHE_PREFIX}{key}")
    }

    /// Store `data` under `key` for `ttl`
    ///
    /// Persistence failures (quota exceeded, I/O) are logged and swallowed.
    pub fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) {
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to serialize cache payload");
                return;
            }
        };

        let entry = CacheEntry {
            data,
            timestamp: Utc::now().timestamp_millis(),
            ttl: ttl.as_millis() as u64,
        };

        let result = serde_json::to_string(&entry)
            .map_err(super::store::StoreError::from)
            .and_then(|raw| self.store.set(&Self::storage_key(key), &raw));

        match result {
            Ok(()) => debug!(key = key, ttl_ms = entry.ttl, "Cached payload"),
            Err(e) => warn!(key = key, error = %e, "Failed to write cache entry"),
        }
    }

    /// Return the payload under `key` if it has not expired
    ///
    /// Expired or unreadable entries are evicted and reported as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let storage_key = Self::storage_key(key);
        let raw = match self.store.get(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return self.miss(key),
            Err(e) => {
                warn!(key = key, error = %e, "Failed to read cache entry");
                return self.miss(key);
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = key, error = %e, "Corrupt cache entry, evicting");
                self.evict(&storage_key);
                return self.miss(key);
            }
        };

        if entry.is_expired(Utc::now().timestamp_millis()) {
            trace!(key = key, "Cache entry expired");
            self.evict(&storage_key);
            return self.miss(key);
        }

        match serde_json::from_value(entry.data) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = key, "Cache HIT");
                Some(value)
            }
            Err(e) => {
                warn!(key = key, error = %e, "Cache payload has unexpected shape, evicting");
                self.evict(&storage_key);
                self.miss(key)
            }
        }
    }

    fn miss<T>(&self, key: &str) -> Option<T> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key = key, "Cache MISS");
        None
    }

    fn evict(&self, storage_key: &str) {
        if let Err(e) = self.store.remove(storage_key) {
            warn!(key = storage_key, error = %e, "Failed to evict cache entry");
        }
    }

    /// Remove one entry
    pub fn clear(&self, key: &str) {
        self.evict(&Self::storage_key(key));
        debug!(key = key, "Cleared cache entry");
    }

    /// Remove every cache entry, leaving unrelated keys in the store untouched
    pub fn clear_all(&self) {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate cache keys");
                return;
            }
        };

        let mut cleared = 0;
        for key in keys.iter().filter(|k| k.starts_with(CACHE_PREFIX)) {
            self.evict(key);
            cleared += 1;
        }
        debug!(cleared = cleared, "Cleared all cache entries");
    }

    /// Get cache statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            "Cache metrics"
        );
    }
}
