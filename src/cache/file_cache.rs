//! Offline Download Cache
//!
//! Keeps downloaded file bodies on local disk so they stay readable while
//! offline. Uses LRU eviction when the cache exceeds its configured size.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

/// Default maximum cache size: 256 MB
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 256 * 1024 * 1024;

/// Tracks a cached body for LRU eviction
#[derive(Debug, Clone)]
struct CacheEntry {
    size: u64,
    last_accessed: SystemTime,
}

/// Local disk cache for downloaded file content
pub struct FileCache {
    /// Root directory for cached bodies
    cache_dir: PathBuf,
    /// Maximum total cache size in bytes
    max_size: u64,
    /// Cached bodies by on-disk path
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl FileCache {
    /// Create a download cache with custom configuration
    ///
    /// # Arguments
    /// * `cache_dir` - Directory to store cached bodies
    /// * `max_size` - Maximum total cache size in bytes
    pub fn with_config(cache_dir: PathBuf, max_size: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", cache_dir))?;

        let cache = Self {
            cache_dir,
            max_size,
            entries: Mutex::new(HashMap::new()),
        };

        // Clean up any stale temp files from previous runs
        cache.cleanup();
        let restored = cache.scan_existing();
        cache.evict_if_needed();

        info!(
            cache_dir = %cache.cache_dir.display(),
            max_size_mb = max_size / (1024 * 1024),
            restored,
            "Download cache initialized"
        );

        Ok(cache)
    }

    /// Store a downloaded body
    pub fn store(&self, file_id: &str, data: &[u8]) -> Result<PathBuf> {
        let local_path = self.path_for(file_id);

        // Write atomically using tempfile
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)
            .context("Failed to create temp file for cache")?;
        tmp.write_all(data).context("Failed to write cache file")?;
        tmp.persist(&local_path)
            .with_context(|| format!("Failed to persist cache file: {:?}", local_path))?;

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.insert(
                local_path.clone(),
                CacheEntry {
                    size: data.len() as u64,
                    last_accessed: SystemTime::now(),
                },
            );
        }

        debug!(
            file_id = file_id,
            local = %local_path.display(),
            size = data.len(),
            "Stored download in cache"
        );

        self.evict_if_needed();
        Ok(local_path)
    }

    /// Read a cached body, if present
    pub fn get(&self, file_id: &str) -> Option<Vec<u8>> {
        let local_path = self.path_for(file_id);
        let data = fs::read(&local_path).ok()?;

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(local_path)
            .and_modify(|e| e.last_accessed = SystemTime::now())
            .or_insert_with(|| CacheEntry {
                size: data.len() as u64,
                last_accessed: SystemTime::now(),
            });

        debug!(file_id = file_id, "Download cache HIT");
        Some(data)
    }

    /// Evict least recently used bodies if the cache exceeds max size
    fn evict_if_needed(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let total_size: u64 = entries.values().map(|e| e.size).sum();
        if total_size <= self.max_size {
            return;
        }

        info!(
            total_mb = total_size / (1024 * 1024),
            max_mb = self.max_size / (1024 * 1024),
            "Download cache exceeds max size, evicting LRU entries"
        );

        let mut sorted: Vec<(PathBuf, CacheEntry)> = entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        sorted.sort_by(|a, b| a.1.last_accessed.cmp(&b.1.last_accessed));

        let mut freed: u64 = 0;
        let target = total_size - self.max_size;

        for (path, entry) in sorted {
            if freed >= target {
                break;
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to evict cached download");
            } else {
                debug!(path = %path.display(), size = entry.size, "Evicted cached download");
                freed += entry.size;
                entries.remove(&path);
            }
        }
    }

    /// Index bodies left on disk by earlier runs, oldest modification first
    fn scan_existing(&self) -> usize {
        let Ok(read_dir) = fs::read_dir(&self.cache_dir) else {
            return 0;
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            entries.insert(
                path,
                CacheEntry {
                    size: metadata.len(),
                    last_accessed: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            );
        }
        entries.len()
    }

    /// Clean up stale temp files on startup
    pub fn cleanup(&self) {
        if let Ok(read_dir) = fs::read_dir(&self.cache_dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                let is_temp = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(".tmp"))
                    .unwrap_or(false);
                if is_temp {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    /// Invalidate a cached body
    pub fn invalidate(&self, file_id: &str) {
        let local_path = self.path_for(file_id);
        if local_path.exists() {
            let _ = fs::remove_file(&local_path);
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&local_path);
        debug!(file_id = file_id, "Invalidated cached download");
    }

    /// File ids are opaque; hash them into filesystem-safe names
    fn path_for(&self, file_id: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(file_id.as_bytes());
        self.cache_dir.join(format!("{:x}.bin", hasher.finalize()))
    }

    /// Get the cache directory path
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
