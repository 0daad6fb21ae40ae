//! Durable key/value storage
//!
//! The local persistence layer shared by the TTL cache and the offline
//! queue. `JsonFileStore` keeps every key in one JSON document on disk,
//! rewritten atomically; `MemoryStore` is a bounded in-process store.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use moka::sync::Cache;
use tracing::{debug, info, warn};

/// Default store quota, mirroring the 5 MiB browsers grant local storage
pub const DEFAULT_STORE_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Persistence layer errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage quota exceeded ({needed} of {limit} bytes)")]
    QuotaExceeded { needed: usize, limit: usize },
}

/// String key/value persistence
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Key/value store persisted as a single JSON document
pub struct JsonFileStore {
    /// Path of the JSON document
    path: PathBuf,
    /// Maximum serialized size of all keys and values
    max_bytes: usize,
    /// In-memory mirror of the document
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl Into<PathBuf>, max_bytes: usize) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Store document is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), keys = entries.len(), "Opened local store");

        Ok(Self {
            path,
            max_bytes,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn used_bytes(entries: &BTreeMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Write the document atomically using tempfile
    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer(&mut tmp, entries)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        debug!(path = %self.path.display(), keys = entries.len(), "Persisted local store");
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let current = Self::used_bytes(&entries);
        let replaced = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let needed = current - replaced + key.len() + value.len();
        if needed > self.max_bytes {
            return Err(StoreError::QuotaExceeded {
                needed,
                limit: self.max_bytes,
            });
        }

        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.keys().cloned().collect())
    }
}

/// In-process store that lives as long as the value
///
/// Unbounded: keys are only dropped by `remove`. Nothing survives a
/// restart; use [`JsonFileStore`] for that.
pub struct MemoryStore {
    entries: Cache<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let entries = Cache::builder().name("memory_store").build();
        Self { entries }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.invalidate(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.iter().map(|(k, _)| k.as_ref().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = JsonFileStore::open(&path, DEFAULT_STORE_MAX_BYTES).unwrap();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.remove("a").unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path, DEFAULT_STORE_MAX_BYTES).unwrap();
        assert_eq!(reopened.get("a").unwrap(), None);
        assert_eq!(reopened.get("b").unwrap(), Some("2".to_string()));
        assert_eq!(reopened.keys().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_json_store_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("s.json"), 10).unwrap();

        store.set("k", "12345").unwrap();
        let err = store.set("other", "123456").unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert_eq!(store.get("other").unwrap(), None);

        // Replacing a value only counts the difference
        store.set("k", "123456789").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("123456789"));
    }

    #[test]
    fn test_json_store_corrupt_document_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        fs::write(&path, "{not json").unwrap();

        let store = JsonFileStore::open(&path, DEFAULT_STORE_MAX_BYTES).unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::default();
        store.set("x", "y").unwrap();
        assert_eq!(store.get("x").unwrap().as_deref(), Some("y"));
        assert_eq!(store.keys().unwrap(), vec!["x".to_string()]);
        store.remove("x").unwrap();
        assert_eq!(store.get("x").unwrap(), None);
    }

    #[test]
    fn test_memory_store_keeps_queue_key_under_load() {
        let store = MemoryStore::default();
        store.set("cloudfiles_offline_queue", "[]").unwrap();
        for i in 0..20_000 {
            store.set(&format!("cloudfiles_cache_{i}"), "{}").unwrap();
        }
        assert_eq!(
            store.get("cloudfiles_offline_queue").unwrap().as_deref(),
            Some("[]")
        );
    }
}
