//! Client configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::cache::file_cache::DEFAULT_MAX_CACHE_SIZE;
use crate::cache::store::DEFAULT_STORE_MAX_BYTES;
use crate::files::ManagerSettings;

/// Storage API connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Local persistence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the key/value store and downloaded files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_list_ttl")]
    pub list_ttl_secs: u64,
    /// Size limit of the key/value store.
    #[serde(default = "default_store_max_bytes")]
    pub store_max_bytes: usize,
    #[serde(default = "default_file_cache_max_mb")]
    pub file_cache_max_mb: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloudfiles")
}

fn default_list_ttl() -> u64 {
    30
}

fn default_store_max_bytes() -> usize {
    DEFAULT_STORE_MAX_BYTES
}

fn default_file_cache_max_mb() -> u64 {
    DEFAULT_MAX_CACHE_SIZE / (1024 * 1024)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            list_ttl_secs: default_list_ttl(),
            store_max_bytes: default_store_max_bytes(),
            file_cache_max_mb: default_file_cache_max_mb(),
        }
    }
}

impl CacheConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }
}

/// Bounds on remote operations.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_star_timeout")]
    pub star_secs: u64,
    #[serde(default = "default_delete_timeout")]
    pub delete_secs: u64,
    #[serde(default = "default_bulk_delete_timeout")]
    pub bulk_delete_secs: u64,
    /// Delay before the background reload that follows an edit.
    #[serde(default = "default_edit_reload_delay")]
    pub edit_reload_delay_ms: u64,
}

fn default_star_timeout() -> u64 {
    10
}

fn default_delete_timeout() -> u64 {
    30
}

fn default_bulk_delete_timeout() -> u64 {
    60
}

fn default_edit_reload_delay() -> u64 {
    100
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            star_secs: default_star_timeout(),
            delete_secs: default_delete_timeout(),
            bulk_delete_secs: default_bulk_delete_timeout(),
            edit_reload_delay_ms: default_edit_reload_delay(),
        }
    }
}

/// Request deduplication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_window")]
    pub window_secs: u64,
}

fn default_dedup_window() -> u64 {
    30
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_dedup_window(),
        }
    }
}

/// Offline queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delays between re-drains while failed operations remain.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: Vec<u64>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Vec<u64> {
    vec![500, 1000, 2000]
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).context("config parse error")
    }

    /// Load `path` if given, otherwise the default file if it exists, then
    /// apply environment overrides.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::load(path)?,
                None => {
                    debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// `<config dir>/cloudfiles/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cloudfiles").join("config.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - `CLOUDFILES_API_URL`: storage API base URL
    /// - `CLOUDFILES_TOKEN`: bearer token
    /// - `CLOUDFILES_DATA_DIR`: local data directory
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(url) = lookup("CLOUDFILES_API_URL") {
            self.api.base_url = url;
        }
        if let Some(token) = lookup("CLOUDFILES_TOKEN") {
            self.api.auth_token = Some(token);
        }
        if let Some(dir) = lookup("CLOUDFILES_DATA_DIR") {
            self.cache.data_dir = PathBuf::from(dir);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    /// Timing settings for the file manager
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            list_ttl: Duration::from_secs(self.cache.list_ttl_secs),
            star_timeout: Duration::from_secs(self.timeouts.star_secs),
            delete_timeout: Duration::from_secs(self.timeouts.delete_secs),
            bulk_delete_timeout: Duration::from_secs(self.timeouts.bulk_delete_secs),
            edit_reload_delay: Duration::from_millis(self.timeouts.edit_reload_delay_ms),
            dedup_window: Duration::from_secs(self.dedup.window_secs),
            max_retries: self.queue.max_retries,
            retry_backoff: self
                .queue
                .retry_backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}
