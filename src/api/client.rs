//! Storage API Client
//!
//! Provides authenticated access to the remote file storage API. All calls
//! carry the session cookie (and an optional bearer token).

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::errors::ApiError;
use super::types::{
    ActivityEntry, BulkDeleteResponse, BulkRestoreResponse, FileResponse, FileStats, FileUpdate,
    ListFilesResponse, ListQuery, MoveResponse, MutationResponse, ShareRequest, UploadRequest,
};

/// Maximum number of retries for retryable read errors
const MAX_READ_RETRIES: u32 = 3;

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

/// Remote file storage operations consumed by the file manager
#[async_trait]
pub trait FileApi: Send + Sync {
    async fn list_files(&self, query: &ListQuery) -> Result<ListFilesResponse, ApiError>;
    async fn upload_file(&self, upload: &UploadRequest) -> Result<FileResponse, ApiError>;
    async fn update_file(&self, file_id: &str, update: &FileUpdate)
        -> Result<MutationResponse, ApiError>;
    async fn delete_file(&self, file_id: &str) -> Result<MutationResponse, ApiError>;
    async fn restore_file(&self, file_id: &str) -> Result<MutationResponse, ApiError>;
    async fn permanently_delete_file(&self, file_id: &str) -> Result<MutationResponse, ApiError>;
    async fn bulk_delete(&self, file_ids: &[String]) -> Result<BulkDeleteResponse, ApiError>;
    async fn bulk_restore(&self, file_ids: &[String]) -> Result<BulkRestoreResponse, ApiError>;
    async fn move_file(&self, file_id: &str, folder_id: Option<&str>)
        -> Result<MoveResponse, ApiError>;
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ApiError>;
    async fn duplicate_file(&self, file_id: &str) -> Result<FileResponse, ApiError>;
    async fn share_file(&self, file_id: &str, share: &ShareRequest)
        -> Result<MutationResponse, ApiError>;
    async fn file_stats(&self, file_id: &str) -> Result<FileStats, ApiError>;
    async fn file_activity(&self, file_id: &str) -> Result<Vec<ActivityEntry>, ApiError>;
}

/// A recent error entry for tracking
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: u64,
    pub operation: String,
    pub path: String,
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    stats: FileStats,
}

#[derive(Debug, Deserialize)]
struct ActivityResponse {
    #[serde(default, alias = "logs")]
    activities: Vec<ActivityEntry>,
}

/// HTTP implementation of [`FileApi`]
#[derive(Clone)]
pub struct HttpFileApi {
    /// HTTP client (cookie store enabled)
    http_client: Client,
    /// API origin, e.g. `https://app.example.com`
    base_url: String,
    /// Optional bearer token sent alongside the session cookie
    auth_token: Option<String>,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: Arc<AtomicU8>,
    /// Recent error log
    error_log: Arc<RwLock<VecDeque<ErrorEntry>>>,
}

impl HttpFileApi {
    /// Create a client for the storage API at `base_url`
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| ApiError::Request(format!("Failed to create HTTP client: {}", e)))?;

        info!(base_url = base_url, "Storage API client ready");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            health: Arc::new(AtomicU8::new(HEALTH_HEALTHY)),
            error_log: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_ERROR_HISTORY))),
        })
    }

    fn files_url(&self, suffix: &str) -> String {
        format!("{}/api/storage/files{}", self.base_url, suffix)
    }

    fn file_url(&self, file_id: &str, suffix: &str) -> String {
        self.files_url(&format!("/{}{}", urlencoding::encode(file_id), suffix))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request and map non-success statuses to [`ApiError`]
    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = self.authorized(request).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.execute(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Execute an operation, retrying retryable failures with exponential backoff
    async fn run<F, Fut, T>(&self, operation: &str, path: &str, retries: u32, f: F) -> Result<T, ApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let backoff_ms = [500u64, 1000, 2000];
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => {
                    self.health.store(HEALTH_HEALTHY, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < retries => {
                    let delay = backoff_ms.get(attempt as usize).copied().unwrap_or(2000);
                    warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        max = retries,
                        delay_ms = delay,
                        error = %e,
                        "Retrying storage operation"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    match e {
                        ApiError::Network(_) | ApiError::Timeout => {
                            self.health.store(HEALTH_UNHEALTHY, Ordering::Relaxed)
                        }
                        ApiError::RateLimited | ApiError::Server(_, _) => {
                            self.health.store(HEALTH_DEGRADED, Ordering::Relaxed)
                        }
                        _ => {}
                    }
                    self.log_error(operation, path, &e.to_string());
                    return Err(e);
                }
            }
        }
    }

    /// Log an error to the error history ring buffer
    fn log_error(&self, operation: &str, path: &str, error: &str) {
        let entry = ErrorEntry {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            operation: operation.to_string(),
            path: path.to_string(),
            error: error.to_string(),
        };

        let mut log = self.error_log.write().unwrap_or_else(PoisonError::into_inner);
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Get connection health status string
    pub fn health_status(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    /// Get recent errors
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FileApi for HttpFileApi {
    async fn list_files(&self, query: &ListQuery) -> Result<ListFilesResponse, ApiError> {
        let url = self.files_url("");
        let params = query.params();
        debug!(params = ?params, "Listing files");

        let response: ListFilesResponse = self
            .run("list_files", &url, MAX_READ_RETRIES, || {
                self.execute_json(self.http_client.get(&url).query(&params))
            })
            .await?;

        debug!(count = response.files.len(), "Listed files");
        Ok(response)
    }

    async fn upload_file(&self, upload: &UploadRequest) -> Result<FileResponse, ApiError> {
        let url = self.files_url("/upload");

        info!(
            file = %upload.file_name,
            size = upload.bytes.len(),
            content_type = %upload.content_type,
            "Uploading file"
        );

        let url = url.as_str();
        self.run("upload_file", &upload.file_name, 0, move || async move {
            let part = Part::bytes(upload.bytes.clone())
                .file_name(upload.file_name.clone())
                .mime_str(&upload.content_type)?;
            let mut form = Form::new().part("file", part);
            if let Some(display_name) = &upload.display_name {
                form = form.text("displayName", display_name.clone());
            }
            if let Some(file_type) = &upload.file_type {
                form = form.text("type", file_type.clone());
            }
            if let Some(description) = &upload.description {
                form = form.text("description", description.clone());
            }
            if !upload.tags.is_empty() {
                form = form.text("tags", upload.tags.join(","));
            }
            if let Some(expires_at) = upload.expires_at {
                form = form.text("expiresAt", expires_at.to_rfc3339());
            }
            if let Some(folder_id) = &upload.folder_id {
                form = form.text("folderId", folder_id.clone());
            }
            self.execute_json(self.http_client.post(url).multipart(form))
                .await
        })
        .await
    }

    async fn update_file(
        &self,
        file_id: &str,
        update: &FileUpdate,
    ) -> Result<MutationResponse, ApiError> {
        let url = self.file_url(file_id, "");
        self.run("update_file", file_id, 0, || {
            self.execute_json(self.http_client.put(&url).json(update))
        })
        .await
    }

    async fn delete_file(&self, file_id: &str) -> Result<MutationResponse, ApiError> {
        let url = self.file_url(file_id, "");
        info!(file_id = file_id, "Moving file to recycle bin");
        self.run("delete_file", file_id, 0, || {
            self.execute_json(self.http_client.delete(&url))
        })
        .await
    }

    async fn restore_file(&self, file_id: &str) -> Result<MutationResponse, ApiError> {
        let url = self.file_url(file_id, "/restore");
        self.run("restore_file", file_id, 0, || {
            self.execute_json(self.http_client.post(&url))
        })
        .await
    }

    async fn permanently_delete_file(&self, file_id: &str) -> Result<MutationResponse, ApiError> {
        let url = self.file_url(file_id, "/permanent");
        info!(file_id = file_id, "Permanently deleting file");
        self.run("permanently_delete_file", file_id, 0, || {
            self.execute_json(self.http_client.delete(&url))
        })
        .await
    }

    async fn bulk_delete(&self, file_ids: &[String]) -> Result<BulkDeleteResponse, ApiError> {
        let url = self.files_url("/bulk/delete");
        let body = serde_json::json!({ "fileIds": file_ids });
        self.run("bulk_delete", &url, 0, || {
            self.execute_json(self.http_client.post(&url).json(&body))
        })
        .await
    }

    async fn bulk_restore(&self, file_ids: &[String]) -> Result<BulkRestoreResponse, ApiError> {
        let url = self.files_url("/bulk/restore");
        let body = serde_json::json!({ "fileIds": file_ids });
        self.run("bulk_restore", &url, 0, || {
            self.execute_json(self.http_client.post(&url).json(&body))
        })
        .await
    }

    async fn move_file(
        &self,
        file_id: &str,
        folder_id: Option<&str>,
    ) -> Result<MoveResponse, ApiError> {
        let url = self.file_url(file_id, "/move");
        let body = serde_json::json!({ "folderId": folder_id });
        self.run("move_file", file_id, 0, || {
            self.execute_json(self.http_client.put(&url).json(&body))
        })
        .await
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.file_url(file_id, "/download");
        let url = url.as_str();
        debug!(file_id = file_id, url = %url, "Downloading file");

        let bytes = self
            .run("download_file", file_id, MAX_READ_RETRIES, move || async move {
                let response = self.execute(self.http_client.get(url)).await?;
                Ok::<_, ApiError>(response.bytes().await?)
            })
            .await?;

        info!(file_id = file_id, size = bytes.len(), "Downloaded file");
        Ok(bytes.to_vec())
    }

    async fn duplicate_file(&self, file_id: &str) -> Result<FileResponse, ApiError> {
        let url = self.file_url(file_id, "/duplicate");
        self.run("duplicate_file", file_id, 0, || {
            self.execute_json(self.http_client.post(&url))
        })
        .await
    }

    async fn share_file(
        &self,
        file_id: &str,
        share: &ShareRequest,
    ) -> Result<MutationResponse, ApiError> {
        let url = self.file_url(file_id, "/share");
        self.run("share_file", file_id, 0, || {
            self.execute_json(self.http_client.post(&url).json(share))
        })
        .await
    }

    async fn file_stats(&self, file_id: &str) -> Result<FileStats, ApiError> {
        let url = self.file_url(file_id, "/stats");
        let response: StatsResponse = self
            .run("file_stats", file_id, MAX_READ_RETRIES, || {
                self.execute_json(self.http_client.get(&url))
            })
            .await?;
        Ok(response.stats)
    }

    async fn file_activity(&self, file_id: &str) -> Result<Vec<ActivityEntry>, ApiError> {
        let url = self.file_url(file_id, "/activity");
        let response: ActivityResponse = self
            .run("file_activity", file_id, MAX_READ_RETRIES, || {
                self.execute_json(self.http_client.get(&url))
            })
            .await?;
        Ok(response.activities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpFileApi {
        HttpFileApi::new("https://files.example.com/", None, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_url_building() {
        let api = client();
        assert_eq!(api.files_url(""), "https://files.example.com/api/storage/files");
        assert_eq!(
            api.file_url("a b", "/restore"),
            "https://files.example.com/api/storage/files/a%20b/restore"
        );
    }

    #[test]
    fn test_error_log_is_bounded() {
        let api = client();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            api.log_error("delete_file", &format!("f{i}"), "boom");
        }
        let errors = api.recent_errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        assert_eq!(errors[0].path, "f5");
    }

    #[tokio::test]
    async fn test_run_stops_on_non_retryable() {
        let api = client();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), ApiError> = api
            .run("update_file", "f1", 3, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::NotFound("gone".into())) }
            })
            .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.recent_errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_retryable_then_degrades_health() {
        let api = client();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), ApiError> = api
            .run("list_files", "/files", 2, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::RateLimited) }
            })
            .await;
        assert!(matches!(result, Err(ApiError::RateLimited)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(api.health_status(), "degraded");
    }
}
