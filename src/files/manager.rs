//! File Operations Manager
//!
//! Owns the file list and runs every operation against the storage API.
//! Mutations are applied locally first and rolled back if the server
//! rejects them. While offline, queueable mutations are applied locally and
//! recorded in the offline queue instead of calling the API.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::optimistic::{optimistic, OptimisticUpdate};
use super::state::{FileAction, FileState};
use crate::api::{
    ActivityEntry, ApiError, BulkItemResult, DownloadFormat, FileApi, FileRecord, FileStats,
    FileUpdate, ListFilesResponse, ListQuery, OperationError, Pagination, ShareRequest,
    StorageQuota, UploadRequest,
};
use crate::cache::{FileCache, KeyValueStore, TtlCache};
use crate::net::{generate_request_key, with_timeout, Connectivity, Deduplicator};
use crate::queue::{DrainReport, OfflineQueue, OperationKind, MAX_RETRIES};

/// Endpoint the listing cache and deduplication keys are derived from
const FILES_ENDPOINT: &str = "/api/storage/files";

const LOAD_FILES: &str = "load_files";
const UPLOAD: &str = "upload";
const BULK_DELETE: &str = "bulk_delete";
const BULK_RESTORE: &str = "bulk_restore";

/// Invoked whenever a response carries a new quota snapshot
pub type StorageCallback = Arc<dyn Fn(&StorageQuota) + Send + Sync>;

/// Refreshes the caller's folder list after a move
pub type FolderRefresh = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Runs after a successful move with the moved record
pub type MoveCallback = Box<dyn FnOnce(&FileRecord) -> anyhow::Result<()> + Send>;

/// Timing knobs of the manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub list_ttl: Duration,
    pub star_timeout: Duration,
    pub delete_timeout: Duration,
    pub bulk_delete_timeout: Duration,
    pub edit_reload_delay: Duration,
    pub dedup_window: Duration,
    pub max_retries: u32,
    pub retry_backoff: Vec<Duration>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            list_ttl: Duration::from_secs(30),
            star_timeout: Duration::from_secs(10),
            delete_timeout: Duration::from_secs(30),
            bulk_delete_timeout: Duration::from_secs(60),
            edit_reload_delay: Duration::from_millis(100),
            dedup_window: Duration::from_secs(30),
            max_retries: MAX_RETRIES,
            retry_backoff: vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
            ],
        }
    }
}

/// Result of a mutation that may have been deferred
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The server confirmed the change
    Completed(T),
    /// Applied locally and queued until connectivity returns
    Queued(Uuid),
}

impl<T> Outcome<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, Outcome::Queued(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Queued(_) => None,
        }
    }
}

/// Follow-up work after a successful move
#[derive(Default)]
pub struct MoveOptions {
    /// Reload the file list
    pub refresh_files: bool,
    pub refresh_folders: Option<FolderRefresh>,
    pub on_moved: Option<MoveCallback>,
}

/// Payload of queued delete operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FileRef {
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdatePayload {
    pub file_id: String,
    pub update: FileUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MovePayload {
    pub file_id: String,
    pub folder_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SharePayload {
    pub file_id: String,
    pub share: ShareRequest,
}

#[derive(Clone, Copy)]
enum Flag {
    Starred,
    Archived,
}

impl Flag {
    fn error_key(self, file_id: &str) -> String {
        match self {
            Flag::Starred => format!("star_{}", file_id),
            Flag::Archived => format!("archive_{}", file_id),
        }
    }
}

/// Marks ids as loading for as long as it lives
struct LoadingGuard<'a> {
    state: &'a RwLock<FileState>,
    keys: Vec<String>,
}

impl<'a> LoadingGuard<'a> {
    fn new<S: AsRef<str>>(state: &'a RwLock<FileState>, keys: &[S]) -> Self {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let mut guard = state.write().unwrap_or_else(PoisonError::into_inner);
        for key in &keys {
            guard.dispatch(FileAction::SetLoading {
                key: key.clone(),
                loading: true,
            });
        }
        Self { state, keys }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for key in self.keys.drain(..) {
            guard.dispatch(FileAction::SetLoading {
                key,
                loading: false,
            });
        }
    }
}

/// Builder for [`FileManager`]
pub struct FileManagerBuilder {
    api: Arc<dyn FileApi>,
    store: Arc<dyn KeyValueStore>,
    settings: ManagerSettings,
    connectivity: Connectivity,
    file_cache: Option<FileCache>,
    on_storage: Option<StorageCallback>,
}

impl FileManagerBuilder {
    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Keep downloaded bodies on disk for offline access
    pub fn file_cache(mut self, file_cache: FileCache) -> Self {
        self.file_cache = Some(file_cache);
        self
    }

    pub fn on_storage_update(mut self, callback: impl Fn(&StorageQuota) + Send + Sync + 'static) -> Self {
        self.on_storage = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> FileManager {
        let queue = OfflineQueue::load(
            Arc::clone(&self.store),
            self.connectivity.clone(),
            self.settings.max_retries,
        );
        let window = self.settings.dedup_window;

        FileManager {
            inner: Arc::new(Inner {
                api: self.api,
                state: RwLock::new(FileState::new()),
                cache: Arc::new(TtlCache::new(self.store)),
                listings: Deduplicator::new(window),
                stats: Deduplicator::new(window),
                activity: Deduplicator::new(window),
                queue: Arc::new(queue),
                connectivity: self.connectivity,
                file_cache: self.file_cache,
                settings: self.settings,
                on_storage: self.on_storage,
                cancel: CancellationToken::new(),
            }),
        }
    }
}

struct Inner {
    api: Arc<dyn FileApi>,
    state: RwLock<FileState>,
    cache: Arc<TtlCache>,
    listings: Deduplicator<ListFilesResponse>,
    stats: Deduplicator<FileStats>,
    activity: Deduplicator<Vec<ActivityEntry>>,
    queue: Arc<OfflineQueue>,
    connectivity: Connectivity,
    file_cache: Option<FileCache>,
    settings: ManagerSettings,
    on_storage: Option<StorageCallback>,
    /// Cancels in-flight bounded operations on shutdown
    cancel: CancellationToken,
}

/// Single source of truth for the file list
#[derive(Clone)]
pub struct FileManager {
    inner: Arc<Inner>,
}

impl FileManager {
    pub fn builder(api: Arc<dyn FileApi>, store: Arc<dyn KeyValueStore>) -> FileManagerBuilder {
        FileManagerBuilder {
            api,
            store,
            settings: ManagerSettings::default(),
            connectivity: Connectivity::default(),
            file_cache: None,
            on_storage: None,
        }
    }

    // ---- internal helpers ----

    fn read(&self) -> RwLockReadGuard<'_, FileState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn dispatch(&self, action: FileAction) {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .dispatch(action);
    }

    pub(super) fn api(&self) -> &dyn FileApi {
        self.inner.api.as_ref()
    }

    fn record_error(&self, key: &str, error: &ApiError) {
        warn!(operation = key, error = %error, retryable = error.is_retryable(), "Operation failed");
        self.dispatch(FileAction::RecordError {
            key: key.to_string(),
            error: error.classify(),
        });
    }

    /// Store a new quota snapshot and notify the storage callback
    pub(super) fn update_storage(&self, storage: Option<StorageQuota>) {
        let Some(storage) = storage.map(StorageQuota::normalized) else {
            return;
        };
        self.dispatch(FileAction::SetStorage(storage));
        if let Some(callback) = &self.inner.on_storage {
            callback(&storage);
        }
    }

    fn require_online(&self) -> Result<(), ApiError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(ApiError::Network("Offline".to_string()))
        }
    }

    fn enqueue<P: Serialize>(&self, kind: OperationKind, payload: &P) -> Result<Uuid, ApiError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
        Ok(self.inner.queue.enqueue(kind, payload)?)
    }

    /// Apply `change` locally and queue the mutation for later replay
    fn queue_offline<P: Serialize>(
        &self,
        ids: &[&str],
        change: impl FnOnce(&mut FileState),
        kind: OperationKind,
        payload: &P,
    ) -> Result<Uuid, ApiError> {
        let update = OptimisticUpdate::apply(&self.inner.state, ids, change);
        match self.enqueue(kind, payload) {
            Ok(id) => {
                update.commit();
                Ok(id)
            }
            Err(e) => {
                update.rollback();
                Err(e)
            }
        }
    }

    /// Drop cached listings and fetch the current query again
    async fn reload(&self, include_deleted: bool) {
        if !self.is_online() {
            debug!("Offline, skipping reload");
            return;
        }
        self.inner.cache.clear_all();
        let mut query = self.read().query().clone();
        query.include_deleted = include_deleted;
        self.load_files(query).await;
    }

    fn schedule_reload(&self, include_deleted: bool) {
        let manager = self.clone();
        let delay = self.inner.settings.edit_reload_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.reload(include_deleted).await;
        });
    }

    fn current_include_deleted(&self) -> bool {
        self.read().query().include_deleted
    }

    // ---- listing ----

    /// Fetch one page of files
    ///
    /// Never fails: on error the list is cleared and the classified error is
    /// recorded under `load_files`.
    pub async fn load_files(&self, query: ListQuery) {
        self.dispatch(FileAction::SetQuery(query.clone()));
        let _loading = LoadingGuard::new(&self.inner.state, &[LOAD_FILES]);

        match self.fetch_listing(&query).await {
            Ok(response) => {
                let files: Vec<FileRecord> =
                    response.files.into_iter().map(FileRecord::from).collect();
                debug!(count = files.len(), page = query.page, "Loaded files");
                self.dispatch(FileAction::Loaded {
                    files,
                    pagination: response.pagination,
                });
                self.dispatch(FileAction::ClearError {
                    key: LOAD_FILES.to_string(),
                });
                self.update_storage(response.storage);
            }
            Err(e) => {
                self.dispatch(FileAction::Cleared);
                self.record_error(LOAD_FILES, &e);
            }
        }
    }

    async fn fetch_listing(&self, query: &ListQuery) -> Result<ListFilesResponse, ApiError> {
        let key = generate_request_key(FILES_ENDPOINT, query.params());
        if let Some(cached) = self.inner.cache.get::<ListFilesResponse>(&key) {
            debug!(key = %key, "Serving file list from cache");
            return Ok(cached);
        }

        let api = Arc::clone(&self.inner.api);
        let cache = Arc::clone(&self.inner.cache);
        let ttl = self.inner.settings.list_ttl;
        let query = query.clone();
        let cache_key = key.clone();

        self.inner
            .listings
            .deduplicate(&key, move || async move {
                let response = api.list_files(&query).await?;
                cache.set(&cache_key, &response, ttl);
                Ok(response)
            })
            .await
    }

    /// Reload the last query with the given deleted-files filter
    pub async fn refresh(&self, show_deleted: bool) {
        let mut query = self.read().query().clone();
        query.include_deleted = show_deleted;
        self.load_files(query).await;
    }

    // ---- mutations ----

    /// Upload a file and merge the returned record by id
    ///
    /// The list is reloaded from the server afterwards whatever the outcome.
    pub async fn upload(&self, request: UploadRequest) -> Result<Outcome<FileRecord>, ApiError> {
        if request.bytes.is_empty() {
            return Err(ApiError::InvalidInput("Cannot upload an empty file".into()));
        }
        if !self.is_online() {
            let id = self.enqueue(OperationKind::Upload, &request)?;
            return Ok(Outcome::Queued(id));
        }

        let result = {
            let _loading = LoadingGuard::new(&self.inner.state, &[UPLOAD]);
            self.inner
                .api
                .upload_file(&request)
                .await
                .and_then(|response| {
                    self.update_storage(response.storage);
                    response.file.map(FileRecord::from).ok_or_else(|| {
                        ApiError::InvalidResponse("Upload response did not include the file".into())
                    })
                })
        };

        match &result {
            Ok(record) => {
                info!(file_id = %record.id, name = %record.name, "Uploaded file");
                self.dispatch(FileAction::Upsert(record.clone()));
                self.dispatch(FileAction::ClearError {
                    key: UPLOAD.to_string(),
                });
            }
            Err(e) => {
                if let Some(storage) = e.storage() {
                    self.update_storage(Some(*storage));
                }
                self.record_error(UPLOAD, e);
            }
        }

        let include_deleted = self.current_include_deleted();
        self.reload(include_deleted).await;
        result.map(Outcome::Completed)
    }

    /// Apply a sparse metadata update
    ///
    /// The change is shown immediately and rolled back if the server rejects
    /// it. A background reload follows a successful update.
    pub async fn edit_file(
        &self,
        file_id: &str,
        update: FileUpdate,
        show_deleted: bool,
    ) -> Result<Outcome<()>, ApiError> {
        if update.is_empty() {
            return Ok(Outcome::Completed(()));
        }
        let change = |s: &mut FileState| {
            s.dispatch(FileAction::Update {
                id: file_id.to_string(),
                update: update.clone(),
            })
        };

        if !self.is_online() {
            let payload = UpdatePayload {
                file_id: file_id.to_string(),
                update: update.clone(),
            };
            let id = self.queue_offline(&[file_id], change, OperationKind::Update, &payload)?;
            return Ok(Outcome::Queued(id));
        }

        let key = format!("edit_{}", file_id);
        let remote = self.inner.api.update_file(file_id, &update);
        match optimistic(&self.inner.state, &[file_id], change, remote).await {
            Ok(response) => {
                self.dispatch(FileAction::ClearError { key });
                self.update_storage(response.storage);
                self.schedule_reload(show_deleted);
                Ok(Outcome::Completed(()))
            }
            Err(e) => {
                self.record_error(&key, &e);
                Err(e)
            }
        }
    }

    /// Flip the starred flag; returns the new value
    pub async fn toggle_star(&self, file_id: &str) -> Result<Outcome<bool>, ApiError> {
        self.toggle_flag(file_id, Flag::Starred).await
    }

    /// Flip the archived flag; returns the new value
    pub async fn toggle_archive(&self, file_id: &str) -> Result<Outcome<bool>, ApiError> {
        self.toggle_flag(file_id, Flag::Archived).await
    }

    async fn toggle_flag(&self, file_id: &str, flag: Flag) -> Result<Outcome<bool>, ApiError> {
        let value = {
            let state = self.read();
            let record = state
                .file(file_id)
                .ok_or_else(|| ApiError::NotFound(format!("File {} is not loaded", file_id)))?;
            match flag {
                Flag::Starred => !record.is_starred,
                Flag::Archived => !record.is_archived,
            }
        };
        let update = match flag {
            Flag::Starred => FileUpdate {
                is_starred: Some(value),
                ..Default::default()
            },
            Flag::Archived => FileUpdate {
                is_archived: Some(value),
                ..Default::default()
            },
        };
        let change = |s: &mut FileState| {
            s.dispatch(FileAction::Update {
                id: file_id.to_string(),
                update: update.clone(),
            })
        };

        if !self.is_online() {
            let payload = UpdatePayload {
                file_id: file_id.to_string(),
                update: update.clone(),
            };
            let id = self.queue_offline(&[file_id], change, OperationKind::Update, &payload)?;
            return Ok(Outcome::Queued(id));
        }

        let key = flag.error_key(file_id);
        let remote = with_timeout(
            self.inner.api.update_file(file_id, &update),
            self.inner.settings.star_timeout,
            &self.inner.cancel,
        );

        match optimistic(&self.inner.state, &[file_id], change, remote).await {
            Ok(response) => {
                self.dispatch(FileAction::ClearError { key });
                self.update_storage(response.storage);
                debug!(file_id = file_id, value = value, "Toggled flag");
                Ok(Outcome::Completed(value))
            }
            Err(e) => {
                if e.is_retryable() {
                    self.record_error(&key, &e);
                } else {
                    warn!(file_id = file_id, error = %e, "Toggle rejected");
                }
                Err(e)
            }
        }
    }

    /// Move a file to the recycle bin
    pub async fn delete_file(&self, file_id: &str, show_deleted: bool) -> Result<Outcome<()>, ApiError> {
        let now = Utc::now();
        let change = |s: &mut FileState| {
            s.dispatch(FileAction::MarkDeleted {
                id: file_id.to_string(),
                at: now,
            })
        };

        if !self.is_online() {
            let payload = FileRef {
                file_id: file_id.to_string(),
            };
            let id = self.queue_offline(&[file_id], change, OperationKind::Delete, &payload)?;
            return Ok(Outcome::Queued(id));
        }

        let key = format!("delete_{}", file_id);
        let result = {
            let _loading = LoadingGuard::new(&self.inner.state, &[file_id]);
            let remote = with_timeout(
                self.inner.api.delete_file(file_id),
                self.inner.settings.delete_timeout,
                &self.inner.cancel,
            );
            optimistic(&self.inner.state, &[file_id], change, remote).await
        };

        match result {
            Ok(response) => {
                self.dispatch(FileAction::ClearError { key });
                self.update_storage(response.storage);
                self.reload(show_deleted).await;
                Ok(Outcome::Completed(()))
            }
            Err(e) => {
                self.record_error(&key, &e);
                Err(e)
            }
        }
    }

    /// Bring a file back from the recycle bin
    pub async fn restore_file(&self, file_id: &str) -> Result<(), ApiError> {
        self.require_online()?;
        let key = format!("restore_{}", file_id);
        let change = |s: &mut FileState| {
            s.dispatch(FileAction::MarkRestored {
                id: file_id.to_string(),
            })
        };

        match optimistic(
            &self.inner.state,
            &[file_id],
            change,
            self.inner.api.restore_file(file_id),
        )
        .await
        {
            Ok(response) => {
                info!(file_id = file_id, "Restored file");
                self.dispatch(FileAction::ClearError { key });
                self.update_storage(response.storage);
                self.reload(true).await;
                Ok(())
            }
            Err(e) => {
                self.record_error(&key, &e);
                Err(e)
            }
        }
    }

    /// Remove a file for good
    pub async fn permanently_delete_file(&self, file_id: &str) -> Result<(), ApiError> {
        self.require_online()?;
        let key = format!("purge_{}", file_id);
        let change = |s: &mut FileState| {
            s.dispatch(FileAction::Remove {
                id: file_id.to_string(),
            })
        };

        match optimistic(
            &self.inner.state,
            &[file_id],
            change,
            self.inner.api.permanently_delete_file(file_id),
        )
        .await
        {
            Ok(response) => {
                info!(file_id = file_id, "Permanently deleted file");
                if let Some(cache) = &self.inner.file_cache {
                    cache.invalidate(file_id);
                }
                self.dispatch(FileAction::ClearError { key });
                self.update_storage(response.storage);
                self.reload(true).await;
                Ok(())
            }
            Err(e) => {
                self.record_error(&key, &e);
                Err(e)
            }
        }
    }

    /// Soft-delete several files
    ///
    /// Returns one result per id, in the order given. Only the files the
    /// server reports as failed are rolled back.
    pub async fn bulk_delete(&self, file_ids: &[String]) -> Vec<BulkItemResult> {
        if file_ids.is_empty() {
            return Vec::new();
        }

        if !self.is_online() {
            return file_ids
                .iter()
                .map(|id| match self.delete_offline(id) {
                    Ok(_) => BulkItemResult::success(id),
                    Err(e) => BulkItemResult::failure(id, e.to_string()),
                })
                .collect();
        }

        let _loading = LoadingGuard::new(&self.inner.state, file_ids);
        let now = Utc::now();
        let mark_deleted = |s: &mut FileState| {
            for id in file_ids {
                s.dispatch(FileAction::MarkDeleted {
                    id: id.clone(),
                    at: now,
                });
            }
        };

        if let [file_id] = file_ids {
            let key = format!("delete_{}", file_id);
            let remote = with_timeout(
                self.inner.api.delete_file(file_id),
                self.inner.settings.delete_timeout,
                &self.inner.cancel,
            );
            let result = match optimistic(&self.inner.state, file_ids, mark_deleted, remote).await {
                Ok(response) => {
                    self.dispatch(FileAction::ClearError { key });
                    self.update_storage(response.storage);
                    BulkItemResult::success(file_id)
                }
                Err(e) => {
                    self.record_error(&key, &e);
                    BulkItemResult::failure(file_id, e.to_string())
                }
            };
            return vec![result];
        }

        let update = OptimisticUpdate::apply(&self.inner.state, file_ids, mark_deleted);
        let remote = with_timeout(
            self.inner.api.bulk_delete(file_ids),
            self.inner.settings.bulk_delete_timeout,
            &self.inner.cancel,
        )
        .await;

        match remote {
            Ok(response) => {
                self.update_storage(response.storage);
                let results: Vec<BulkItemResult> = file_ids
                    .iter()
                    .map(|id| match response.results.iter().find(|r| &r.file_id == id) {
                        Some(r) if r.success => BulkItemResult::success(id),
                        Some(r) => BulkItemResult::failure(
                            id,
                            r.error.clone().unwrap_or_else(|| "Delete failed".to_string()),
                        ),
                        None => BulkItemResult::failure(id, "No result returned for file"),
                    })
                    .collect();

                let failed: HashSet<&str> = results
                    .iter()
                    .filter(|r| !r.success)
                    .map(|r| r.file_id.as_str())
                    .collect();
                update.rollback_where(|id| failed.contains(id));

                if failed.is_empty() {
                    self.dispatch(FileAction::ClearError {
                        key: BULK_DELETE.to_string(),
                    });
                } else {
                    let error = ApiError::Request(format!(
                        "{} of {} files could not be deleted",
                        failed.len(),
                        file_ids.len()
                    ));
                    self.record_error(BULK_DELETE, &error);
                }
                info!(
                    requested = file_ids.len(),
                    deleted = file_ids.len() - failed.len(),
                    "Bulk delete finished"
                );
                results
            }
            Err(e) => {
                update.rollback();
                self.record_error(BULK_DELETE, &e);
                file_ids
                    .iter()
                    .map(|id| BulkItemResult::failure(id, e.to_string()))
                    .collect()
            }
        }
    }

    fn delete_offline(&self, file_id: &str) -> Result<Uuid, ApiError> {
        let now = Utc::now();
        let payload = FileRef {
            file_id: file_id.to_string(),
        };
        self.queue_offline(
            &[file_id],
            |s| {
                s.dispatch(FileAction::MarkDeleted {
                    id: file_id.to_string(),
                    at: now,
                })
            },
            OperationKind::Delete,
            &payload,
        )
    }

    /// Restore several files; all of them roll back if the request fails
    pub async fn bulk_restore(&self, file_ids: &[String]) -> Result<u64, ApiError> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        self.require_online()?;

        let change = |s: &mut FileState| {
            for id in file_ids {
                s.dispatch(FileAction::MarkRestored { id: id.clone() });
            }
        };
        let result = {
            let _loading = LoadingGuard::new(&self.inner.state, file_ids);
            optimistic(
                &self.inner.state,
                file_ids,
                change,
                self.inner.api.bulk_restore(file_ids),
            )
            .await
        };

        match result {
            Ok(response) => {
                info!(restored = response.restored_count, "Bulk restore finished");
                self.dispatch(FileAction::ClearError {
                    key: BULK_RESTORE.to_string(),
                });
                self.reload(true).await;
                Ok(response.restored_count)
            }
            Err(e) => {
                self.record_error(BULK_RESTORE, &e);
                Err(e)
            }
        }
    }

    /// Download a file into `dest_dir` and return the written path
    ///
    /// While offline the cached copy is used when there is one.
    pub async fn download(
        &self,
        file_id: &str,
        format: Option<DownloadFormat>,
        dest_dir: &Path,
    ) -> Result<PathBuf, ApiError> {
        if file_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("File id is required".into()));
        }
        let key = format!("download_{}", file_id);
        let record = self.read().file(file_id).cloned();
        let online = self.is_online();

        let body = {
            let _loading = LoadingGuard::new(&self.inner.state, &[key.as_str()]);
            if online {
                self.inner.api.download_file(file_id).await
            } else {
                self.inner
                    .file_cache
                    .as_ref()
                    .and_then(|cache| cache.get(file_id))
                    .ok_or_else(|| {
                        ApiError::Network("Offline and no cached copy is available".into())
                    })
            }
        };
        let body = match body {
            Ok(body) if body.is_empty() => Err(ApiError::EmptyDownload),
            other => other,
        }
        .map_err(|e| {
            self.record_error(&key, &e);
            e
        })?;

        if online {
            if let Some(cache) = &self.inner.file_cache {
                if let Err(e) = cache.store(file_id, &body) {
                    warn!(file_id = file_id, error = %e, "Failed to cache download for offline use");
                }
            }
        }

        let file_name = download_file_name(record.as_ref(), file_id, format);
        let path = write_download(dest_dir, &file_name, &body)?;

        self.dispatch(FileAction::IncrementDownloads {
            id: file_id.to_string(),
        });
        self.dispatch(FileAction::ClearError { key });
        info!(file_id = file_id, path = %path.display(), size = body.len(), "Saved download");
        Ok(path)
    }

    /// Reassign a file to `folder_id` (`None` is the root folder)
    pub async fn move_file(
        &self,
        file_id: &str,
        folder_id: Option<&str>,
        options: MoveOptions,
    ) -> Result<Outcome<()>, ApiError> {
        let action = FileAction::Update {
            id: file_id.to_string(),
            update: FileUpdate {
                folder_id: Some(folder_id.map(str::to_string)),
                ..Default::default()
            },
        };

        if !self.is_online() {
            let payload = MovePayload {
                file_id: file_id.to_string(),
                folder_id: folder_id.map(str::to_string),
            };
            let id = self.queue_offline(
                &[file_id],
                |s| s.dispatch(action),
                OperationKind::Move,
                &payload,
            )?;
            return Ok(Outcome::Queued(id));
        }

        let key = format!("move_{}", file_id);
        let response = self
            .inner
            .api
            .move_file(file_id, folder_id)
            .await
            .and_then(|response| {
                if response.success {
                    Ok(response)
                } else {
                    Err(ApiError::Request(
                        response.error.unwrap_or_else(|| "Move failed".to_string()),
                    ))
                }
            });
        if let Err(e) = response {
            self.record_error(&key, &e);
            return Err(e);
        }

        self.dispatch(action);
        self.dispatch(FileAction::ClearError { key });
        info!(file_id = file_id, folder_id = ?folder_id, "Moved file");

        if options.refresh_files {
            let include_deleted = self.current_include_deleted();
            self.reload(include_deleted).await;
        }
        if let Some(refresh) = options.refresh_folders {
            if let Err(e) = refresh().await {
                warn!(file_id = file_id, error = %e, "Folder refresh after move failed");
            }
        }
        if let Some(callback) = options.on_moved {
            if let Some(record) = self.file(file_id) {
                if let Err(e) = callback(&record) {
                    warn!(file_id = file_id, error = %e, "Move callback failed");
                }
            }
        }
        Ok(Outcome::Completed(()))
    }

    /// Create a server-side copy and add it to the list
    pub async fn duplicate(&self, file_id: &str) -> Result<FileRecord, ApiError> {
        self.require_online()?;
        let key = format!("duplicate_{}", file_id);

        let result = self
            .inner
            .api
            .duplicate_file(file_id)
            .await
            .and_then(|response| {
                self.update_storage(response.storage);
                response.file.map(FileRecord::from).ok_or_else(|| {
                    ApiError::InvalidResponse("Duplicate response did not include the file".into())
                })
            });

        match result {
            Ok(record) => {
                info!(source = file_id, file_id = %record.id, "Duplicated file");
                self.dispatch(FileAction::Upsert(record.clone()));
                self.dispatch(FileAction::ClearError { key });
                Ok(record)
            }
            Err(e) => {
                self.record_error(&key, &e);
                Err(e)
            }
        }
    }

    /// Share a file with another user
    pub async fn share(&self, file_id: &str, share: ShareRequest) -> Result<Outcome<()>, ApiError> {
        let email = share.user_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ApiError::InvalidInput(format!(
                "Invalid email address: {}",
                share.user_email
            )));
        }

        if !self.is_online() {
            let payload = SharePayload {
                file_id: file_id.to_string(),
                share,
            };
            let id = self.enqueue(OperationKind::Share, &payload)?;
            return Ok(Outcome::Queued(id));
        }

        let key = format!("share_{}", file_id);
        match self.inner.api.share_file(file_id, &share).await {
            Ok(response) => {
                info!(file_id = file_id, permission = ?share.permission, "Shared file");
                self.dispatch(FileAction::ClearError { key });
                self.update_storage(response.storage);
                Ok(Outcome::Completed(()))
            }
            Err(e) => {
                self.record_error(&key, &e);
                Err(e)
            }
        }
    }

    // ---- read-through queries ----

    pub async fn file_stats(&self, file_id: &str) -> Result<FileStats, ApiError> {
        let key = format!("{}/{}/stats", FILES_ENDPOINT, file_id);
        let api = Arc::clone(&self.inner.api);
        let id = file_id.to_string();
        self.inner
            .stats
            .deduplicate(&key, move || async move { api.file_stats(&id).await })
            .await
    }

    pub async fn file_activity(&self, file_id: &str) -> Result<Vec<ActivityEntry>, ApiError> {
        let key = format!("{}/{}/activity", FILES_ENDPOINT, file_id);
        let api = Arc::clone(&self.inner.api);
        let id = file_id.to_string();
        self.inner
            .activity
            .deduplicate(&key, move || async move { api.file_activity(&id).await })
            .await
    }

    // ---- selection ----

    pub fn toggle_select(&self, file_id: &str) {
        self.dispatch(FileAction::ToggleSelect {
            id: file_id.to_string(),
        });
    }

    /// Select every visible file, or clear the selection if all are selected
    pub fn select_all(&self, show_deleted: bool) {
        let ids = self
            .read()
            .visible_files(show_deleted)
            .into_iter()
            .map(|f| f.id.clone())
            .collect();
        self.dispatch(FileAction::SelectAll { ids });
    }

    pub fn clear_selection(&self) {
        self.dispatch(FileAction::ClearSelection);
    }

    pub fn selected(&self) -> Vec<String> {
        self.read().selected().iter().cloned().collect()
    }

    /// Soft-delete the selection; failed files stay selected
    pub async fn delete_selected(&self) -> Vec<BulkItemResult> {
        let ids = self.selected();
        self.bulk_delete(&ids).await
    }

    // ---- offline queue ----

    /// Replay queued operations now
    pub async fn sync(&self) -> DrainReport {
        let report = self.inner.queue.drain(self).await;
        if !report.completed.is_empty() {
            let include_deleted = self.current_include_deleted();
            self.reload(include_deleted).await;
        }
        report
    }

    /// Replay the queue whenever connectivity returns
    pub fn spawn_auto_sync(&self) -> JoinHandle<()> {
        Arc::clone(&self.inner.queue).spawn_auto_drain(
            Arc::new(self.clone()),
            self.inner.settings.retry_backoff.clone(),
            self.inner.cancel.child_token(),
        )
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Cancel in-flight bounded operations and background sync
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.listings.clear();
        self.inner.stats.clear();
        self.inner.activity.clear();
        self.inner.cache.log_metrics();
    }

    // ---- getters ----

    pub fn files(&self) -> Vec<FileRecord> {
        self.read().files().to_vec()
    }

    pub fn visible_files(&self, show_deleted: bool) -> Vec<FileRecord> {
        self.read()
            .visible_files(show_deleted)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn file(&self, file_id: &str) -> Option<FileRecord> {
        self.read().file(file_id).cloned()
    }

    pub fn quota(&self) -> Option<StorageQuota> {
        self.read().storage()
    }

    pub fn pagination(&self) -> Pagination {
        self.read().pagination()
    }

    /// Bytes held by active files in the current list
    pub fn active_bytes(&self) -> u64 {
        self.read().active_bytes()
    }

    pub fn folder_counts(&self) -> BTreeMap<Option<String>, usize> {
        self.read().folder_counts()
    }

    pub fn errors(&self) -> BTreeMap<String, OperationError> {
        self.read().errors().clone()
    }

    pub fn error(&self, key: &str) -> Option<OperationError> {
        self.read().errors().get(key).cloned()
    }

    pub fn clear_error(&self, key: &str) {
        self.dispatch(FileAction::ClearError {
            key: key.to_string(),
        });
    }

    pub fn is_loading(&self, key: &str) -> bool {
        self.read().is_loading(key)
    }

    /// Listing cache statistics as (hits, misses, hit_rate)
    pub fn cache_stats(&self) -> (u64, u64, f64) {
        self.inner.cache.stats()
    }
}

/// Local file name for a download, honouring a requested format
fn download_file_name(
    record: Option<&FileRecord>,
    file_id: &str,
    format: Option<DownloadFormat>,
) -> String {
    let base = record
        .map(FileRecord::download_name)
        .unwrap_or_else(|| file_id.to_string());
    let name = match format {
        Some(format) => {
            let stem = Path::new(&base)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(file_id)
                .to_string();
            format!("{}.{}", stem, format.extension())
        }
        None => base,
    };
    name.replace(['/', '\\'], "_")
}

/// Write atomically so a partial download never appears under the final name
fn write_download(dest_dir: &Path, file_name: &str, body: &[u8]) -> Result<PathBuf, ApiError> {
    std::fs::create_dir_all(dest_dir)?;
    let path = dest_dir.join(file_name);
    let mut tmp = tempfile::NamedTempFile::new_in(dest_dir)?;
    tmp.write_all(body)?;
    tmp.persist(&path).map_err(|e| ApiError::from(e.error))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RawFileRecord;

    #[test]
    fn test_download_name_uses_format() {
        let record = FileRecord::from(RawFileRecord {
            id: "f1".into(),
            name: Some("Resume".into()),
            file_name: Some("resume-2024.docx".into()),
            ..Default::default()
        });
        assert_eq!(download_file_name(Some(&record), "f1", None), "resume-2024.docx");
        assert_eq!(
            download_file_name(Some(&record), "f1", Some(DownloadFormat::Pdf)),
            "resume-2024.pdf"
        );
        assert_eq!(download_file_name(None, "a/b", None), "a_b");
    }

    #[test]
    fn test_write_download_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_download(dir.path(), "out.pdf", b"%PDF").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF");
    }

    #[test]
    fn test_outcome_accessors() {
        let done: Outcome<u8> = Outcome::Completed(1);
        assert!(!done.is_queued());
        assert_eq!(done.completed(), Some(1));
        assert!(Outcome::<u8>::Queued(Uuid::new_v4()).is_queued());
    }
}
