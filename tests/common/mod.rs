//! In-memory storage API used by the integration tests
//!
//! Keeps server-side file state, counts calls per endpoint and lets a test
//! script failures and latency.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use cloudfiles::api::{
    ActivityEntry, ApiError, BulkDeleteResponse, BulkItemResult, BulkRestoreResponse, FileApi,
    FileResponse, FileStats, FileUpdate, ListFilesResponse, ListQuery, MoveResponse,
    MutationResponse, Pagination, RawFileRecord, ShareRequest, SizeField, StorageQuota,
    UploadRequest,
};
use cloudfiles::cache::MemoryStore;
use cloudfiles::files::{FileManager, ManagerSettings};
use cloudfiles::Connectivity;

pub const LIMIT_BYTES: u64 = 10 * 1024 * 1024 * 1024;

pub fn raw(id: &str, name: &str) -> RawFileRecord {
    RawFileRecord {
        id: id.to_string(),
        name: Some(name.to_string()),
        file_name: Some(format!("{}.pdf", name)),
        content_type: Some("application/pdf".to_string()),
        size: Some(SizeField::Bytes(1024)),
        size_bytes: 1024,
        owner: Some("user-1".to_string()),
        created_at: Some(Utc::now()),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeApi {
    files: Mutex<Vec<RawFileRecord>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    log: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ApiError>>>,
    delay: Mutex<Option<Duration>>,
    bulk_failures: Mutex<HashSet<String>>,
    body: Mutex<Vec<u8>>,
    upload_id: Mutex<Option<String>>,
    holds: Mutex<HashMap<&'static str, Arc<Notify>>>,
}

impl FakeApi {
    pub fn new(files: Vec<RawFileRecord>) -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(files),
            body: Mutex::new(b"%PDF-1.7 fake body".to_vec()),
            ..Default::default()
        })
    }

    pub fn with_ids(ids: &[&str]) -> Arc<Self> {
        Self::new(ids.iter().map(|id| raw(id, &format!("file-{}", id))).collect())
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }

    /// Mutating calls in the order they reached the server, as `endpoint:id`
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Fail the next call to `endpoint` with `error`
    pub fn fail_next(&self, endpoint: &'static str, error: ApiError) {
        self.failures
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Report `id` as failed in bulk delete results
    pub fn fail_in_bulk(&self, id: &str) {
        self.bulk_failures.lock().unwrap().insert(id.to_string());
    }

    pub fn set_body(&self, body: &[u8]) {
        *self.body.lock().unwrap() = body.to_vec();
    }

    /// Make the next upload return this id
    pub fn set_upload_id(&self, id: &str) {
        *self.upload_id.lock().unwrap() = Some(id.to_string());
    }

    /// Park the next call to `endpoint` until the returned handle is notified
    pub fn hold_next(&self, endpoint: &'static str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.holds.lock().unwrap().insert(endpoint, Arc::clone(&notify));
        notify
    }

    pub fn server_file(&self, id: &str) -> Option<RawFileRecord> {
        self.files.lock().unwrap().iter().find(|f| f.id == id).cloned()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.files.lock().unwrap().iter().map(|f| f.id.clone()).collect()
    }

    async fn enter(&self, endpoint: &'static str, id: &str) -> Result<(), ApiError> {
        *self.calls.lock().unwrap().entry(endpoint).or_default() += 1;
        let hold = self.holds.lock().unwrap().remove(endpoint);
        if let Some(hold) = hold {
            hold.notified().await;
        }
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }
        if !id.is_empty() {
            self.log.lock().unwrap().push(format!("{}:{}", endpoint, id));
        }
        Ok(())
    }

    fn storage(&self) -> StorageQuota {
        let used = self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.deleted_at.is_none())
            .map(|f| f.size_bytes)
            .sum();
        StorageQuota::new(used, LIMIT_BYTES)
    }

    fn with_file<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut RawFileRecord) -> T,
    ) -> Result<T, ApiError> {
        let mut files = self.files.lock().unwrap();
        match files.iter_mut().find(|r| r.id == id) {
            Some(record) => Ok(f(record)),
            None => Err(ApiError::NotFound(format!("File {} not found", id))),
        }
    }

    fn mutation(&self) -> MutationResponse {
        MutationResponse {
            success: true,
            message: None,
            storage: Some(self.storage()),
        }
    }
}

#[async_trait]
impl FileApi for FakeApi {
    async fn list_files(&self, query: &ListQuery) -> Result<ListFilesResponse, ApiError> {
        self.enter("list_files", "").await?;
        let files: Vec<RawFileRecord> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|f| query.include_deleted || f.deleted_at.is_none())
            .filter(|f| query.folder_id.is_none() || f.folder_id == query.folder_id)
            .cloned()
            .collect();
        let total = files.len() as u64;
        Ok(ListFilesResponse {
            files,
            storage: Some(self.storage()),
            pagination: Some(Pagination {
                page: query.page,
                page_size: query.page_size,
                total,
                total_pages: 1,
            }),
        })
    }

    async fn upload_file(&self, upload: &UploadRequest) -> Result<FileResponse, ApiError> {
        self.enter("upload_file", &upload.file_name).await?;
        let id = self.upload_id.lock().unwrap().take().unwrap_or_else(|| {
            format!("up-{}", self.calls("upload_file"))
        });
        let record = RawFileRecord {
            id: id.clone(),
            name: upload.display_name.clone(),
            file_name: Some(upload.file_name.clone()),
            content_type: Some(upload.content_type.clone()),
            size: Some(SizeField::Bytes(upload.bytes.len() as u64)),
            size_bytes: upload.bytes.len() as u64,
            folder_id: upload.folder_id.clone(),
            tags: Some(upload.tags.clone()),
            created_at: Some(Utc::now()),
            ..Default::default()
        };
        {
            let mut files = self.files.lock().unwrap();
            match files.iter_mut().find(|f| f.id == id) {
                Some(existing) => *existing = record.clone(),
                None => files.insert(0, record.clone()),
            }
        }
        Ok(FileResponse {
            file: Some(record),
            storage: Some(self.storage()),
        })
    }

    async fn update_file(
        &self,
        file_id: &str,
        update: &FileUpdate,
    ) -> Result<MutationResponse, ApiError> {
        self.enter("update_file", file_id).await?;
        self.with_file(file_id, |record| {
            if let Some(name) = &update.name {
                record.name = Some(name.clone());
            }
            if let Some(file_type) = &update.file_type {
                record.file_type = Some(file_type.clone());
            }
            if let Some(description) = &update.description {
                record.description = Some(description.clone());
            }
            if let Some(starred) = update.is_starred {
                record.is_starred = Some(starred);
            }
            if let Some(archived) = update.is_archived {
                record.is_archived = Some(archived);
            }
            if let Some(folder_id) = &update.folder_id {
                record.folder_id = folder_id.clone();
            }
        })?;
        Ok(self.mutation())
    }

    async fn delete_file(&self, file_id: &str) -> Result<MutationResponse, ApiError> {
        self.enter("delete_file", file_id).await?;
        self.with_file(file_id, |record| record.deleted_at = Some(Utc::now()))?;
        Ok(self.mutation())
    }

    async fn restore_file(&self, file_id: &str) -> Result<MutationResponse, ApiError> {
        self.enter("restore_file", file_id).await?;
        self.with_file(file_id, |record| record.deleted_at = None)?;
        Ok(self.mutation())
    }

    async fn permanently_delete_file(&self, file_id: &str) -> Result<MutationResponse, ApiError> {
        self.enter("permanently_delete_file", file_id).await?;
        self.with_file(file_id, |_| ())?;
        self.files.lock().unwrap().retain(|f| f.id != file_id);
        Ok(self.mutation())
    }

    async fn bulk_delete(&self, file_ids: &[String]) -> Result<BulkDeleteResponse, ApiError> {
        self.enter("bulk_delete", &file_ids.join(",")).await?;
        let failing = self.bulk_failures.lock().unwrap().clone();
        let mut results = Vec::new();
        let mut deleted = 0;
        for id in file_ids {
            if failing.contains(id) {
                results.push(BulkItemResult::failure(id, "Permission denied"));
                continue;
            }
            match self.with_file(id, |record| record.deleted_at = Some(Utc::now())) {
                Ok(()) => {
                    deleted += 1;
                    results.push(BulkItemResult::success(id));
                }
                Err(e) => results.push(BulkItemResult::failure(id, e.to_string())),
            }
        }
        Ok(BulkDeleteResponse {
            results,
            deleted_count: deleted,
            storage: Some(self.storage()),
        })
    }

    async fn bulk_restore(&self, file_ids: &[String]) -> Result<BulkRestoreResponse, ApiError> {
        self.enter("bulk_restore", &file_ids.join(",")).await?;
        let restored = file_ids
            .iter()
            .filter(|id| self.with_file(id, |record| record.deleted_at = None).is_ok())
            .count();
        Ok(BulkRestoreResponse {
            restored_count: restored as u64,
        })
    }

    async fn move_file(
        &self,
        file_id: &str,
        folder_id: Option<&str>,
    ) -> Result<MoveResponse, ApiError> {
        self.enter("move_file", file_id).await?;
        self.with_file(file_id, |record| record.folder_id = folder_id.map(str::to_string))?;
        Ok(MoveResponse {
            success: true,
            error: None,
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ApiError> {
        self.enter("download_file", file_id).await?;
        Ok(self.body.lock().unwrap().clone())
    }

    async fn duplicate_file(&self, file_id: &str) -> Result<FileResponse, ApiError> {
        self.enter("duplicate_file", file_id).await?;
        let copy = self.with_file(file_id, |record| {
            let mut copy = record.clone();
            copy.id = format!("{}-copy", record.id);
            copy.name = record.name.as_ref().map(|n| format!("{} (copy)", n));
            copy
        })?;
        self.files.lock().unwrap().insert(0, copy.clone());
        Ok(FileResponse {
            file: Some(copy),
            storage: Some(self.storage()),
        })
    }

    async fn share_file(
        &self,
        file_id: &str,
        _share: &ShareRequest,
    ) -> Result<MutationResponse, ApiError> {
        self.enter("share_file", file_id).await?;
        self.with_file(file_id, |_| ())?;
        Ok(self.mutation())
    }

    async fn file_stats(&self, file_id: &str) -> Result<FileStats, ApiError> {
        self.enter("file_stats", "").await?;
        let record = self.with_file(file_id, |record| record.clone())?;
        Ok(FileStats {
            file_id: record.id,
            download_count: record.download_count,
            view_count: record.view_count,
            share_count: 0,
            last_accessed_at: None,
        })
    }

    async fn file_activity(&self, file_id: &str) -> Result<Vec<ActivityEntry>, ApiError> {
        self.enter("file_activity", "").await?;
        self.with_file(file_id, |_| ())?;
        Ok(vec![ActivityEntry {
            id: "a1".to_string(),
            action: "upload".to_string(),
            user_id: Some("user-1".to_string()),
            created_at: Utc::now(),
            details: None,
        }])
    }
}

pub fn manager(api: &Arc<FakeApi>) -> FileManager {
    manager_with(api, ManagerSettings::default(), Connectivity::new(true))
}

pub fn manager_with(
    api: &Arc<FakeApi>,
    settings: ManagerSettings,
    connectivity: Connectivity,
) -> FileManager {
    let api: Arc<dyn FileApi> = api.clone();
    FileManager::builder(api, Arc::new(MemoryStore::default()))
        .settings(settings)
        .connectivity(connectivity)
        .build()
}

/// Manager with the first page already loaded, deleted files included
pub async fn loaded(api: &Arc<FakeApi>) -> FileManager {
    let manager = manager(api);
    manager
        .load_files(ListQuery {
            include_deleted: true,
            ..ListQuery::default()
        })
        .await;
    manager
}
