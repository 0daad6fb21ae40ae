//! Storage API types and file record normalization
//!
//! Defines wire types for the storage API and the normalized `FileRecord`
//! the file manager keeps in memory.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a number that might be encoded as a string or null.
/// The storage API returns counters from several code paths; some send
/// strings (e.g. "12") and some send null for never-touched files.
fn deserialize_lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct LenientU64Visitor;

    impl<'de> de::Visitor<'de> for LenientU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a u64, a string containing a u64, or null")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
            u64::try_from(value).map_err(|_| de::Error::custom("negative value for u64"))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<u64, E> {
            if value.is_finite() && value >= 0.0 {
                Ok(value as u64)
            } else {
                Err(de::Error::custom("invalid number for u64"))
            }
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
            value.parse::<u64>().map_err(de::Error::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(LenientU64Visitor)
}

/// Keeps an explicit `null` distinct from an absent field.
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Base64 transport for raw bodies embedded in JSON payloads
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Format a byte count as a human readable label ("1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut index = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && index < UNITS.len() - 1 {
        value /= 1024.0;
        index += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[index])
}

/// Storage usage versus the account allowance
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuota {
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub used_bytes: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub limit_bytes: u64,
    #[serde(default)]
    pub percentage: f64,
}

impl StorageQuota {
    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        let percentage = if limit_bytes > 0 {
            ((used_bytes as f64 / limit_bytes as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            used_bytes,
            limit_bytes,
            percentage,
        }
    }

    /// Recompute the derived percentage when the server omitted it
    pub fn normalized(self) -> Self {
        if self.percentage == 0.0 && self.used_bytes > 0 {
            Self::new(self.used_bytes, self.limit_bytes)
        } else {
            self
        }
    }

    pub fn used_gb(&self) -> f64 {
        self.used_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    pub fn limit_gb(&self) -> f64 {
        self.limit_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Size as sent by the API: raw bytes or an already formatted label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeField {
    Bytes(u64),
    Label(String),
}

/// File record exactly as the storage API returns it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFileRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default, rename = "type")]
    pub file_type: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub size: Option<SizeField>,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub size_bytes: u64,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_starred: Option<bool>,
    #[serde(default)]
    pub is_archived: Option<bool>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub download_count: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub view_count: u64,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub shared_with: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub comments: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Normalized file record held by the file manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub file_name: Option<String>,
    #[serde(rename = "type")]
    pub file_type: Option<String>,
    pub content_type: Option<String>,
    pub description: Option<String>,
    /// Human readable size label
    #[serde(rename = "size")]
    pub size_label: String,
    pub size_bytes: u64,
    pub owner: String,
    pub is_starred: bool,
    pub is_archived: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub download_count: u64,
    pub view_count: u64,
    pub folder_id: Option<String>,
    pub version: u32,
    pub shared_with: Vec<serde_json::Value>,
    pub comments: Vec<serde_json::Value>,
    pub tags: Vec<String>,
    pub last_modified: DateTime<Utc>,
}

impl From<RawFileRecord> for FileRecord {
    fn from(raw: RawFileRecord) -> Self {
        let (size_label, size_bytes) = match raw.size {
            Some(SizeField::Bytes(bytes)) => (format_bytes(bytes), bytes),
            Some(SizeField::Label(label)) if !label.is_empty() => (label, raw.size_bytes),
            _ => (format_bytes(raw.size_bytes), raw.size_bytes),
        };

        let name = raw
            .name
            .filter(|n| !n.is_empty())
            .or_else(|| raw.file_name.clone())
            .unwrap_or_default();

        Self {
            id: raw.id,
            name,
            file_name: raw.file_name,
            file_type: raw.file_type,
            content_type: raw.content_type,
            description: raw.description,
            size_label,
            size_bytes,
            owner: raw.owner.or(raw.user_id).unwrap_or_default(),
            is_starred: raw.is_starred.unwrap_or(false),
            is_archived: raw.is_archived.unwrap_or(false),
            deleted_at: raw.deleted_at,
            download_count: raw.download_count,
            view_count: raw.view_count,
            folder_id: raw.folder_id.filter(|f| !f.is_empty()),
            version: raw.version.filter(|v| *v > 0).unwrap_or(1),
            shared_with: raw.shared_with.unwrap_or_default(),
            comments: raw.comments.unwrap_or_default(),
            tags: raw.tags.unwrap_or_default(),
            last_modified: raw
                .last_modified
                .or(raw.created_at)
                .or(raw.updated_at)
                .unwrap_or_else(Utc::now),
        }
    }
}

impl FileRecord {
    /// Soft-deleted records carry a deletion timestamp
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// File name used when saving a download locally
    pub fn download_name(&self) -> String {
        if let Some(file_name) = self.file_name.as_deref().filter(|f| !f.is_empty()) {
            return file_name.to_string();
        }
        let extension = self
            .content_type
            .as_deref()
            .and_then(|ct| ct.rsplit('/').next())
            .filter(|ext| !ext.is_empty())
            .unwrap_or("bin");
        format!("{}.{}", self.name, extension)
    }
}

/// Requested download format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadFormat {
    Pdf,
    Doc,
}

impl DownloadFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DownloadFormat::Pdf => "pdf",
            DownloadFormat::Doc => "doc",
        }
    }
}

/// Sort direction for listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Parameters of a file listing request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub include_deleted: bool,
    pub page: u32,
    pub page_size: u32,
    pub sort_by: String,
    pub sort_order: SortOrder,
    pub search: Option<String>,
    pub file_type: Option<String>,
    pub folder_id: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            include_deleted: false,
            page: 1,
            page_size: 20,
            sort_by: "createdAt".to_string(),
            sort_order: SortOrder::Desc,
            search: None,
            file_type: None,
            folder_id: None,
        }
    }
}

impl ListQuery {
    /// Query parameters ordered by name
    pub fn params(&self) -> BTreeMap<&'static str, String> {
        let mut params = BTreeMap::new();
        params.insert("includeDeleted", self.include_deleted.to_string());
        params.insert("page", self.page.to_string());
        params.insert("limit", self.page_size.to_string());
        params.insert("sortBy", self.sort_by.clone());
        params.insert("sortOrder", self.sort_order.as_str().to_string());
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            params.insert("search", search.to_string());
        }
        if let Some(file_type) = &self.file_type {
            params.insert("type", file_type.clone());
        }
        if let Some(folder_id) = &self.folder_id {
            params.insert("folderId", folder_id.clone());
        }
        params
    }
}

/// Pagination state of the current listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub page: u32,
    #[serde(default, alias = "limit")]
    pub page_size: u32,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub total: u64,
    #[serde(default)]
    pub total_pages: u32,
}

/// Response from the file listing endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesResponse {
    #[serde(default)]
    pub files: Vec<RawFileRecord>,
    #[serde(default)]
    pub storage: Option<StorageQuota>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

/// Multipart upload request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    pub display_name: Option<String>,
    pub file_type: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub folder_id: Option<String>,
}

/// Response carrying a single file (upload, duplicate)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    #[serde(default)]
    pub file: Option<RawFileRecord>,
    #[serde(default)]
    pub storage: Option<StorageQuota>,
}

/// Response from update, delete, restore and permanent delete
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub storage: Option<StorageQuota>,
}

/// Sparse metadata update; only `Some` fields are sent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_starred: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
    /// `Some(None)` moves the file to the root folder
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub folder_id: Option<Option<String>>,
}

impl FileUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.file_type.is_none()
            && self.description.is_none()
            && self.is_starred.is_none()
            && self.is_archived.is_none()
            && self.folder_id.is_none()
    }

    /// Merge the defined fields into a record
    pub fn apply_to(&self, record: &mut FileRecord) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(file_type) = &self.file_type {
            record.file_type = Some(file_type.clone());
        }
        if let Some(description) = &self.description {
            record.description = Some(description.clone());
        }
        if let Some(starred) = self.is_starred {
            record.is_starred = starred;
        }
        if let Some(archived) = self.is_archived {
            record.is_archived = archived;
        }
        if let Some(folder_id) = &self.folder_id {
            record.folder_id = folder_id.clone();
        }
    }
}

/// Per-file outcome of a bulk operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
    #[serde(alias = "id")]
    pub file_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn success(file_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            success: true,
            error: None,
        }
    }

    pub fn failure(file_id: &str, error: impl Into<String>) -> Self {
        Self {
            file_id: file_id.to_string(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Response from the bulk delete endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteResponse {
    #[serde(default)]
    pub results: Vec<BulkItemResult>,
    #[serde(default)]
    pub deleted_count: u64,
    #[serde(default)]
    pub storage: Option<StorageQuota>,
}

/// Response from the bulk restore endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRestoreResponse {
    #[serde(default)]
    pub restored_count: u64,
}

/// Response from the move endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Access level granted when sharing a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharePermission {
    #[default]
    View,
    Comment,
    Edit,
}

/// Share a file with another user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    pub user_email: String,
    pub permission: SharePermission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Usage statistics of a single file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    #[serde(default)]
    pub file_id: String,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub download_count: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub view_count: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    pub share_count: u64,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// One entry of a file's activity / access log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    #[serde(default)]
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}
