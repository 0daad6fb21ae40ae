//! Storage API Error Types
//!
//! Structured error handling for remote file operations.
//! Maps HTTP status codes to specific error variants for retry and re-auth decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::StorageQuota;

/// Storage API error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Session expired, please sign in again")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Request timeout")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Storage quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        storage: Option<StorageQuota>,
    },

    #[error("Request error: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("File is empty or corrupted")]
    EmptyDownload,

    #[error("Request cancelled")]
    Cancelled,
}

/// Error body shape returned by the storage API
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    storage: Option<StorageQuota>,
}

impl ApiError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited
                | ApiError::Timeout
                | ApiError::Network(_)
                | ApiError::Server(_, _)
        )
    }

    /// Whether the caller must re-authenticate before retrying
    pub fn requires_reauth(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_) | ApiError::Forbidden(_))
    }

    /// Quota snapshot carried by the error, if any
    pub fn storage(&self) -> Option<&StorageQuota> {
        match self {
            ApiError::QuotaExceeded { storage, .. } => storage.as_ref(),
            _ => None,
        }
    }

    /// Create an ApiError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message
            .or(parsed.error)
            .unwrap_or_else(|| body.trim().to_string());

        if let Some(storage) = parsed.storage {
            return ApiError::QuotaExceeded {
                message,
                storage: Some(storage),
            };
        }

        match status {
            400 => ApiError::BadRequest(message),
            401 => ApiError::Unauthorized(message),
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            408 => ApiError::Timeout,
            413 | 507 => ApiError::QuotaExceeded {
                message,
                storage: None,
            },
            429 => ApiError::RateLimited,
            500..=599 => ApiError::Server(status, message),
            _ => ApiError::Request(format!("HTTP {}: {}", status, message)),
        }
    }

    /// Classify this error into the record shown by the UI
    pub fn classify(&self) -> OperationError {
        OperationError {
            message: self.to_string(),
            retryable: self.is_retryable(),
            occurred_at: Utc::now(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), &err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<crate::cache::StoreError> for ApiError {
    fn from(err: crate::cache::StoreError) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Storage(err.to_string())
    }
}

/// Classified failure recorded in the per-operation error map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub message: String,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}
