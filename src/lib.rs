//! Cloud file manager client
//!
//! Keeps a local, optimistically updated view of the files in a remote
//! storage account. Reads go through a TTL cache and a request
//! deduplicator; writes are applied locally first and rolled back if the
//! server rejects them, or queued while offline and replayed later.

pub mod api;
pub mod cache;
pub mod config;
pub mod files;
pub mod net;
pub mod queue;

pub use api::{ApiError, FileApi, FileRecord, HttpFileApi, OperationError, StorageQuota};
pub use config::ClientConfig;
pub use files::{FileManager, ManagerSettings, Outcome};
pub use net::Connectivity;
pub use queue::OfflineQueue;
