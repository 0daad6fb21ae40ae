//! Local caching layer
//!
//! Durable key/value storage, a TTL cache of API payloads on top of it,
//! and a disk cache of downloaded file bodies for offline access.

pub mod file_cache;
pub mod store;
pub mod ttl;

pub use file_cache::FileCache;
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, StoreError};
pub use ttl::TtlCache;
