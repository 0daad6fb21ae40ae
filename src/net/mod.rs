pub mod connectivity;
pub mod dedup;
pub mod timeout;

pub use connectivity::Connectivity;
pub use dedup::{generate_request_key, Deduplicator, DEFAULT_DEDUP_WINDOW};
pub use timeout::with_timeout;
