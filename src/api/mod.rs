//! Remote file storage API

pub mod client;
pub mod errors;
pub mod types;

pub use client::{FileApi, HttpFileApi};
pub use errors::{ApiError, OperationError};
pub use types::*;
