//! Bounded waits for network operations
//!
//! The losing branch is dropped, which aborts the underlying request.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::ApiError;

/// Await `future` for at most `limit`
///
/// Returns [`ApiError::Timeout`] when the deadline passes first and
/// [`ApiError::Cancelled`] when `cancel` fires first.
pub async fn with_timeout<F, T>(
    future: F,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Operation cancelled");
            Err(ApiError::Cancelled)
        }
        result = tokio::time::timeout(limit, future) => match result {
            Ok(result) => result,
            Err(_) => {
                debug!(limit_ms = limit.as_millis() as u64, "Operation timed out");
                Err(ApiError::Timeout)
            }
        },
    }
}
