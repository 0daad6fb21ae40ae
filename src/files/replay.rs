//! Replays queued offline operations against the storage API

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::manager::{FileManager, FileRef, MovePayload, SharePayload, UpdatePayload};
use super::state::FileAction;
use crate::api::{ApiError, FileRecord, UploadRequest};
use crate::queue::{OperationExecutor, OperationKind, QueuedOperation};

fn decode<T: DeserializeOwned>(operation: &QueuedOperation) -> Result<T, ApiError> {
    serde_json::from_value(operation.payload.clone()).map_err(|e| {
        ApiError::InvalidInput(format!("Malformed {} payload: {}", operation.kind, e))
    })
}

#[async_trait]
impl OperationExecutor for FileManager {
    async fn execute(&self, operation: &QueuedOperation) -> Result<(), ApiError> {
        debug!(operation_id = %operation.id, kind = %operation.kind, "Replaying queued operation");

        match operation.kind {
            OperationKind::Upload => {
                let request: UploadRequest = decode(operation)?;
                let response = self.api().upload_file(&request).await?;
                self.update_storage(response.storage);
                if let Some(file) = response.file {
                    self.dispatch(FileAction::Upsert(FileRecord::from(file)));
                }
            }
            OperationKind::Delete => {
                let payload: FileRef = decode(operation)?;
                let response = self.api().delete_file(&payload.file_id).await?;
                self.update_storage(response.storage);
            }
            OperationKind::Update => {
                let payload: UpdatePayload = decode(operation)?;
                let response = self
                    .api()
                    .update_file(&payload.file_id, &payload.update)
                    .await?;
                self.update_storage(response.storage);
            }
            OperationKind::Move => {
                let payload: MovePayload = decode(operation)?;
                let response = self
                    .api()
                    .move_file(&payload.file_id, payload.folder_id.as_deref())
                    .await?;
                if !response.success {
                    return Err(ApiError::Request(
                        response.error.unwrap_or_else(|| "Move failed".to_string()),
                    ));
                }
            }
            OperationKind::Share => {
                let payload: SharePayload = decode(operation)?;
                let response = self
                    .api()
                    .share_file(&payload.file_id, &payload.share)
                    .await?;
                self.update_storage(response.storage);
            }
        }
        Ok(())
    }
}
