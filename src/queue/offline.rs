//! Offline Operation Queue
//!
//! Durable FIFO of mutations recorded while disconnected. The whole queue is
//! written back to the key/value store after every change so a restart never
//! loses pending work. Draining replays operations in enqueue order through
//! an [`OperationExecutor`] once connectivity returns.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::ApiError;
use crate::cache::{KeyValueStore, StoreError};
use crate::net::Connectivity;

/// Storage key of the persisted queue
pub const QUEUE_STORAGE_KEY: &str = "cloudfiles_offline_queue";

/// Attempts before an operation is dropped as permanently failed
pub const MAX_RETRIES: u32 = 3;

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Upload,
    Delete,
    Share,
    Update,
    Move,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Upload => "upload",
            OperationKind::Delete => "delete",
            OperationKind::Share => "share",
            OperationKind::Update => "update",
            OperationKind::Move => "move",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a queued operation
///
/// Completed and permanently failed operations are removed from the queue,
/// so only these two states are ever persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Pending,
    Processing,
}

/// A mutation waiting for connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub status: OperationStatus,
}

/// Replays queued operations against the remote API
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &QueuedOperation) -> Result<(), ApiError>;
}

/// An operation dropped after exhausting its retries
#[derive(Debug, Clone)]
pub struct FailedOperation {
    pub operation: QueuedOperation,
    pub error: ApiError,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Another drain was running or the client was offline
    pub skipped: bool,
    /// Connectivity dropped mid-drain
    pub interrupted: bool,
    pub completed: Vec<Uuid>,
    pub failed: Vec<FailedOperation>,
    /// Operations that failed and went back to pending
    pub retrying: usize,
    /// Operations still queued after the pass
    pub remaining: usize,
}

/// Resets the drain flag however the drain exits
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    operations: Mutex<Vec<QueuedOperation>>,
    draining: AtomicBool,
    connectivity: Connectivity,
    max_retries: u32,
}

impl OfflineQueue {
    /// Load the persisted queue
    ///
    /// Operations interrupted mid-processing by a crash return to pending.
    pub fn load(store: Arc<dyn KeyValueStore>, connectivity: Connectivity, max_retries: u32) -> Self {
        let mut operations: Vec<QueuedOperation> = match store.get(QUEUE_STORAGE_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Persisted offline queue is corrupt, starting empty");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read offline queue, starting empty");
                Vec::new()
            }
        };

        for operation in operations.iter_mut() {
            operation.status = OperationStatus::Pending;
        }

        if !operations.is_empty() {
            info!(pending = operations.len(), "Loaded offline queue");
        }

        Self {
            store,
            operations: Mutex::new(operations),
            draining: AtomicBool::new(false),
            connectivity,
            max_retries: max_retries.max(1),
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    fn persist(&self, operations: &[QueuedOperation]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(operations)?;
        self.store.set(QUEUE_STORAGE_KEY, &raw)
    }

    fn persist_best_effort(&self, operations: &[QueuedOperation]) {
        if let Err(e) = self.persist(operations) {
            error!(error = %e, "Failed to persist offline queue");
        }
    }

    /// Append an operation and persist the queue
    ///
    /// The operation is not kept when it cannot be persisted.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let operation = QueuedOperation {
            id: Uuid::new_v4(),
            kind,
            payload,
            created_at: Utc::now(),
            retries: 0,
            status: OperationStatus::Pending,
        };
        let id = operation.id;

        let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        operations.push(operation);
        if let Err(e) = self.persist(&operations) {
            operations.pop();
            return Err(e);
        }

        info!(operation_id = %id, kind = %kind, queued = operations.len(), "Queued offline operation");
        Ok(id)
    }

    /// Snapshot of queued operations in FIFO order
    pub fn pending(&self) -> Vec<QueuedOperation> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replay every queued operation once, in enqueue order
    ///
    /// Only one drain runs at a time. The pass stops as soon as connectivity
    /// drops, leaving the rest pending. A failed operation goes back to
    /// pending until it has failed `max_retries` times, then it is removed.
    pub async fn drain(&self, executor: &dyn OperationExecutor) -> DrainReport {
        if !self.connectivity.is_online() {
            debug!("Offline, not draining queue");
            return DrainReport {
                skipped: true,
                remaining: self.len(),
                ..Default::default()
            };
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress");
            return DrainReport {
                skipped: true,
                remaining: self.len(),
                ..Default::default()
            };
        }
        let _guard = DrainGuard(&self.draining);

        let ids: Vec<Uuid> = self.pending().iter().map(|op| op.id).collect();
        let mut report = DrainReport::default();
        info!(queued = ids.len(), "Draining offline queue");

        for id in ids {
            if !self.connectivity.is_online() {
                warn!("Connectivity lost, stopping drain");
                report.interrupted = true;
                break;
            }

            let operation = {
                let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(operation) = operations.iter_mut().find(|op| op.id == id) else {
                    continue;
                };
                operation.status = OperationStatus::Processing;
                let snapshot = operation.clone();
                self.persist_best_effort(&operations);
                snapshot
            };

            let result = executor.execute(&operation).await;

            let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(index) = operations.iter().position(|op| op.id == id) else {
                continue;
            };

            match result {
                Ok(()) => {
                    operations.remove(index);
                    debug!(operation_id = %id, kind = %operation.kind, "Queued operation completed");
                    report.completed.push(id);
                }
                Err(e) => {
                    let entry = &mut operations[index];
                    entry.retries += 1;
                    if entry.retries >= self.max_retries {
                        let dropped = operations.remove(index);
                        error!(
                            operation_id = %id,
                            kind = %dropped.kind,
                            retries = dropped.retries,
                            error = %e,
                            "Queued operation failed permanently"
                        );
                        report.failed.push(FailedOperation {
                            operation: dropped,
                            error: e,
                        });
                    } else {
                        entry.status = OperationStatus::Pending;
                        warn!(
                            operation_id = %id,
                            kind = %entry.kind,
                            retries = entry.retries,
                            error = %e,
                            "Queued operation failed, will retry"
                        );
                        report.retrying += 1;
                    }
                }
            }
            self.persist_best_effort(&operations);
        }

        {
            let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
            for operation in operations.iter_mut() {
                operation.status = OperationStatus::Pending;
            }
            report.remaining = operations.len();
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            remaining = report.remaining,
            "Offline queue drain finished"
        );
        report
    }

    /// Drain on every offline to online transition
    ///
    /// While failed operations remain, the queue is drained again after each
    /// delay in `backoff`.
    pub fn spawn_auto_drain(
        self: Arc<Self>,
        executor: Arc<dyn OperationExecutor>,
        backoff: Vec<Duration>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut online = self.connectivity.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if !*online.borrow_and_update() {
                    continue;
                }

                let mut report = self.drain(executor.as_ref()).await;
                for delay in &backoff {
                    if report.remaining == 0 || report.interrupted || !self.connectivity.is_online() {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(*delay) => {}
                    }
                    report = self.drain(executor.as_ref()).await;
                }
            }
            debug!("Offline queue auto-drain stopped");
        })
    }
}
