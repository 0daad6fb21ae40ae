pub mod offline;

pub use offline::{
    DrainReport, FailedOperation, OfflineQueue, OperationExecutor, OperationKind, OperationStatus,
    QueuedOperation, MAX_RETRIES, QUEUE_STORAGE_KEY,
};
