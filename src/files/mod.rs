pub mod manager;
pub mod optimistic;
mod replay;
pub mod state;

pub use manager::{
    FileManager, FileManagerBuilder, FolderRefresh, ManagerSettings, MoveCallback, MoveOptions,
    Outcome, StorageCallback,
};
pub use optimistic::{optimistic, OptimisticUpdate};
pub use state::{FileAction, FileState, Snapshot};
