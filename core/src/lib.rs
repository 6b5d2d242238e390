//! Storage, sync, and backup engine for the heft weight journal.

pub mod backup;
pub mod csv_import;
pub mod db;
pub mod error;
pub mod exchange;
pub mod merge;
pub mod models;
pub mod remote;
pub mod service;
pub mod snapshot;
pub mod state;
pub mod sync;

pub use backup::{
    BackupOutcome, BackupScheduler, BackupState, FolderAccess, FolderHandle, PathFolderAccess,
    ScopedFolder, SkipReason,
};
pub use db::{Database, PushReceipt, Record, SharedDatabase};
pub use error::{BackupError, ImportError, StorageError, StorageResult, SyncError};
pub use remote::{InMemoryReplica, LocalDirReplica};
pub use service::{HeftService, ServiceConfig};
pub use state::{AppState, BackupStatus, StateHub, SyncStatus};
pub use sync::{RemoteReplica, SyncCoordinator, SyncOutcome};
