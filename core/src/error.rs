use std::path::PathBuf;

use thiserror::Error;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Failures of the record store, snapshot engine, and merge import.
///
/// A failed operation leaves the store as it was before the call.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("{path} is not a heft store")]
    NotAStore { path: PathBuf },

    #[error("stored value for {column} is malformed: {value}")]
    Malformed { column: &'static str, value: String },

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

/// Failures of a sync cycle. All of them are recoverable: the next request retries.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync is disabled")]
    Disabled,

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("remote rejected sync: {0}")]
    Rejected(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures of a backup run, surfaced to the user as status text.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backups are disabled")]
    Disabled,

    #[error("no backup folder has been chosen")]
    NoFolder,

    #[error("backup folder is no longer available: {path}")]
    StaleFolder { path: PathBuf },

    #[error("access to backup folder denied: {path}")]
    AccessDenied { path: PathBuf },

    #[error("backup i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures of the CSV and JSON codecs.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required column: {0}")]
    MissingColumn(&'static str),

    #[error("row {line}: {reason}")]
    InvalidRow { line: usize, reason: String },

    #[error("unsupported export version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Io(std::io::Error::other(err))
    }
}
