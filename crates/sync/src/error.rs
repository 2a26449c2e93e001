//! Error types of the sync engine, one enum per layer.

use mercato_core::DomainError;
use thiserror::Error;

use crate::types::RecordRef;

/// Failure of the local mirror. Any transaction that yields one is rolled back.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to open mirror: {0:#}")]
    Open(anyhow::Error),

    #[error("corrupt mirror row: {0}")]
    Corrupt(String),

    #[error("invalid record: {0}")]
    Invalid(#[from] DomainError),

    #[error("record not found: {0}")]
    NotFound(RecordRef),

    #[error("record already exists: {0}")]
    Duplicate(RecordRef),

    #[error("record {0} is not in conflict")]
    NotInConflict(RecordRef),

    #[error("mirror schema version {found} is not supported (supported {min}..={current}); rebuild required")]
    RebuildRequired { found: i64, min: i64, current: i64 },

    #[error("{0} unsynced local change(s) must be pushed before clearing the mirror")]
    UnsyncedChanges(u64),
}

/// Failure reported by the remote store for a single call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network, timeout or server-side hiccup; safe to retry later.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The server refused the write (validation, foreign key, ...).
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Failure surfaced by a repository call.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Invalid(#[from] DomainError),
}

/// Failure of a whole sync session (per-record failures live in the session).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote store is unreachable")]
    Offline,

    #[error("a sync session is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("sync task failed: {0}")]
    Task(String),
}

/// Invalid or missing configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}
