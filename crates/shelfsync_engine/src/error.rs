//! Error types for the sync engine.

use shelfsync_model::ModelError;
use shelfsync_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Invalid or missing configuration. Raised before any sync work.
    #[error("configuration error: {0}")]
    Config(String),

    /// The remote asked us to slow down.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Server-requested delay.
        retry_after: Duration,
    },

    /// Remote failure that may succeed on retry.
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// Remote rejected the request; retrying will not help.
    #[error("remote error: {0}")]
    FatalRemote(String),

    /// Record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A local entity with this ID already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Local store or journal failure.
    #[error("local storage error: {0}")]
    LocalStorage(String),

    /// Remote payload could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Queue bookkeeping error.
    #[error("queue error: {0}")]
    Queue(#[from] ModelError),

    /// The run was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Creates a local storage error from anything displayable.
    pub fn local(err: impl std::fmt::Display) -> Self {
        Self::LocalStorage(err.to_string())
    }

    /// Returns true if this error can be retried inside a run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. } | SyncError::TransientRemote(_)
        )
    }

    /// Returns true if this error must stop the whole run.
    ///
    /// Everything else is recorded against the item being processed.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_)
                | SyncError::LocalStorage(_)
                | SyncError::Queue(_)
                | SyncError::Cancelled
                | SyncError::InvalidStateTransition { .. }
        )
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::LocalStorage(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::LocalStorage(err.to_string())
    }
}
