//! Error types for the sync model.

use crate::queue::QueueStatus;
use thiserror::Error;
use uuid::Uuid;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised by model operations and parsers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Unknown entity kind string.
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    /// Unknown queue operation string.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Unknown conflict policy string.
    #[error("unknown conflict policy: {0}")]
    UnknownPolicy(String),

    /// No queue item with this ID.
    #[error("queue item {0} not found")]
    ItemNotFound(Uuid),

    /// The queue item has already left the pending state.
    #[error("queue item {id} is {status:?}, not pending")]
    NotPending {
        /// Item ID.
        id: Uuid,
        /// Its current status.
        status: QueueStatus,
    },
}
