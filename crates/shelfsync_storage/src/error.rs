//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record in the middle of the log failed validation.
    #[error("record log corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Byte offset of the offending frame.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A payload does not fit in a single frame.
    #[error("record payload too large: {len} bytes")]
    PayloadTooLarge {
        /// Payload length in bytes.
        len: usize,
    },
}

impl StorageError {
    pub(crate) fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }
}
