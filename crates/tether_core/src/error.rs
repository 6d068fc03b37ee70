//! Error types for Tether core.

use crate::types::{LocalId, OperationId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the local entity store and operation queue.
///
/// Every variant means the local write did not happen; callers must surface
/// it rather than assume the mutation was recorded.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tether_storage::StorageError),

    /// I/O error outside a storage backend (directory handling, lock file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A log frame could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// A record log is damaged before its tail.
    #[error("log corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the offending frame.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Entity not found in the store.
    #[error("entity not found: {0}")]
    EntityNotFound(LocalId),

    /// Operation not found in the queue.
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    /// Another process holds the data directory.
    #[error("data directory locked: another process has exclusive access")]
    Locked,

    /// Invalid data directory layout.
    #[error("invalid data directory: {message}")]
    InvalidDirectory {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid directory error.
    pub fn invalid_directory(message: impl Into<String>) -> Self {
        Self::InvalidDirectory {
            message: message.into(),
        }
    }
}
