//! Error types for the sync engine.

use tether_core::{CoreError, LocalId, RemoteEntity};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for remote transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure reported by a remote transport call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The remote version diverged from the one the mutation assumed.
    #[error("conflict with remote version from {}", .0.updated_at)]
    Conflict(Box<RemoteEntity>),

    /// Transient failure (network, timeout, 5xx); worth retrying.
    #[error("retryable transport error: {0}")]
    Retryable(String),

    /// The remote resource does not exist (any more).
    #[error("remote resource not found: {0}")]
    NotFound(String),

    /// Permanent rejection (validation, authorization).
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Creates a conflict error carrying the server's version.
    pub fn conflict(remote: RemoteEntity) -> Self {
        Self::Conflict(Box::new(remote))
    }

    /// Creates a retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }

    /// Returns true if repeating the call cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::NotFound(_) | TransportError::Fatal(_))
    }
}

/// Errors surfaced by the sync service and the repository.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store or queue failure; the local write did not happen.
    #[error("local storage error: {0}")]
    Store(#[from] CoreError),

    /// Remote transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No visible entity with this id.
    #[error("entity not found: {0}")]
    EntityNotFound(LocalId),

    /// The entity is not in conflict, so there is nothing to resolve.
    #[error("entity {0} is not in conflict")]
    NotInConflict(LocalId),

    /// A payload could not be converted to or from the domain type.
    #[error("payload codec error: {0}")]
    Codec(String),

    /// The entity waits for a manual conflict decision.
    #[error("entity {0} needs manual conflict resolution")]
    UnresolvedConflict(LocalId),

    /// Automatic sync gave up on the entity.
    #[error("sync failed for entity {0}; retry it explicitly")]
    RetriesExhausted(LocalId),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn transport_classification() {
        assert!(TransportError::retryable("connection reset").is_retryable());
        assert!(!TransportError::retryable("x").is_permanent());
        assert!(TransportError::fatal("422").is_permanent());
        assert!(TransportError::NotFound("r-1".into()).is_permanent());

        let conflict = TransportError::conflict(RemoteEntity::new("r-1", "notes", json!({}), Utc::now()));
        assert!(!conflict.is_retryable());
        assert!(!conflict.is_permanent());
    }

    #[test]
    fn retryable_sync_errors() {
        assert!(!SyncError::RetriesExhausted(LocalId::new()).is_retryable());
        assert!(SyncError::from(TransportError::retryable("503")).is_retryable());
        assert!(!SyncError::from(TransportError::fatal("400")).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::from(TransportError::fatal("bad payload"));
        assert_eq!(err.to_string(), "fatal transport error: bad payload");
        assert_eq!(SyncError::Cancelled.to_string(), "sync cancelled");
    }
}
