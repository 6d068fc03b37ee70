//! Sync operations: queued intents to propagate one local mutation.

use crate::entity::EntityRecord;
use crate::types::{LocalId, OperationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Type of sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Entity was created locally.
    Create,
    /// Entity was updated locally.
    Update,
    /// Entity was deleted locally.
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        })
    }
}

/// A queued mutation awaiting transmission to the remote authority.
///
/// The payload is a snapshot taken when the mutation happened, so replaying
/// the operation later sends what the user wrote at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Queue-assigned ID; defines enqueue order. Zero until enqueued.
    pub id: OperationId,
    /// Mutation kind.
    pub op_type: OperationType,
    /// Entity type of the target record.
    pub entity_type: String,
    /// Local ID of the target record.
    pub entity_id: LocalId,
    /// Snapshot needed to replay the mutation (`Null` for deletes).
    pub payload: Value,
    /// Queue insertion time.
    pub created_at: DateTime<Utc>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Time of the most recent failed attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// The record's local version this operation snapshots.
    pub entity_version: u64,
    /// Remote version the mutation was made against; the transport uses it
    /// to detect that the remote moved on in the meantime.
    pub base_updated_at: Option<DateTime<Utc>>,
    /// Rejected permanently; never retried automatically.
    pub parked: bool,
}

impl SyncOperation {
    /// Creates an operation snapshotting `record` as it is now.
    pub fn for_record(op_type: OperationType, record: &EntityRecord, now: DateTime<Utc>) -> Self {
        let payload = match op_type {
            OperationType::Delete => Value::Null,
            OperationType::Create | OperationType::Update => record.payload.clone(),
        };

        Self {
            id: OperationId::default(),
            op_type,
            entity_type: record.entity_type.clone(),
            entity_id: record.local_id,
            payload,
            created_at: now,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
            entity_version: record.version,
            base_updated_at: record.remote_updated_at,
            parked: false,
        }
    }

    /// Returns true if the automatic retry budget is used up.
    #[must_use]
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Returns true if automatic sync may still attempt this operation.
    #[must_use]
    pub fn is_retryable(&self, max_retries: u32) -> bool {
        !self.parked && !self.is_exhausted(max_retries)
    }

    /// Returns true if the operation is eligible for stale pruning at `now`.
    #[must_use]
    pub fn is_stale(&self, max_age: chrono::Duration, max_retries: u32, now: DateTime<Utc>) -> bool {
        !self.is_retryable(max_retries) && now - self.created_at > max_age
    }
}
