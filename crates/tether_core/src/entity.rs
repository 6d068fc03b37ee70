//! Entity records and their sync metadata.

use crate::types::{LocalId, RemoteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Where an entity record stands relative to the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Local state matches the last known remote state.
    Synced,
    /// Created locally, never acknowledged by the remote.
    PendingCreate,
    /// Edited locally since the last acknowledged remote state.
    PendingUpdate,
    /// Deleted locally; the record is kept until the remote confirms.
    PendingDelete,
    /// Automatic sync gave up (retry budget exhausted or permanent rejection).
    SyncFailed,
    /// Local and remote versions diverged and need a manual decision.
    Conflict,
}

impl SyncStatus {
    /// Returns true for the three `Pending*` states.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            SyncStatus::PendingCreate | SyncStatus::PendingUpdate | SyncStatus::PendingDelete
        )
    }

    /// Returns true if the record carries local changes the remote has not seen.
    #[must_use]
    pub fn has_local_changes(self) -> bool {
        self != SyncStatus::Synced
    }

    /// Returns true if the status needs a person to look at it.
    #[must_use]
    pub fn needs_attention(self) -> bool {
        matches!(self, SyncStatus::SyncFailed | SyncStatus::Conflict)
    }

    /// Returns a stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::PendingCreate => "pending_create",
            SyncStatus::PendingUpdate => "pending_update",
            SyncStatus::PendingDelete => "pending_delete",
            SyncStatus::SyncFailed => "sync_failed",
            SyncStatus::Conflict => "conflict",
        }
    }

    /// All statuses, in display order.
    pub const ALL: [SyncStatus; 6] = [
        SyncStatus::Synced,
        SyncStatus::PendingCreate,
        SyncStatus::PendingUpdate,
        SyncStatus::PendingDelete,
        SyncStatus::SyncFailed,
        SyncStatus::Conflict,
    ];
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One domain object as the remote authority knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    /// The authority's identifier.
    pub remote_id: RemoteId,
    /// Entity type (collection name).
    pub entity_type: String,
    /// Domain fields.
    pub payload: Value,
    /// Time of the last remote modification.
    pub updated_at: DateTime<Utc>,
    /// Local id the creating client sent as idempotency key, if the
    /// authority reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<LocalId>,
    /// The authority deleted the entity at `updated_at`; `payload` is null.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl RemoteEntity {
    /// Creates a remote entity.
    pub fn new(
        remote_id: impl Into<RemoteId>,
        entity_type: impl Into<String>,
        payload: Value,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            entity_type: entity_type.into(),
            payload,
            updated_at,
            origin: None,
            deleted: false,
        }
    }

    /// Creates the record of a remote deletion.
    pub fn tombstone(
        remote_id: impl Into<RemoteId>,
        entity_type: impl Into<String>,
        deleted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            deleted: true,
            ..Self::new(remote_id, entity_type, Value::Null, deleted_at)
        }
    }

    /// Sets the local id the entity was created under.
    #[must_use]
    pub fn with_origin(mut self, local_id: LocalId) -> Self {
        self.origin = Some(local_id);
        self
    }
}

/// The locally persisted state of one domain object plus its sync metadata.
///
/// # Invariants
///
/// - `local_id` never changes
/// - `remote_id == None` implies the status is `PendingCreate`, `SyncFailed`
///   or `Conflict`: an entity the remote never acknowledged cannot be
///   pending update or delete
/// - `conflict` is `Some` only while the status is `Conflict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Primary key for all local operations.
    pub local_id: LocalId,
    /// Entity type (collection name), used for transport routing and
    /// per-type conflict strategies.
    pub entity_type: String,
    /// The authority's identifier, once known.
    pub remote_id: Option<RemoteId>,
    /// Domain fields, opaque to the sync engine.
    pub payload: Value,
    /// Sync state.
    pub sync_status: SyncStatus,
    /// Time of the most recent local mutation.
    pub local_updated_at: DateTime<Utc>,
    /// Time of the last known remote state.
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// Local edit counter; bumped by every local write.
    pub version: u64,
    /// The diverging remote version while the status is `Conflict`.
    pub conflict: Option<RemoteEntity>,
}

impl EntityRecord {
    /// Creates a record for a local create.
    pub fn new_local(entity_type: impl Into<String>, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            local_id: LocalId::new(),
            entity_type: entity_type.into(),
            remote_id: None,
            payload,
            sync_status: SyncStatus::PendingCreate,
            local_updated_at: now,
            remote_updated_at: None,
            version: 1,
            conflict: None,
        }
    }

    /// Creates a synced record for an entity first seen through a pull.
    pub fn from_remote(remote: &RemoteEntity) -> Self {
        Self {
            local_id: LocalId::new(),
            entity_type: remote.entity_type.clone(),
            remote_id: Some(remote.remote_id.clone()),
            payload: remote.payload.clone(),
            sync_status: SyncStatus::Synced,
            local_updated_at: remote.updated_at,
            remote_updated_at: Some(remote.updated_at),
            version: 0,
            conflict: None,
        }
    }

    /// Overwrites the local state with the remote version and marks it synced.
    pub fn adopt_remote(&mut self, remote: &RemoteEntity) {
        self.remote_id = Some(remote.remote_id.clone());
        self.payload = remote.payload.clone();
        self.sync_status = SyncStatus::Synced;
        self.remote_updated_at = Some(remote.updated_at);
        self.conflict = None;
    }

    /// Returns true if the remote authority has acknowledged this entity.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Returns true if the record satisfies the remote-id invariant.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let remote_ok = self.remote_id.is_some()
            || matches!(
                self.sync_status,
                SyncStatus::PendingCreate | SyncStatus::SyncFailed | SyncStatus::Conflict
            );
        let conflict_ok = self.conflict.is_none() || self.sync_status == SyncStatus::Conflict;
        remote_ok && conflict_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_local_is_pending_create() {
        let record = EntityRecord::new_local("notes", json!({"title": "a"}), Utc::now());
        assert_eq!(record.sync_status, SyncStatus::PendingCreate);
        assert!(!record.has_remote());
        assert!(record.is_consistent());
    }

    #[test]
    fn from_remote_is_synced() {
        let remote = RemoteEntity::new("r-1", "notes", json!({"title": "b"}), Utc::now());
        let record = EntityRecord::from_remote(&remote);

        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.remote_id, Some(RemoteId::new("r-1")));
        assert_eq!(record.remote_updated_at, Some(remote.updated_at));
        assert!(record.is_consistent());
    }

    #[test]
    fn origin_is_optional_on_the_wire() {
        let remote = RemoteEntity::new("r-1", "notes", json!({}), Utc::now());
        let encoded = serde_json::to_value(&remote).unwrap();
        assert!(encoded.get("origin").is_none());
        assert_eq!(serde_json::from_value::<RemoteEntity>(encoded).unwrap(), remote);

        let local_id = LocalId::new();
        let created = remote.with_origin(local_id);
        let decoded: RemoteEntity =
            serde_json::from_value(serde_json::to_value(&created).unwrap()).unwrap();
        assert_eq!(decoded.origin, Some(local_id));
    }

    #[test]
    fn tombstone_carries_deletion_time() {
        let deleted_at = Utc::now();
        let tombstone = RemoteEntity::tombstone("r-1", "notes", deleted_at);
        assert!(tombstone.deleted);
        assert_eq!(tombstone.payload, Value::Null);
        assert_eq!(tombstone.updated_at, deleted_at);
        assert!(!RemoteEntity::new("r-1", "notes", json!({}), deleted_at).deleted);
    }

    #[test]
    fn pending_update_without_remote_is_inconsistent() {
        let mut record = EntityRecord::new_local("notes", json!({}), Utc::now());
        record.sync_status = SyncStatus::PendingUpdate;
        assert!(!record.is_consistent());
    }

    #[test]
    fn status_classification() {
        assert!(SyncStatus::PendingDelete.is_pending());
        assert!(!SyncStatus::SyncFailed.is_pending());
        assert!(SyncStatus::SyncFailed.has_local_changes());
        assert!(!SyncStatus::Synced.has_local_changes());
        assert!(SyncStatus::Conflict.needs_attention());
        assert_eq!(SyncStatus::PendingCreate.to_string(), "pending_create");
    }
}
