//! Entity store: local keyed storage of entity records.
//!
//! All operations are local and never touch the network. Writes are
//! serialized per store; reads may run concurrently with each other.
//!
//! Two implementations are provided:
//!
//! - [`MemoryEntityStore`]: volatile, for tests and ephemeral data
//! - [`LogEntityStore`]: durable, every write is appended to a record log
//!   before it becomes visible

mod durable;
mod memory;
mod table;

pub use durable::LogEntityStore;
pub use memory::MemoryEntityStore;

use crate::entity::{EntityRecord, SyncStatus};
use crate::error::CoreResult;
use crate::types::{LocalId, RemoteId};
use chrono::{DateTime, Utc};
use std::sync::mpsc::Receiver;

/// Outcome of a read-modify-write step passed to [`EntityStore::modify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Leave the record as it is.
    Unchanged,
    /// Replace the record. Its `local_id` is forced to the modified id.
    Save(EntityRecord),
    /// Remove the record.
    Delete,
}

/// Local keyed storage of entity records plus the pull watermark.
pub trait EntityStore: Send + Sync {
    /// Returns the record with the given local id.
    fn get(&self, local_id: LocalId) -> CoreResult<Option<EntityRecord>>;

    /// Looks a record up by the remote authority's identifier.
    fn get_by_remote_id(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
    ) -> CoreResult<Option<EntityRecord>>;

    /// Returns every record, oldest local change first.
    fn get_all(&self) -> CoreResult<Vec<EntityRecord>>;

    /// Returns every record whose status is not `Synced`.
    fn get_pending(&self) -> CoreResult<Vec<EntityRecord>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|r| r.sync_status != SyncStatus::Synced)
            .collect())
    }

    /// Returns every record of one entity type.
    fn get_all_of_type(&self, entity_type: &str) -> CoreResult<Vec<EntityRecord>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|r| r.entity_type == entity_type)
            .collect())
    }

    /// Inserts or replaces a record, keyed by its local id.
    fn save(&self, record: EntityRecord) -> CoreResult<()>;

    /// Removes a record. Returns false if it did not exist.
    fn delete(&self, local_id: LocalId) -> CoreResult<bool>;

    /// Atomically reads, transforms and writes one record.
    ///
    /// `f` is not called if the record does not exist. No other write to the
    /// store can interleave between the read and the write. Returns the
    /// record as it is afterwards (`None` if absent or deleted).
    fn modify(
        &self,
        local_id: LocalId,
        f: &mut dyn FnMut(&EntityRecord) -> Mutation,
    ) -> CoreResult<Option<EntityRecord>>;

    /// Subscribes to record snapshots, optionally for one entity type.
    ///
    /// The receiver gets the current set immediately and a fresh snapshot
    /// after every mutation.
    fn subscribe(&self, entity_type: Option<&str>) -> Receiver<Vec<EntityRecord>>;

    /// Returns the persisted pull watermark.
    fn watermark(&self) -> CoreResult<Option<DateTime<Utc>>>;

    /// Persists the pull watermark.
    fn set_watermark(&self, at: DateTime<Utc>) -> CoreResult<()>;

    /// Returns the number of records.
    fn len(&self) -> CoreResult<usize>;

    /// Returns true if the store holds no records.
    fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Reclaims space held by superseded writes. A no-op for volatile stores.
    fn compact(&self) -> CoreResult<()> {
        Ok(())
    }
}
