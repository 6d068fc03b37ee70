//! Durable entity store over a record log.

use super::memory::MemoryEntityStore;
use super::table::StoreChange;
use super::{EntityStore, Mutation};
use crate::entity::EntityRecord;
use crate::error::CoreResult;
use crate::log::{LogOptions, RecordLog};
use crate::types::{LocalId, RemoteId};
use chrono::{DateTime, Utc};
use std::sync::mpsc::Receiver;
use tether_storage::StorageBackend;
use tracing::{debug, warn};

/// An entity store that survives process restarts.
///
/// Every change is appended to the log before it is applied to the in-memory
/// index, so a write is either durable and visible or neither. Opening the
/// store replays the log. Once the log holds far more frames than live
/// records it is rewritten to one frame per record.
pub struct LogEntityStore {
    index: MemoryEntityStore,
    log: RecordLog<StoreChange>,
}

impl LogEntityStore {
    /// Opens a store over `backend`, replaying any existing content.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted or cannot be read.
    pub fn open(backend: Box<dyn StorageBackend>, options: LogOptions) -> CoreResult<Self> {
        let (log, changes) = RecordLog::open(backend, options)?;
        let index = MemoryEntityStore::from_changes(changes);

        debug!(records = index.len()?, frames = log.frames(), "entity store opened");

        let store = Self { index, log };
        store.maybe_compact();
        Ok(store)
    }

    /// Returns the number of frames in the underlying log.
    pub fn log_frames(&self) -> usize {
        self.log.frames()
    }

    fn persist(&self, change: &StoreChange) -> CoreResult<()> {
        self.log.append(change)
    }

    /// Compaction failures are logged, never returned: the write that
    /// triggered them is already durable.
    fn maybe_compact(&self) {
        let result = self.index.exclusive(|table| {
            if self.log.should_compact(table.len() + 1) {
                self.log.rewrite(&table.checkpoint())
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            warn!(error = %e, "entity log compaction failed");
        }
    }

    fn committed<R>(&self, result: CoreResult<R>) -> CoreResult<R> {
        if result.is_ok() {
            self.maybe_compact();
        }
        result
    }
}

impl EntityStore for LogEntityStore {
    fn get(&self, local_id: LocalId) -> CoreResult<Option<EntityRecord>> {
        self.index.get(local_id)
    }

    fn get_by_remote_id(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
    ) -> CoreResult<Option<EntityRecord>> {
        self.index.get_by_remote_id(entity_type, remote_id)
    }

    fn get_all(&self) -> CoreResult<Vec<EntityRecord>> {
        self.index.get_all()
    }

    fn save(&self, record: EntityRecord) -> CoreResult<()> {
        let result = self
            .index
            .write(|_| (Some(StoreChange::Put(record)), ()), |c| self.persist(c));
        self.committed(result)
    }

    fn delete(&self, local_id: LocalId) -> CoreResult<bool> {
        let result = self
            .index
            .write(|table| table.plan_delete(local_id), |c| self.persist(c));
        self.committed(result)
    }

    fn modify(
        &self,
        local_id: LocalId,
        f: &mut dyn FnMut(&EntityRecord) -> Mutation,
    ) -> CoreResult<Option<EntityRecord>> {
        let result = self
            .index
            .write(|table| table.plan_modify(local_id, f), |c| self.persist(c));
        self.committed(result)
    }

    fn subscribe(&self, entity_type: Option<&str>) -> Receiver<Vec<EntityRecord>> {
        self.index.subscribe(entity_type)
    }

    fn watermark(&self) -> CoreResult<Option<DateTime<Utc>>> {
        self.index.watermark()
    }

    fn set_watermark(&self, at: DateTime<Utc>) -> CoreResult<()> {
        let result = self
            .index
            .write(|_| (Some(StoreChange::Watermark(at)), ()), |c| self.persist(c));
        self.committed(result)
    }

    fn len(&self) -> CoreResult<usize> {
        self.index.len()
    }

    fn compact(&self) -> CoreResult<()> {
        self.index
            .exclusive(|table| self.log.rewrite(&table.checkpoint()))
    }
}

impl std::fmt::Debug for LogEntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEntityStore")
            .field("frames", &self.log.frames())
            .finish_non_exhaustive()
    }
}
