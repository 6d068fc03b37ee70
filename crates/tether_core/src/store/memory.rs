//! Volatile entity store.

use super::table::{EntityTable, StoreChange};
use super::{EntityStore, Mutation};
use crate::change_feed::ChangeFeed;
use crate::entity::EntityRecord;
use crate::error::CoreResult;
use crate::types::{LocalId, RemoteId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::mpsc::Receiver;

/// An entity store held entirely in memory.
///
/// Also serves as the index of [`LogEntityStore`](super::LogEntityStore),
/// which persists each change before handing it to this table.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    table: RwLock<EntityTable>,
    feed: ChangeFeed,
}

impl MemoryEntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from replayed changes.
    pub(crate) fn from_changes(changes: impl IntoIterator<Item = StoreChange>) -> Self {
        let mut table = EntityTable::default();
        for change in changes {
            table.apply(change);
        }
        Self {
            table: RwLock::new(table),
            feed: ChangeFeed::new(),
        }
    }

    /// Plans a change against the current table, persists it, then applies it.
    ///
    /// The write lock is held throughout, so writes are totally ordered and
    /// a failed `persist` leaves the table untouched.
    pub(crate) fn write<R>(
        &self,
        plan: impl FnOnce(&EntityTable) -> (Option<StoreChange>, R),
        persist: impl FnOnce(&StoreChange) -> CoreResult<()>,
    ) -> CoreResult<R> {
        let mut table = self.table.write();
        let (change, result) = plan(&table);

        if let Some(change) = change {
            persist(&change)?;
            table.apply(change);
            if self.feed.has_subscribers() {
                self.feed.publish(&table.snapshot());
            }
        }
        Ok(result)
    }

    /// Runs `f` with writes excluded.
    pub(crate) fn exclusive<R>(&self, f: impl FnOnce(&EntityTable) -> R) -> R {
        let table = self.table.write();
        f(&table)
    }

    fn no_persist(_: &StoreChange) -> CoreResult<()> {
        Ok(())
    }
}

impl EntityStore for MemoryEntityStore {
    fn get(&self, local_id: LocalId) -> CoreResult<Option<EntityRecord>> {
        Ok(self.table.read().get(local_id).cloned())
    }

    fn get_by_remote_id(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
    ) -> CoreResult<Option<EntityRecord>> {
        Ok(self.table.read().find_remote(entity_type, remote_id).cloned())
    }

    fn get_all(&self) -> CoreResult<Vec<EntityRecord>> {
        Ok(self.table.read().snapshot())
    }

    fn save(&self, record: EntityRecord) -> CoreResult<()> {
        self.write(|_| (Some(StoreChange::Put(record)), ()), Self::no_persist)
    }

    fn delete(&self, local_id: LocalId) -> CoreResult<bool> {
        self.write(|table| table.plan_delete(local_id), Self::no_persist)
    }

    fn modify(
        &self,
        local_id: LocalId,
        f: &mut dyn FnMut(&EntityRecord) -> Mutation,
    ) -> CoreResult<Option<EntityRecord>> {
        self.write(|table| table.plan_modify(local_id, f), Self::no_persist)
    }

    fn subscribe(&self, entity_type: Option<&str>) -> Receiver<Vec<EntityRecord>> {
        // Read lock keeps a writer from publishing between snapshot and registration.
        let table = self.table.read();
        self.feed
            .subscribe(entity_type.map(str::to_string), &table.snapshot())
    }

    fn watermark(&self) -> CoreResult<Option<DateTime<Utc>>> {
        Ok(self.table.read().watermark())
    }

    fn set_watermark(&self, at: DateTime<Utc>) -> CoreResult<()> {
        self.write(|_| (Some(StoreChange::Watermark(at)), ()), Self::no_persist)
    }

    fn len(&self) -> CoreResult<usize> {
        Ok(self.table.read().len())
    }
}
