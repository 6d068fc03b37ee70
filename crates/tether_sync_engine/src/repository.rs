//! Offline-first repository.
//!
//! The application-facing API. Every call reads and writes the local store
//! and returns without touching the network; each mutation is paired with
//! a queued operation that the [`SyncService`](crate::SyncService) sends
//! later.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    Clock, EntityRecord, EntityStore, LocalId, Mutation, OperationQueue, OperationType, RemoteId,
    SyncOperation, SyncStatus, SystemClock,
};
use tracing::{debug, warn};

/// A domain object together with its sync metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity<T> {
    /// Local identifier.
    pub local_id: LocalId,
    /// Remote identifier, once the remote has acknowledged the entity.
    pub remote_id: Option<RemoteId>,
    /// Sync state.
    pub sync_status: SyncStatus,
    /// Time of the most recent local mutation.
    pub updated_at: DateTime<Utc>,
    /// Local edit counter.
    pub version: u64,
    /// The domain object.
    pub data: T,
}

impl<T: DeserializeOwned> Entity<T> {
    fn from_record(record: EntityRecord) -> SyncResult<Self> {
        Ok(Self {
            data: serde_json::from_value(record.payload)?,
            local_id: record.local_id,
            remote_id: record.remote_id,
            sync_status: record.sync_status,
            updated_at: record.local_updated_at,
            version: record.version,
        })
    }
}

impl<T> Entity<T> {
    /// Returns true if the remote has seen every local change.
    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced
    }
}

type Visibility = Box<dyn Fn(&EntityRecord) -> bool + Send>;

/// Live view of one entity type.
///
/// Each update is the full set of visible entities after a store write.
pub struct EntityWatch<T> {
    receiver: Receiver<Vec<EntityRecord>>,
    visible: Visibility,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> EntityWatch<T> {
    /// Blocks until the next snapshot. Returns `None` once the store is gone.
    pub fn recv(&self) -> SyncResult<Option<Vec<Entity<T>>>> {
        match self.receiver.recv() {
            Ok(records) => self.decode(records).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Waits up to `timeout` for the next snapshot.
    pub fn recv_timeout(&self, timeout: Duration) -> SyncResult<Option<Vec<Entity<T>>>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(records) => self.decode(records).map(Some),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Returns the most recent pending snapshot without blocking, skipping
    /// older ones.
    pub fn latest(&self) -> SyncResult<Option<Vec<Entity<T>>>> {
        let mut latest = None;
        loop {
            match self.receiver.try_recv() {
                Ok(records) => latest = Some(records),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        latest.map(|records| self.decode(records)).transpose()
    }

    fn decode(&self, records: Vec<EntityRecord>) -> SyncResult<Vec<Entity<T>>> {
        records
            .into_iter()
            .filter(|r| (self.visible)(r))
            .map(Entity::from_record)
            .collect()
    }
}

/// Typed, offline-first access to one entity type.
///
/// Deleted entities disappear from reads immediately, even while the
/// deletion is still waiting to be sent.
pub struct OfflineRepository<T, S, Q> {
    entity_type: String,
    store: Arc<S>,
    queue: Arc<Q>,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S, Q> OfflineRepository<T, S, Q>
where
    T: Serialize + DeserializeOwned,
    S: EntityStore,
    Q: OperationQueue + 'static,
{
    /// Creates a repository for `entity_type` over a store and a queue.
    pub fn new(entity_type: impl Into<String>, store: Arc<S>, queue: Arc<Q>) -> Self {
        Self {
            entity_type: entity_type.into(),
            store,
            queue,
            clock: Arc::new(SystemClock),
            _marker: PhantomData,
        }
    }

    /// Sets the clock used for mutation timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Creates an entity locally and queues its creation.
    pub fn create(&self, data: T) -> SyncResult<Entity<T>> {
        let payload = serde_json::to_value(&data)?;
        let now = self.clock.now();
        let record = EntityRecord::new_local(self.entity_type.clone(), payload, now);
        let local_id = record.local_id;

        self.store.save(record.clone())?;
        if let Err(e) = self
            .queue
            .enqueue(SyncOperation::for_record(OperationType::Create, &record, now))
        {
            self.undo(local_id, None);
            return Err(e.into());
        }

        debug!(%local_id, entity_type = %self.entity_type, "created");
        Ok(Entity {
            local_id,
            remote_id: None,
            sync_status: SyncStatus::PendingCreate,
            updated_at: now,
            version: record.version,
            data,
        })
    }

    /// Replaces an entity's data and queues the update.
    pub fn update(&self, local_id: LocalId, data: T) -> SyncResult<Entity<T>> {
        let payload = serde_json::to_value(&data)?;
        let now = self.clock.now();
        let mut previous = None;

        let updated = self.store.modify(local_id, &mut |rec| {
            if !self.owns(rec) || rec.sync_status == SyncStatus::PendingDelete {
                return Mutation::Unchanged;
            }
            previous = Some(rec.clone());
            let mut next = rec.clone();
            next.payload = payload.clone();
            next.version += 1;
            next.local_updated_at = now;
            if rec.sync_status == SyncStatus::Synced {
                next.sync_status = SyncStatus::PendingUpdate;
            }
            Mutation::Save(next)
        })?;

        let (Some(record), Some(previous)) = (updated, previous) else {
            return Err(SyncError::EntityNotFound(local_id));
        };
        if let Err(e) = self
            .queue
            .enqueue(SyncOperation::for_record(OperationType::Update, &record, now))
        {
            self.undo(local_id, Some(previous));
            return Err(e.into());
        }

        debug!(%local_id, version = record.version, "updated");
        Ok(Entity {
            data,
            local_id,
            remote_id: record.remote_id,
            sync_status: record.sync_status,
            updated_at: record.local_updated_at,
            version: record.version,
        })
    }

    /// Deletes an entity.
    ///
    /// An entity the remote never acknowledged is removed together with its
    /// queued operations. Otherwise the record is kept, hidden, until the
    /// remote confirms the deletion.
    pub fn delete(&self, local_id: LocalId) -> SyncResult<()> {
        let now = self.clock.now();
        let mut previous = None;
        // Decided under the store lock: a sync pass may attach the remote id
        // at any moment before it.
        let deleted = self.store.modify(local_id, &mut |rec| {
            if !self.owns(rec) || rec.sync_status == SyncStatus::PendingDelete {
                return Mutation::Unchanged;
            }
            previous = Some(rec.clone());
            if rec.remote_id.is_none() {
                return Mutation::Delete;
            }
            let mut next = rec.clone();
            next.sync_status = SyncStatus::PendingDelete;
            next.conflict = None;
            next.version += 1;
            next.local_updated_at = now;
            Mutation::Save(next)
        })?;

        let Some(previous) = previous else {
            return Err(SyncError::EntityNotFound(local_id));
        };
        let Some(record) = deleted else {
            // A create still in flight is undone when its ack arrives.
            let dropped = self.queue.remove_for_entity(local_id)?;
            debug!(%local_id, dropped, "deleted before first sync");
            return Ok(());
        };
        if let Err(e) = self
            .queue
            .enqueue(SyncOperation::for_record(OperationType::Delete, &record, now))
        {
            self.undo(local_id, Some(previous));
            return Err(e.into());
        }

        debug!(%local_id, "deleted");
        Ok(())
    }

    /// Returns every visible entity, oldest change first.
    pub fn get_all(&self) -> SyncResult<Vec<Entity<T>>> {
        let visible = self.visibility();
        self.store
            .get_all_of_type(&self.entity_type)?
            .into_iter()
            .filter(|r| visible(r))
            .map(Entity::from_record)
            .collect()
    }

    /// Returns one visible entity.
    pub fn get_by_id(&self, local_id: LocalId) -> SyncResult<Option<Entity<T>>> {
        let visible = self.visibility();
        self.store
            .get(local_id)?
            .filter(|r| self.owns(r) && visible(r))
            .map(Entity::from_record)
            .transpose()
    }

    /// Returns the diverging remote data of an entity in conflict.
    ///
    /// `None` if there is no conflict or the remote side deleted the entity.
    pub fn conflicting_remote(&self, local_id: LocalId) -> SyncResult<Option<T>> {
        let Some(record) = self.store.get(local_id)?.filter(|r| self.owns(r)) else {
            return Err(SyncError::EntityNotFound(local_id));
        };
        record
            .conflict
            .filter(|remote| !remote.deleted)
            .map(|remote| serde_json::from_value(remote.payload).map_err(SyncError::from))
            .transpose()
    }

    /// Subscribes to the visible entities of this type.
    ///
    /// The first snapshot is available immediately.
    pub fn watch(&self) -> EntityWatch<T> {
        EntityWatch {
            receiver: self.store.subscribe(Some(&self.entity_type)),
            visible: self.visibility(),
            _marker: PhantomData,
        }
    }

    fn owns(&self, record: &EntityRecord) -> bool {
        record.entity_type == self.entity_type
    }

    /// Hides pending deletions, including ones whose delete operation failed.
    fn visibility(&self) -> Visibility {
        let queue = Arc::clone(&self.queue);
        Box::new(move |record: &EntityRecord| match record.sync_status {
            SyncStatus::PendingDelete => false,
            SyncStatus::SyncFailed => !queue
                .for_entity(record.local_id)
                .map(|ops| ops.iter().any(|op| op.op_type == OperationType::Delete))
                .unwrap_or(false),
            _ => true,
        })
    }

    /// Restores the record after its operation could not be queued.
    fn undo(&self, local_id: LocalId, previous: Option<EntityRecord>) {
        let restored = match previous {
            Some(record) => self.store.save(record),
            None => self.store.delete(local_id).map(|_| ()),
        };
        if let Err(e) = restored {
            warn!(%local_id, error = %e, "failed to roll back local write");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tether_core::{ManualClock, MemoryEntityStore, MemoryQueue};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
    }

    fn note(title: &str) -> Note {
        Note {
            title: title.to_string(),
        }
    }

    type Notes = OfflineRepository<Note, MemoryEntityStore, MemoryQueue>;

    fn repo() -> (Notes, Arc<MemoryEntityStore>, Arc<MemoryQueue>) {
        let store = Arc::new(MemoryEntityStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let repo = OfflineRepository::new("notes", Arc::clone(&store), Arc::clone(&queue))
            .with_clock(Arc::new(ManualClock::default()));
        (repo, store, queue)
    }

    #[test]
    fn create_is_local_and_queued() {
        let (notes, _, queue) = repo();
        let created = notes.create(note("x")).unwrap();

        assert_eq!(created.sync_status, SyncStatus::PendingCreate);
        assert_eq!(created.version, 1);
        assert!(created.remote_id.is_none());

        let ops = queue.pending().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OperationType::Create);
        assert_eq!(ops[0].payload["title"], "x");
        assert_eq!(notes.get_by_id(created.local_id).unwrap().unwrap().data, note("x"));
    }

    #[test]
    fn update_bumps_version_and_keeps_pending_create() {
        let (notes, _, queue) = repo();
        let created = notes.create(note("x")).unwrap();
        let updated = notes.update(created.local_id, note("y")).unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.sync_status, SyncStatus::PendingCreate);
        let kinds: Vec<_> = queue.pending().unwrap().iter().map(|op| op.op_type).collect();
        assert_eq!(kinds, vec![OperationType::Create, OperationType::Update]);
    }

    #[test]
    fn update_unknown_entity_fails() {
        let (notes, _, _) = repo();
        let id = LocalId::new();
        assert!(matches!(
            notes.update(id, note("x")),
            Err(SyncError::EntityNotFound(missing)) if missing == id
        ));
    }

    #[test]
    fn delete_before_sync_leaves_nothing() {
        let (notes, store, queue) = repo();
        let created = notes.create(note("x")).unwrap();
        notes.update(created.local_id, note("y")).unwrap();

        notes.delete(created.local_id).unwrap();
        assert!(store.get(created.local_id).unwrap().is_none());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn delete_of_synced_entity_hides_it() {
        let (notes, store, queue) = repo();
        let created = notes.create(note("x")).unwrap();
        store
            .modify(created.local_id, &mut |rec| {
                let mut next = rec.clone();
                next.remote_id = Some(RemoteId::new("r-1"));
                next.sync_status = SyncStatus::Synced;
                Mutation::Save(next)
            })
            .unwrap();
        queue.remove_for_entity(created.local_id).unwrap();

        notes.delete(created.local_id).unwrap();

        assert!(notes.get_by_id(created.local_id).unwrap().is_none());
        assert!(notes.get_all().unwrap().is_empty());
        let record = store.get(created.local_id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::PendingDelete);
        assert_eq!(queue.pending().unwrap()[0].op_type, OperationType::Delete);

        assert!(matches!(
            notes.update(created.local_id, note("z")),
            Err(SyncError::EntityNotFound(_))
        ));
        assert!(matches!(notes.delete(created.local_id), Err(SyncError::EntityNotFound(_))));
    }

    #[test]
    fn other_types_are_invisible() {
        let (notes, store, queue) = repo();
        let tasks: OfflineRepository<Note, _, _> =
            OfflineRepository::new("tasks", Arc::clone(&store), Arc::clone(&queue));
        let task = tasks.create(note("task")).unwrap();
        notes.create(note("note")).unwrap();

        assert_eq!(notes.get_all().unwrap().len(), 1);
        assert!(notes.get_by_id(task.local_id).unwrap().is_none());
        assert!(matches!(notes.delete(task.local_id), Err(SyncError::EntityNotFound(_))));
    }

    #[test]
    fn watch_emits_visible_snapshots() {
        let (notes, _, _) = repo();
        let watch = notes.watch();
        assert_eq!(watch.latest().unwrap(), Some(Vec::new()));

        let created = notes.create(note("x")).unwrap();
        notes.update(created.local_id, note("y")).unwrap();

        let latest = watch.latest().unwrap().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].data, note("y"));
        assert!(watch.latest().unwrap().is_none());
    }

    #[test]
    fn undecodable_payload_is_a_codec_error() {
        let (notes, store, _) = repo();
        let record = EntityRecord::new_local("notes", serde_json::json!({ "body": 1 }), Utc::now());
        let local_id = record.local_id;
        store.save(record).unwrap();

        assert!(matches!(notes.get_by_id(local_id), Err(SyncError::Codec(_))));
    }
}
