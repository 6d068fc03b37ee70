//! Remote transport contract and an in-memory implementation.

use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Clock, LocalId, RemoteEntity, RemoteId, SystemClock};

/// Acknowledgement of a successful create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    /// The authority's identifier of the entity.
    pub remote_id: RemoteId,
    /// The remote modification time after the write.
    pub updated_at: DateTime<Utc>,
}

/// A remote deletion reported by a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTombstone {
    /// Entity type of the deleted entity.
    pub entity_type: String,
    /// The authority's identifier of the deleted entity.
    pub remote_id: RemoteId,
    /// Time of the deletion.
    pub deleted_at: DateTime<Utc>,
}

impl RemoteTombstone {
    /// Returns the deletion as a remote version of the entity.
    pub fn to_remote(&self) -> RemoteEntity {
        RemoteEntity::tombstone(self.remote_id.clone(), self.entity_type.clone(), self.deleted_at)
    }
}

/// The remote authority, as seen by the sync service.
///
/// Every call may fail with [`TransportError`]; a `Conflict` carries the
/// server's current version. Implementations must treat the `local_id`
/// passed to [`create`](RemoteTransport::create) as an idempotency key: a
/// repeated create for the same local id returns the original result.
/// Pulled entities should carry that local id as
/// [`RemoteEntity::origin`], so a client whose create acknowledgement was
/// lost recognises the entity as its own.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Creates an entity remotely.
    async fn create(
        &self,
        entity_type: &str,
        local_id: LocalId,
        payload: &Value,
    ) -> TransportResult<RemoteAck>;

    /// Updates an entity. `base` is the remote version the change was made
    /// against; a different current version is a conflict.
    async fn update(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
        payload: &Value,
        base: Option<DateTime<Utc>>,
    ) -> TransportResult<RemoteAck>;

    /// Deletes an entity. `base` has the same meaning as for updates.
    async fn delete(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
        base: Option<DateTime<Utc>>,
    ) -> TransportResult<()>;

    /// Returns entities modified after `since` (all if `None`).
    async fn get_changes_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> TransportResult<Vec<RemoteEntity>>;

    /// Returns entities deleted after `since` (all if `None`).
    async fn get_deleted_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> TransportResult<Vec<RemoteTombstone>>;
}

/// One call received by a [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `create` for the given local id.
    Create {
        /// Entity type.
        entity_type: String,
        /// Local id used as idempotency key.
        local_id: LocalId,
    },
    /// `update` of the given remote id.
    Update {
        /// Entity type.
        entity_type: String,
        /// Target remote id.
        remote_id: RemoteId,
    },
    /// `delete` of the given remote id.
    Delete {
        /// Entity type.
        entity_type: String,
        /// Target remote id.
        remote_id: RemoteId,
    },
    /// `get_changes_since`.
    GetChanges,
    /// `get_deleted_since`.
    GetDeleted,
}

impl TransportCall {
    /// Returns true for calls that push a mutation.
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            TransportCall::Create { .. } | TransportCall::Update { .. } | TransportCall::Delete { .. }
        )
    }
}

#[derive(Default)]
struct MockRemote {
    entities: HashMap<(String, RemoteId), RemoteEntity>,
    created: HashMap<LocalId, RemoteAck>,
    tombstones: Vec<RemoteTombstone>,
    failures: VecDeque<TransportError>,
    calls: Vec<TransportCall>,
    next_id: u64,
}

impl MockRemote {
    fn allocate_id(&mut self) -> RemoteId {
        self.next_id += 1;
        RemoteId::new(format!("r-{}", self.next_id))
    }
}

/// In-memory remote authority for tests.
///
/// Detects conflicts by comparing the `base` of updates and deletes with
/// the stored version, honours create idempotency, and can be scripted to
/// fail, to go offline or to respond slowly.
pub struct MockTransport {
    remote: Mutex<MockRemote>,
    online: AtomicBool,
    latency: Mutex<Option<Duration>>,
    clock: Arc<dyn Clock>,
}

impl MockTransport {
    /// Creates an empty, online remote using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty, online remote stamping writes with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            remote: Mutex::new(MockRemote::default()),
            online: AtomicBool::new(true),
            latency: Mutex::new(None),
            clock,
        }
    }

    /// Takes the remote offline (every call fails as retryable) or back online.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Makes the next call fail with `error`. Failures queue up in order.
    pub fn fail_next(&self, error: TransportError) {
        self.remote.lock().failures.push_back(error);
    }

    /// Creates an entity on the remote side, as another device would.
    pub fn insert_remote(&self, entity_type: &str, payload: Value) -> RemoteEntity {
        let mut remote = self.remote.lock();
        let remote_id = remote.allocate_id();
        let entity = RemoteEntity::new(remote_id.clone(), entity_type, payload, self.clock.now());
        remote
            .entities
            .insert((entity_type.to_string(), remote_id), entity.clone());
        entity
    }

    /// Edits an entity on the remote side. Returns `None` if it does not exist.
    pub fn update_remote(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
        payload: Value,
    ) -> Option<RemoteEntity> {
        let mut remote = self.remote.lock();
        let entity = remote
            .entities
            .get_mut(&(entity_type.to_string(), remote_id.clone()))?;
        entity.payload = payload;
        entity.updated_at = self.clock.now();
        Some(entity.clone())
    }

    /// Deletes an entity on the remote side. Returns false if it did not exist.
    pub fn delete_remote(&self, entity_type: &str, remote_id: &RemoteId) -> bool {
        let mut remote = self.remote.lock();
        let removed = remote
            .entities
            .remove(&(entity_type.to_string(), remote_id.clone()))
            .is_some();
        if removed {
            let deleted_at = self.clock.now();
            remote.tombstones.push(RemoteTombstone {
                entity_type: entity_type.to_string(),
                remote_id: remote_id.clone(),
                deleted_at,
            });
        }
        removed
    }

    /// Returns the remote version of one entity.
    pub fn get_remote(&self, entity_type: &str, remote_id: &RemoteId) -> Option<RemoteEntity> {
        self.remote
            .lock()
            .entities
            .get(&(entity_type.to_string(), remote_id.clone()))
            .cloned()
    }

    /// Returns every remote entity of one type.
    pub fn remote_entities(&self, entity_type: &str) -> Vec<RemoteEntity> {
        let mut entities: Vec<_> = self
            .remote
            .lock()
            .entities
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        entities
    }

    /// Returns every call received so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.remote.lock().calls.clone()
    }

    /// Returns the number of mutation calls received so far.
    pub fn push_count(&self) -> usize {
        self.remote.lock().calls.iter().filter(|c| c.is_push()).count()
    }

    /// Forgets the call log.
    pub fn clear_calls(&self) {
        self.remote.lock().calls.clear();
    }

    /// Records the call, applies latency, then checks connectivity and
    /// scripted failures.
    async fn begin(&self, call: TransportCall) -> TransportResult<()> {
        self.remote.lock().calls.push(call);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::retryable("remote unreachable"));
        }
        match self.remote.lock().failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn check_base(current: &RemoteEntity, base: Option<DateTime<Utc>>) -> TransportResult<()> {
    match base {
        Some(base) if base != current.updated_at => Err(TransportError::conflict(current.clone())),
        _ => Ok(()),
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn create(
        &self,
        entity_type: &str,
        local_id: LocalId,
        payload: &Value,
    ) -> TransportResult<RemoteAck> {
        self.begin(TransportCall::Create {
            entity_type: entity_type.to_string(),
            local_id,
        })
        .await?;

        let mut remote = self.remote.lock();
        // A replayed create answers with the original result while the
        // entity it made still exists.
        if let Some(ack) = remote.created.get(&local_id) {
            if remote
                .entities
                .contains_key(&(entity_type.to_string(), ack.remote_id.clone()))
            {
                return Ok(ack.clone());
            }
        }

        let remote_id = remote.allocate_id();
        let updated_at = self.clock.now();
        remote.entities.insert(
            (entity_type.to_string(), remote_id.clone()),
            RemoteEntity::new(remote_id.clone(), entity_type, payload.clone(), updated_at)
                .with_origin(local_id),
        );
        let ack = RemoteAck {
            remote_id,
            updated_at,
        };
        remote.created.insert(local_id, ack.clone());
        Ok(ack)
    }

    async fn update(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
        payload: &Value,
        base: Option<DateTime<Utc>>,
    ) -> TransportResult<RemoteAck> {
        self.begin(TransportCall::Update {
            entity_type: entity_type.to_string(),
            remote_id: remote_id.clone(),
        })
        .await?;

        let mut remote = self.remote.lock();
        let Some(current) = remote
            .entities
            .get_mut(&(entity_type.to_string(), remote_id.clone()))
        else {
            return Err(TransportError::NotFound(remote_id.to_string()));
        };

        check_base(current, base)?;
        current.payload = payload.clone();
        current.updated_at = self.clock.now();
        Ok(RemoteAck {
            remote_id: remote_id.clone(),
            updated_at: current.updated_at,
        })
    }

    async fn delete(
        &self,
        entity_type: &str,
        remote_id: &RemoteId,
        base: Option<DateTime<Utc>>,
    ) -> TransportResult<()> {
        self.begin(TransportCall::Delete {
            entity_type: entity_type.to_string(),
            remote_id: remote_id.clone(),
        })
        .await?;

        let mut remote = self.remote.lock();
        let key = (entity_type.to_string(), remote_id.clone());
        let Some(current) = remote.entities.get(&key) else {
            return Err(TransportError::NotFound(remote_id.to_string()));
        };
        check_base(current, base)?;

        remote.entities.remove(&key);
        let deleted_at = self.clock.now();
        remote.tombstones.push(RemoteTombstone {
            entity_type: entity_type.to_string(),
            remote_id: remote_id.clone(),
            deleted_at,
        });
        Ok(())
    }

    async fn get_changes_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> TransportResult<Vec<RemoteEntity>> {
        self.begin(TransportCall::GetChanges).await?;

        let remote = self.remote.lock();
        let mut changes: Vec<_> = remote
            .entities
            .values()
            .filter(|e| since.map_or(true, |since| e.updated_at > since))
            .cloned()
            .collect();
        changes.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.remote_id.cmp(&b.remote_id)));
        Ok(changes)
    }

    async fn get_deleted_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> TransportResult<Vec<RemoteTombstone>> {
        self.begin(TransportCall::GetDeleted).await?;

        let remote = self.remote.lock();
        Ok(remote
            .tombstones
            .iter()
            .filter(|t| since.map_or(true, |since| t.deleted_at > since))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::ManualClock;

    #[tokio::test]
    async fn create_is_idempotent_per_local_id() {
        let transport = MockTransport::new();
        let local_id = LocalId::new();

        let first = transport.create("notes", local_id, &json!({"t": 1})).await.unwrap();
        let second = transport.create("notes", local_id, &json!({"t": 1})).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.remote_entities("notes").len(), 1);
        assert_eq!(transport.push_count(), 2);

        let stored = transport.get_remote("notes", &first.remote_id).unwrap();
        assert_eq!(stored.origin, Some(local_id));
    }

    #[tokio::test]
    async fn stale_base_is_a_conflict() {
        let clock = Arc::new(ManualClock::default());
        let transport = MockTransport::with_clock(clock.clone());
        let entity = transport.insert_remote("notes", json!({"title": "a"}));

        clock.advance(chrono::Duration::seconds(5));
        let edited = transport
            .update_remote("notes", &entity.remote_id, json!({"title": "b"}))
            .unwrap();

        let result = transport
            .update("notes", &entity.remote_id, &json!({"title": "c"}), Some(entity.updated_at))
            .await;
        assert_eq!(result, Err(TransportError::conflict(edited.clone())));

        let ack = transport
            .update("notes", &entity.remote_id, &json!({"title": "c"}), Some(edited.updated_at))
            .await
            .unwrap();
        assert_eq!(ack.remote_id, entity.remote_id);
    }

    #[tokio::test]
    async fn missing_entity_is_not_found() {
        let transport = MockTransport::new();
        let id = RemoteId::new("r-404");
        assert!(matches!(
            transport.delete("notes", &id, None).await,
            Err(TransportError::NotFound(_))
        ));
        assert!(matches!(
            transport.update("notes", &id, &json!({}), None).await,
            Err(TransportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn scripted_failures_and_offline() {
        let transport = MockTransport::new();
        transport.fail_next(TransportError::fatal("rejected"));

        let result = transport.create("notes", LocalId::new(), &json!({})).await;
        assert_eq!(result, Err(TransportError::fatal("rejected")));

        transport.set_online(false);
        let result = transport.get_changes_since(None).await;
        assert!(matches!(result, Err(TransportError::Retryable(_))));

        transport.set_online(true);
        assert!(transport.get_changes_since(None).await.unwrap().is_empty());
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn changes_and_deletions_since_watermark() {
        let clock = Arc::new(ManualClock::default());
        let transport = MockTransport::with_clock(clock.clone());
        let start = clock.now();

        let a = transport.insert_remote("notes", json!({"n": 1}));
        clock.advance(chrono::Duration::seconds(1));
        let b = transport.insert_remote("notes", json!({"n": 2}));
        clock.advance(chrono::Duration::seconds(1));
        transport.delete_remote("notes", &a.remote_id);

        let all = transport.get_changes_since(None).await.unwrap();
        assert_eq!(all, vec![b.clone()]);

        let since_b = transport.get_changes_since(Some(b.updated_at)).await.unwrap();
        assert!(since_b.is_empty());

        let deleted = transport.get_deleted_since(Some(start)).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].remote_id, a.remote_id);
    }
}
