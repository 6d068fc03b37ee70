//! Durable operation queue over a record log.

use super::memory::MemoryQueue;
use super::table::QueueChange;
use super::OperationQueue;
use crate::error::CoreResult;
use crate::log::{LogOptions, RecordLog};
use crate::operation::SyncOperation;
use crate::types::{LocalId, OperationId};
use chrono::{DateTime, Duration, Utc};
use tether_storage::StorageBackend;
use tracing::{debug, warn};

/// An operation queue that survives process restarts.
///
/// Enqueues, attempt records and removals are appended to the log before
/// they take effect. Replay restores the queue with ids, retry counts and
/// ordering intact.
pub struct LogQueue {
    index: MemoryQueue,
    log: RecordLog<QueueChange>,
}

impl LogQueue {
    /// Opens a queue over `backend`, replaying any existing content.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted or cannot be read.
    pub fn open(backend: Box<dyn StorageBackend>, options: LogOptions) -> CoreResult<Self> {
        let (log, changes) = RecordLog::open(backend, options)?;
        let index = MemoryQueue::from_changes(changes);

        debug!(operations = index.len()?, frames = log.frames(), "operation queue opened");

        let queue = Self { index, log };
        queue.maybe_compact();
        Ok(queue)
    }

    /// Returns the number of frames in the underlying log.
    pub fn log_frames(&self) -> usize {
        self.log.frames()
    }

    fn persist(&self, change: &QueueChange) -> CoreResult<()> {
        self.log.append(change)
    }

    fn maybe_compact(&self) {
        let result = self.index.exclusive(|table| {
            if self.log.should_compact(table.len() + 1) {
                self.log.rewrite(&table.checkpoint())
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            warn!(error = %e, "queue log compaction failed");
        }
    }

    fn committed<R>(&self, result: CoreResult<R>) -> CoreResult<R> {
        if result.is_ok() {
            self.maybe_compact();
        }
        result
    }
}

impl OperationQueue for LogQueue {
    fn enqueue(&self, op: SyncOperation) -> CoreResult<OperationId> {
        let result = self
            .index
            .write(|table| table.plan_enqueue(op), |c| self.persist(c));
        self.committed(result)
    }

    fn get(&self, id: OperationId) -> CoreResult<Option<SyncOperation>> {
        self.index.get(id)
    }

    fn pending(&self) -> CoreResult<Vec<SyncOperation>> {
        self.index.pending()
    }

    fn for_entity(&self, entity_id: LocalId) -> CoreResult<Vec<SyncOperation>> {
        self.index.for_entity(entity_id)
    }

    fn complete(&self, id: OperationId) -> CoreResult<bool> {
        let result = self
            .index
            .write(|table| table.plan_remove(vec![id]), |c| self.persist(c));
        self.committed(result).map(|removed| removed > 0)
    }

    fn mark_failed(
        &self,
        id: OperationId,
        error: &str,
        at: DateTime<Utc>,
    ) -> CoreResult<SyncOperation> {
        let result = self.index.write(
            |table| table.plan_attempt(id, error, at, false),
            |c| self.persist(c),
        );
        self.committed(result)?
    }

    fn park(&self, id: OperationId, error: &str, at: DateTime<Utc>) -> CoreResult<SyncOperation> {
        let result = self.index.write(
            |table| table.plan_attempt(id, error, at, true),
            |c| self.persist(c),
        );
        self.committed(result)?
    }

    fn replace(&self, op: SyncOperation) -> CoreResult<()> {
        let result = self
            .index
            .write(|table| table.plan_replace(op), |c| self.persist(c));
        self.committed(result)?
    }

    fn remove_for_entity(&self, entity_id: LocalId) -> CoreResult<usize> {
        let result = self.index.write(
            |table| table.plan_remove(table.entity_ids(entity_id)),
            |c| self.persist(c),
        );
        self.committed(result)
    }

    fn prune_stale(
        &self,
        max_age: Duration,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> CoreResult<usize> {
        let result = self.index.write(
            |table| table.plan_remove(table.stale_ids(max_age, max_retries, now)),
            |c| self.persist(c),
        );
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

impl std::fmt::Debug for LogQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogQueue")
            .field("frames", &self.log.frames())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRecord;
    use crate::error::CoreError;
    use crate::operation::OperationType;
    use serde_json::json;
    use tether_storage::InMemoryBackend;

    fn open(backend: &InMemoryBackend) -> LogQueue {
        LogQueue::open(Box::new(backend.reopen()), LogOptions::default()).unwrap()
    }

    fn op(record: &EntityRecord, op_type: OperationType) -> SyncOperation {
        SyncOperation::for_record(op_type, record, Utc::now())
    }

    #[test]
    fn queue_survives_restart() {
        let backend = InMemoryBackend::new();
        let record = EntityRecord::new_local("notes", json!({ "title": "x" }), Utc::now());
        let at = Utc::now();

        let (first, second) = {
            let queue = open(&backend);
            let first = queue.enqueue(op(&record, OperationType::Create)).unwrap();
            let second = queue.enqueue(op(&record, OperationType::Update)).unwrap();
            let third = queue.enqueue(op(&record, OperationType::Delete)).unwrap();
            queue.mark_failed(first, "timeout", at).unwrap();
            queue.complete(third).unwrap();
            (first, second)
        };

        let queue = open(&backend);
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
        assert_eq!(pending[1].id, second);

        let next = queue.enqueue(op(&record, OperationType::Update)).unwrap();
        assert!(next > second);
    }

    #[test]
    fn ids_are_not_reused_after_compaction() {
        let backend = InMemoryBackend::new();
        let record = EntityRecord::new_local("notes", json!({}), Utc::now());

        let last = {
            let queue = open(&backend);
            let id = queue.enqueue(op(&record, OperationType::Create)).unwrap();
            queue.complete(id).unwrap();
            queue.compact().unwrap();
            id
        };

        let queue = open(&backend);
        assert!(queue.is_empty().unwrap());
        let id = queue.enqueue(op(&record, OperationType::Update)).unwrap();
        assert!(id > last);
    }

    #[test]
    fn failed_enqueue_is_reported() {
        let backend = InMemoryBackend::new();
        let queue = open(&backend);
        let record = EntityRecord::new_local("notes", json!({}), Utc::now());

        backend.set_fail_writes(true);
        assert!(matches!(
            queue.enqueue(op(&record, OperationType::Create)),
            Err(CoreError::Storage(_))
        ));
        backend.set_fail_writes(false);

        assert!(queue.is_empty().unwrap());
        assert!(open(&backend).is_empty().unwrap());
    }
}
