//! Volatile operation queue.

use super::table::{QueueChange, QueueTable};
use super::OperationQueue;
use crate::error::CoreResult;
use crate::operation::SyncOperation;
use crate::types::{LocalId, OperationId};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// An operation queue held entirely in memory.
///
/// Also serves as the index of [`LogQueue`](super::LogQueue).
#[derive(Debug)]
pub struct MemoryQueue {
    table: RwLock<QueueTable>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: RwLock::new(QueueTable::new()),
        }
    }

    /// Rebuilds a queue from replayed changes.
    pub(crate) fn from_changes(changes: impl IntoIterator<Item = QueueChange>) -> Self {
        let mut table = QueueTable::new();
        for change in changes {
            table.apply(change);
        }
        Self {
            table: RwLock::new(table),
        }
    }

    /// Plans a change, persists it, then applies it, all under the write lock.
    pub(crate) fn write<R>(
        &self,
        plan: impl FnOnce(&QueueTable) -> (Option<QueueChange>, R),
        persist: impl FnOnce(&QueueChange) -> CoreResult<()>,
    ) -> CoreResult<R> {
        let mut table = self.table.write();
        let (change, result) = plan(&table);
        if let Some(change) = change {
            persist(&change)?;
            table.apply(change);
        }
        Ok(result)
    }

    /// Runs `f` with writes excluded.
    pub(crate) fn exclusive<R>(&self, f: impl FnOnce(&QueueTable) -> R) -> R {
        let table = self.table.write();
        f(&table)
    }

    fn no_persist(_: &QueueChange) -> CoreResult<()> {
        Ok(())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue for MemoryQueue {
    fn enqueue(&self, op: SyncOperation) -> CoreResult<OperationId> {
        self.write(|table| table.plan_enqueue(op), Self::no_persist)
    }

    fn get(&self, id: OperationId) -> CoreResult<Option<SyncOperation>> {
        Ok(self.table.read().get(id).cloned())
    }

    fn pending(&self) -> CoreResult<Vec<SyncOperation>> {
        Ok(self.table.read().ordered())
    }

    fn for_entity(&self, entity_id: LocalId) -> CoreResult<Vec<SyncOperation>> {
        Ok(self.table.read().for_entity(entity_id))
    }

    fn complete(&self, id: OperationId) -> CoreResult<bool> {
        let removed = self.write(|table| table.plan_remove(vec![id]), Self::no_persist)?;
        Ok(removed > 0)
    }

    fn mark_failed(
        &self,
        id: OperationId,
        error: &str,
        at: DateTime<Utc>,
    ) -> CoreResult<SyncOperation> {
        self.write(|table| table.plan_attempt(id, error, at, false), Self::no_persist)?
    }

    fn park(&self, id: OperationId, error: &str, at: DateTime<Utc>) -> CoreResult<SyncOperation> {
        self.write(|table| table.plan_attempt(id, error, at, true), Self::no_persist)?
    }

    fn replace(&self, op: SyncOperation) -> CoreResult<()> {
        self.write(|table| table.plan_replace(op), Self::no_persist)?
    }

    fn remove_for_entity(&self, entity_id: LocalId) -> CoreResult<usize> {
        self.write(
            |table| table.plan_remove(table.entity_ids(entity_id)),
            Self::no_persist,
        )
    }

    fn prune_stale(
        &self,
        max_age: Duration,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> CoreResult<usize> {
        self.write(
            |table| table.plan_remove(table.stale_ids(max_age, max_retries, now)),
            Self::no_persist,
        )
    }

    fn len(&self) -> CoreResult<usize> {
        Ok(self.table.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRecord;
    use crate::operation::OperationType;
    use crate::CoreError;
    use serde_json::json;

    fn op_for(record: &EntityRecord, op_type: OperationType, at: DateTime<Utc>) -> SyncOperation {
        SyncOperation::for_record(op_type, record, at)
    }

    fn record() -> EntityRecord {
        EntityRecord::new_local("notes", json!({ "title": "x" }), Utc::now())
    }

    #[test]
    fn enqueue_assigns_increasing_ids() {
        let queue = MemoryQueue::new();
        let rec = record();
        let now = Utc::now();

        let a = queue.enqueue(op_for(&rec, OperationType::Create, now)).unwrap();
        let b = queue.enqueue(op_for(&rec, OperationType::Update, now)).unwrap();
        assert!(b > a);
        assert_eq!(queue.len().unwrap(), 2);
        assert_eq!(queue.get(a).unwrap().unwrap().op_type, OperationType::Create);
    }

    #[test]
    fn pending_is_fifo_even_if_clock_goes_backwards() {
        let queue = MemoryQueue::new();
        let rec = record();
        let now = Utc::now();

        queue.enqueue(op_for(&rec, OperationType::Create, now)).unwrap();
        queue
            .enqueue(op_for(&rec, OperationType::Update, now - Duration::seconds(30)))
            .unwrap();
        queue
            .enqueue(op_for(&rec, OperationType::Delete, now + Duration::seconds(1)))
            .unwrap();

        let types: Vec<_> = queue.pending().unwrap().iter().map(|op| op.op_type).collect();
        assert_eq!(
            types,
            vec![OperationType::Create, OperationType::Update, OperationType::Delete]
        );
        let ops = queue.pending().unwrap();
        assert!(ops.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn for_entity_and_remove_for_entity() {
        let queue = MemoryQueue::new();
        let a = record();
        let b = record();
        let now = Utc::now();

        queue.enqueue(op_for(&a, OperationType::Create, now)).unwrap();
        queue.enqueue(op_for(&b, OperationType::Create, now)).unwrap();
        queue.enqueue(op_for(&a, OperationType::Update, now)).unwrap();

        assert_eq!(queue.for_entity(a.local_id).unwrap().len(), 2);
        assert_eq!(queue.remove_for_entity(a.local_id).unwrap(), 2);
        assert_eq!(queue.remove_for_entity(a.local_id).unwrap(), 0);
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(queue.pending().unwrap()[0].entity_id, b.local_id);
    }

    #[test]
    fn complete_removes_once() {
        let queue = MemoryQueue::new();
        let id = queue
            .enqueue(op_for(&record(), OperationType::Create, Utc::now()))
            .unwrap();
        assert!(queue.complete(id).unwrap());
        assert!(!queue.complete(id).unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn retry_budget_excludes_from_retryable() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        let id = queue
            .enqueue(op_for(&record(), OperationType::Create, now))
            .unwrap();

        for attempt in 1..=3 {
            assert_eq!(queue.retryable(3).unwrap().len(), 1);
            let op = queue.mark_failed(id, "timeout", now).unwrap();
            assert_eq!(op.retry_count, attempt);
            assert_eq!(op.last_error.as_deref(), Some("timeout"));
            assert_eq!(op.last_attempt_at, Some(now));
        }

        assert!(queue.retryable(3).unwrap().is_empty());
        assert_eq!(queue.pending().unwrap().len(), 1);

        let later = now + Duration::days(8);
        assert_eq!(queue.prune_stale(Duration::days(7), 3, now).unwrap(), 0);
        assert_eq!(queue.prune_stale(Duration::days(7), 3, later).unwrap(), 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn parked_operations_are_not_retryable() {
        let queue = MemoryQueue::new();
        let id = queue
            .enqueue(op_for(&record(), OperationType::Create, Utc::now()))
            .unwrap();

        let op = queue.park(id, "422 invalid", Utc::now()).unwrap();
        assert!(op.parked);
        assert!(queue.retryable(3).unwrap().is_empty());
    }

    #[test]
    fn replace_keeps_position() {
        let queue = MemoryQueue::new();
        let rec = record();
        let now = Utc::now();
        let first = queue.enqueue(op_for(&rec, OperationType::Create, now)).unwrap();
        queue.enqueue(op_for(&rec, OperationType::Update, now)).unwrap();

        let mut op = queue.get(first).unwrap().unwrap();
        op.payload = json!({ "title": "rebased" });
        queue.replace(op).unwrap();

        let pending = queue.pending().unwrap();
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[0].payload, json!({ "title": "rebased" }));
    }

    proptest::proptest! {
        #[test]
        fn per_entity_order_follows_enqueue_order(
            picks in proptest::collection::vec((0usize..3, -60i64..60), 1..40)
        ) {
            let queue = MemoryQueue::new();
            let records: Vec<_> = (0..3).map(|_| record()).collect();
            let base = Utc::now();

            let mut enqueued = Vec::new();
            for (entity, skew) in picks {
                let at = base + Duration::seconds(skew);
                let id = queue
                    .enqueue(op_for(&records[entity], OperationType::Update, at))
                    .unwrap();
                enqueued.push((records[entity].local_id, id));
            }

            for record in &records {
                let expected: Vec<_> = enqueued
                    .iter()
                    .filter(|(entity, _)| *entity == record.local_id)
                    .map(|(_, id)| *id)
                    .collect();
                let actual: Vec<_> = queue
                    .for_entity(record.local_id)
                    .unwrap()
                    .iter()
                    .map(|op| op.id)
                    .collect();
                proptest::prop_assert_eq!(actual, expected);
            }
        }
    }

    #[test]
    fn unknown_operation_is_an_error() {
        let queue = MemoryQueue::new();
        let missing = OperationId::new(42);
        assert!(matches!(
            queue.mark_failed(missing, "x", Utc::now()),
            Err(CoreError::OperationNotFound(_))
        ));

        let mut op = op_for(&record(), OperationType::Update, Utc::now());
        op.id = missing;
        assert!(matches!(queue.replace(op), Err(CoreError::OperationNotFound(_))));
    }
}
