//! In-memory queue state shared by both queue implementations.

use crate::error::{CoreError, CoreResult};
use crate::operation::SyncOperation;
use crate::types::{LocalId, OperationId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One state change of the queue; also the durable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum QueueChange {
    Enqueue(SyncOperation),
    Replace(SyncOperation),
    Remove(Vec<OperationId>),
    /// Id and time cursors, written first on compaction so ids are never
    /// reused even after every operation was removed.
    Cursor {
        next_id: OperationId,
        latest_created_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct QueueTable {
    ops: BTreeMap<OperationId, SyncOperation>,
    next_id: OperationId,
    latest_created_at: Option<DateTime<Utc>>,
}

impl QueueTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: OperationId::new(1),
            ..Self::default()
        }
    }

    pub(crate) fn get(&self, id: OperationId) -> Option<&SyncOperation> {
        self.ops.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// Every operation in enqueue order.
    pub(crate) fn ordered(&self) -> Vec<SyncOperation> {
        let mut ops: Vec<_> = self.ops.values().cloned().collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        ops
    }

    pub(crate) fn for_entity(&self, entity_id: LocalId) -> Vec<SyncOperation> {
        let mut ops = self.ordered();
        ops.retain(|op| op.entity_id == entity_id);
        ops
    }

    pub(crate) fn checkpoint(&self) -> Vec<QueueChange> {
        let mut changes = vec![QueueChange::Cursor {
            next_id: self.next_id,
            latest_created_at: self.latest_created_at,
        }];
        changes.extend(self.ordered().into_iter().map(QueueChange::Enqueue));
        changes
    }

    pub(crate) fn apply(&mut self, change: QueueChange) {
        match change {
            QueueChange::Enqueue(op) => {
                if op.id >= self.next_id {
                    self.next_id = op.id.next();
                }
                if self.latest_created_at.map_or(true, |t| op.created_at > t) {
                    self.latest_created_at = Some(op.created_at);
                }
                self.ops.insert(op.id, op);
            }
            QueueChange::Replace(op) => {
                if let Some(slot) = self.ops.get_mut(&op.id) {
                    *slot = op;
                }
            }
            QueueChange::Remove(ids) => {
                for id in ids {
                    self.ops.remove(&id);
                }
            }
            QueueChange::Cursor {
                next_id,
                latest_created_at,
            } => {
                self.next_id = self.next_id.max(next_id);
                self.latest_created_at = self.latest_created_at.max(latest_created_at);
            }
        }
    }

    pub(crate) fn plan_enqueue(&self, mut op: SyncOperation) -> (Option<QueueChange>, OperationId) {
        op.id = self.next_id;
        if let Some(latest) = self.latest_created_at {
            if op.created_at < latest {
                op.created_at = latest;
            }
        }
        let id = op.id;
        (Some(QueueChange::Enqueue(op)), id)
    }

    pub(crate) fn plan_remove(&self, ids: Vec<OperationId>) -> (Option<QueueChange>, usize) {
        let ids: Vec<_> = ids.into_iter().filter(|id| self.ops.contains_key(id)).collect();
        let count = ids.len();
        if count == 0 {
            (None, 0)
        } else {
            (Some(QueueChange::Remove(ids)), count)
        }
    }

    pub(crate) fn plan_attempt(
        &self,
        id: OperationId,
        error: &str,
        at: DateTime<Utc>,
        park: bool,
    ) -> (Option<QueueChange>, CoreResult<SyncOperation>) {
        let Some(current) = self.ops.get(&id) else {
            return (None, Err(CoreError::OperationNotFound(id)));
        };

        let mut op = current.clone();
        op.retry_count = op.retry_count.saturating_add(1);
        op.last_attempt_at = Some(at);
        op.last_error = Some(error.to_string());
        if park {
            op.parked = true;
        }
        (Some(QueueChange::Replace(op.clone())), Ok(op))
    }

    pub(crate) fn plan_replace(&self, op: SyncOperation) -> (Option<QueueChange>, CoreResult<()>) {
        if self.ops.contains_key(&op.id) {
            (Some(QueueChange::Replace(op)), Ok(()))
        } else {
            (None, Err(CoreError::OperationNotFound(op.id)))
        }
    }

    pub(crate) fn entity_ids(&self, entity_id: LocalId) -> Vec<OperationId> {
        self.ops
            .values()
            .filter(|op| op.entity_id == entity_id)
            .map(|op| op.id)
            .collect()
    }

    pub(crate) fn stale_ids(&self, max_age: Duration, max_retries: u32, now: DateTime<Utc>) -> Vec<OperationId> {
        self.ops
            .values()
            .filter(|op| op.is_stale(max_age, max_retries, now))
            .map(|op| op.id)
            .collect()
    }
}
