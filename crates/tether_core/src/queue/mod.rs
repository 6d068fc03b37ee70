//! Sync operation queue: the ordered log of mutations awaiting the remote.
//!
//! The queue only stores and orders operations. Retry budgets and backoff
//! are policy of the sync service; the queue records attempts and exposes
//! the budget-aware [`OperationQueue::retryable`] view.
//!
//! # Ordering
//!
//! `created_at` never decreases across enqueues, so ordering by
//! `(created_at, id)` is exactly enqueue order, which in turn preserves the
//! per-entity order of local mutations.

mod durable;
mod memory;
mod table;

pub use durable::LogQueue;
pub use memory::MemoryQueue;

use crate::error::CoreResult;
use crate::operation::SyncOperation;
use crate::types::{LocalId, OperationId};
use chrono::{DateTime, Duration, Utc};

/// Durable, ordered storage of pending sync operations.
pub trait OperationQueue: Send + Sync {
    /// Appends an operation, assigning its id. Never overwrites.
    ///
    /// `created_at` is raised to the latest enqueue time if the clock went
    /// backwards.
    fn enqueue(&self, op: SyncOperation) -> CoreResult<OperationId>;

    /// Returns one operation.
    fn get(&self, id: OperationId) -> CoreResult<Option<SyncOperation>>;

    /// Returns every queued operation in enqueue order.
    fn pending(&self) -> CoreResult<Vec<SyncOperation>>;

    /// Returns the operations for one entity in enqueue order.
    fn for_entity(&self, entity_id: LocalId) -> CoreResult<Vec<SyncOperation>>;

    /// Removes an operation permanently. Returns false if it was not queued.
    fn complete(&self, id: OperationId) -> CoreResult<bool>;

    /// Records a failed attempt: bumps `retry_count` and stamps the attempt.
    fn mark_failed(
        &self,
        id: OperationId,
        error: &str,
        at: DateTime<Utc>,
    ) -> CoreResult<SyncOperation>;

    /// Records a permanent failure; the operation is never retried automatically.
    fn park(&self, id: OperationId, error: &str, at: DateTime<Utc>) -> CoreResult<SyncOperation>;

    /// Rewrites a queued operation in place, keeping its id and position.
    fn replace(&self, op: SyncOperation) -> CoreResult<()>;

    /// Removes every operation for one entity. Returns how many were removed.
    fn remove_for_entity(&self, entity_id: LocalId) -> CoreResult<usize>;

    /// Removes operations that are out of automatic retries and older than
    /// `max_age`. Returns how many were removed.
    fn prune_stale(&self, max_age: Duration, max_retries: u32, now: DateTime<Utc>)
        -> CoreResult<usize>;

    /// Returns the number of queued operations.
    fn len(&self) -> CoreResult<usize>;

    /// Returns true if nothing is queued.
    fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns the operations automatic sync may still attempt, in enqueue order.
    fn retryable(&self, max_retries: u32) -> CoreResult<Vec<SyncOperation>> {
        Ok(self
            .pending()?
            .into_iter()
            .filter(|op| op.is_retryable(max_retries))
            .collect())
    }

    /// Reclaims space held by finished operations. A no-op for volatile queues.
    fn compact(&self) -> CoreResult<()> {
        Ok(())
    }
}
