//! Queue command implementation.

use super::{emit, open, CommandResult};
use crate::Format;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tether_core::{OperationQueue, SyncOperation};

/// One queued operation.
#[derive(Debug, Serialize)]
pub struct OperationRow {
    /// Queue position id.
    pub id: u64,
    /// Create, update or delete.
    pub op_type: String,
    /// Entity type.
    pub entity_type: String,
    /// Local id of the entity.
    pub entity_id: String,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Time of the last attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// Whether the remote rejected the operation permanently.
    pub parked: bool,
}

impl From<SyncOperation> for OperationRow {
    fn from(op: SyncOperation) -> Self {
        Self {
            id: op.id.as_u64(),
            op_type: op.op_type.to_string(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.to_string(),
            created_at: op.created_at,
            retry_count: op.retry_count,
            last_attempt_at: op.last_attempt_at,
            last_error: op.last_error,
            parked: op.parked,
        }
    }
}

/// Lists queued operations in dispatch order.
pub fn collect(queue: &dyn OperationQueue) -> CommandResult<Vec<OperationRow>> {
    Ok(queue
        .pending()?
        .into_iter()
        .map(OperationRow::from)
        .collect())
}

/// Runs the queue command.
pub fn run(path: &Path, format: Format) -> CommandResult<()> {
    let (_dir, _store, queue) = open(path)?;
    let rows = collect(&queue)?;

    emit(format, &rows, |rows| {
        if rows.is_empty() {
            println!("Queue is empty");
            return;
        }
        println!(
            "{:>6}  {:<6}  {:<12}  {:<36}  {:>7}  LAST ERROR",
            "ID", "KIND", "TYPE", "ENTITY", "RETRIES"
        );
        for row in rows {
            let error = row.last_error.as_deref().unwrap_or("-");
            let parked = if row.parked { " [parked]" } else { "" };
            println!(
                "{:>6}  {:<6}  {:<12}  {:<36}  {:>7}  {error}{parked}",
                row.id, row.op_type, row.entity_type, row.entity_id, row.retry_count
            );
        }
        println!();
        println!("{} operations", rows.len());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{EntityRecord, MemoryQueue, OperationType};

    #[test]
    fn lists_in_enqueue_order_with_failures() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        let record = EntityRecord::new_local("notes", json!({}), now);

        let first = queue
            .enqueue(SyncOperation::for_record(OperationType::Create, &record, now))
            .unwrap();
        queue
            .enqueue(SyncOperation::for_record(OperationType::Update, &record, now))
            .unwrap();
        queue.mark_failed(first, "503", now).unwrap();

        let rows = collect(&queue).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].op_type, "create");
        assert_eq!(rows[0].retry_count, 1);
        assert_eq!(rows[0].last_error.as_deref(), Some("503"));
        assert_eq!(rows[1].op_type, "update");
        assert!(rows[0].id < rows[1].id);
    }
}
