//! Prune command implementation.

use super::{emit, open, CommandResult};
use crate::Format;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::Path;
use tether_core::OperationQueue;

/// Outcome of a prune.
#[derive(Debug, Serialize)]
pub struct PruneResult {
    /// Operations queued before pruning.
    pub before: usize,
    /// Operations removed.
    pub pruned: usize,
    /// Cutoff: exhausted operations created before this time were removed.
    pub cutoff: DateTime<Utc>,
}

/// Removes exhausted or parked operations older than `max_age`.
pub fn prune(
    queue: &dyn OperationQueue,
    max_age: Duration,
    max_retries: u32,
    now: DateTime<Utc>,
) -> CommandResult<PruneResult> {
    let cutoff = now
        .checked_sub_signed(max_age)
        .ok_or("maximum age reaches before the earliest representable time")?;
    let before = queue.len()?;
    let pruned = queue.prune_stale(max_age, max_retries, now)?;
    Ok(PruneResult {
        before,
        pruned,
        cutoff,
    })
}

/// Converts the `--max-age-hours` argument.
fn parse_max_age(hours: i64) -> CommandResult<Duration> {
    if hours < 0 {
        return Err("--max-age-hours must not be negative".into());
    }
    Duration::try_hours(hours).ok_or_else(|| format!("--max-age-hours {hours} is out of range").into())
}

/// Runs the prune command.
pub fn run(path: &Path, max_age_hours: i64, max_retries: u32, format: Format) -> CommandResult<()> {
    let max_age = parse_max_age(max_age_hours)?;
    let (_dir, _store, queue) = open(path)?;
    let result = prune(&queue, max_age, max_retries, Utc::now())?;

    emit(format, &result, |r| {
        println!(
            "Pruned {} of {} operations (exhausted or parked before {})",
            r.pruned,
            r.before,
            r.cutoff.to_rfc3339()
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{EntityRecord, MemoryQueue, OperationType, SyncOperation};

    #[test]
    fn removes_only_old_exhausted_operations() {
        let queue = MemoryQueue::new();
        let start = Utc::now();
        let record = EntityRecord::new_local("notes", json!({}), start);

        let exhausted = queue
            .enqueue(SyncOperation::for_record(OperationType::Create, &record, start))
            .unwrap();
        for _ in 0..3 {
            queue.mark_failed(exhausted, "503", start).unwrap();
        }
        queue
            .enqueue(SyncOperation::for_record(OperationType::Update, &record, start))
            .unwrap();

        let later = start + Duration::hours(2);
        let result = prune(&queue, Duration::hours(3), 3, later).unwrap();
        assert_eq!(result.pruned, 0);

        let result = prune(&queue, Duration::hours(1), 3, later).unwrap();
        assert_eq!(result.before, 2);
        assert_eq!(result.pruned, 1);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn out_of_range_age_is_an_error() {
        assert!(parse_max_age(-1).is_err());
        assert!(parse_max_age(i64::MAX).is_err());
        assert_eq!(parse_max_age(2).unwrap(), Duration::hours(2));

        let queue = MemoryQueue::new();
        let record = EntityRecord::new_local("notes", json!({}), Utc::now());
        queue
            .enqueue(SyncOperation::for_record(OperationType::Create, &record, Utc::now()))
            .unwrap();
        let huge = Duration::try_days(100_000_000).unwrap();
        assert!(prune(&queue, huge, 3, Utc::now()).is_err());
        assert_eq!(queue.len().unwrap(), 1);
    }
}
