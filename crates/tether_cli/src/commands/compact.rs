//! Compact command implementation.

use super::{emit, open, CommandResult};
use crate::Format;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tether_core::{DataDir, EntityStore, LogEntityStore, LogQueue, OperationQueue};

/// Log sizes around a compaction.
#[derive(Debug, Serialize)]
pub struct CompactStats {
    /// Entity log frames before compaction.
    pub entity_frames_before: usize,
    /// Entity log frames after compaction.
    pub entity_frames_after: usize,
    /// Queue log frames before compaction.
    pub queue_frames_before: usize,
    /// Queue log frames after compaction.
    pub queue_frames_after: usize,
    /// Bytes on disk before compaction.
    pub bytes_before: u64,
    /// Bytes on disk after compaction.
    pub bytes_after: u64,
}

fn disk_usage(dir: &DataDir) -> u64 {
    [dir.entities_path(), dir.queue_path()]
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

/// Rewrites both logs to their live contents.
pub fn compact(dir: &DataDir, store: &LogEntityStore, queue: &LogQueue) -> CommandResult<CompactStats> {
    let entity_frames_before = store.log_frames();
    let queue_frames_before = queue.log_frames();
    let bytes_before = disk_usage(dir);

    store.compact()?;
    queue.compact()?;

    Ok(CompactStats {
        entity_frames_before,
        entity_frames_after: store.log_frames(),
        queue_frames_before,
        queue_frames_after: queue.log_frames(),
        bytes_before,
        bytes_after: disk_usage(dir),
    })
}

/// Runs the compact command.
pub fn run(path: &Path, format: Format) -> CommandResult<()> {
    let (dir, store, queue) = open(path)?;
    let stats = compact(&dir, &store, &queue)?;

    emit(format, &stats, |s| {
        println!("Compacted {}", path.display());
        println!(
            "  Entity log: {} -> {} frames",
            s.entity_frames_before, s.entity_frames_after
        );
        println!(
            "  Queue log:  {} -> {} frames",
            s.queue_frames_before, s.queue_frames_after
        );
        let saved = s.bytes_before.saturating_sub(s.bytes_after);
        println!(
            "  Size: {} -> {} bytes ({saved} bytes reclaimed)",
            s.bytes_before, s.bytes_after
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tether_core::{EntityRecord, LogOptions};

    #[test]
    fn compaction_drops_superseded_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path(), true).unwrap();
        let options = LogOptions::default()
            .with_sync_on_write(false)
            .with_compact_threshold(usize::MAX);
        let (store, queue) = dir.open_stores(options).unwrap();

        let mut record = EntityRecord::new_local("notes", json!({}), Utc::now());
        for i in 0..10 {
            record.payload = json!({ "title": format!("v{i}") });
            store.save(record.clone()).unwrap();
        }

        let stats = compact(&dir, &store, &queue).unwrap();
        assert!(stats.entity_frames_before >= 10);
        assert!(stats.entity_frames_after < stats.entity_frames_before);
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(store.len().unwrap(), 1);
    }
}
