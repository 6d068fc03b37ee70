//! Data directory management.
//!
//! A Tether data directory holds one sync domain:
//!
//! ```text
//! <data_path>/
//! ├─ LOCK              # Advisory lock: one sync worker per directory
//! ├─ entities.log      # Entity store record log
//! └─ queue.log         # Operation queue record log
//! ```
//!
//! The LOCK file keeps two processes from draining the same queue, which
//! would let both transmit the same operation.

use crate::error::{CoreError, CoreResult};
use crate::log::LogOptions;
use crate::queue::LogQueue;
use crate::store::LogEntityStore;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tether_storage::FileBackend;
use tracing::info;

const LOCK_FILE: &str = "LOCK";
const ENTITIES_FILE: &str = "entities.log";
const QUEUE_FILE: &str = "queue.log";

/// An exclusively locked data directory.
///
/// The lock is held until this value is dropped. Keep it alive for as long
/// as stores opened from it are in use.
///
/// # Example
///
/// ```rust,ignore
/// use tether_core::{DataDir, LogOptions};
///
/// let dir = DataDir::open(Path::new("tether-data"), true)?;
/// let (store, queue) = dir.open_stores(LogOptions::default())?;
/// ```
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens or creates a data directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDirectory`] if the path is missing and
    ///   `create_if_missing` is false, or if it is not a directory
    /// - [`CoreError::Locked`] if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_directory(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_directory(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked);
        }

        info!(path = %path.display(), "data directory opened");

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the entity store log.
    #[must_use]
    pub fn entities_path(&self) -> PathBuf {
        self.path.join(ENTITIES_FILE)
    }

    /// Returns the path of the operation queue log.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.path.join(QUEUE_FILE)
    }

    /// Opens the durable entity store and operation queue of this directory.
    pub fn open_stores(&self, options: LogOptions) -> CoreResult<(LogEntityStore, LogQueue)> {
        let entities = FileBackend::open(&self.entities_path())?;
        let queue = FileBackend::open(&self.queue_path())?;

        let store = LogEntityStore::open(Box::new(entities), options)?;
        let queue = LogQueue::open(Box::new(queue), options)?;
        Ok((store, queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRecord;
    use crate::operation::{OperationType, SyncOperation};
    use crate::queue::OperationQueue;
    use crate::store::EntityStore;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("data");

        let dir = DataDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.entities_path(), path.join("entities.log"));
        assert_eq!(dir.queue_path(), path.join("queue.log"));
    }

    #[test]
    fn open_fails_if_missing_and_no_create() {
        let temp = tempdir().unwrap();
        let result = DataDir::open(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(CoreError::InvalidDirectory { .. })));
    }

    #[test]
    fn second_worker_is_locked_out() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("data");

        let _first = DataDir::open(&path, true).unwrap();
        assert!(matches!(DataDir::open(&path, true), Err(CoreError::Locked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("data");

        drop(DataDir::open(&path, true).unwrap());
        assert!(DataDir::open(&path, true).is_ok());
    }

    #[test]
    fn stores_persist_across_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("data");
        let record = EntityRecord::new_local("notes", json!({ "title": "a" }), Utc::now());

        {
            let dir = DataDir::open(&path, true).unwrap();
            let (store, queue) = dir.open_stores(LogOptions::default()).unwrap();
            store.save(record.clone()).unwrap();
            queue
                .enqueue(SyncOperation::for_record(OperationType::Create, &record, Utc::now()))
                .unwrap();
        }

        let dir = DataDir::open(&path, true).unwrap();
        let (store, queue) = dir.open_stores(LogOptions::default()).unwrap();
        assert_eq!(store.get(record.local_id).unwrap(), Some(record.clone()));
        assert_eq!(queue.for_entity(record.local_id).unwrap().len(), 1);
    }
}
