//! Store and queue fixtures.
//!
//! Every fixture shares one [`ManualClock`] between its parts so tests can
//! move time deterministically.

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tether_core::{
    Clock, DataDir, LogEntityStore, LogOptions, LogQueue, ManualClock, MemoryEntityStore,
    MemoryQueue,
};
use tether_storage::InMemoryBackend;

/// Volatile store and queue.
pub struct MemoryFixture {
    /// The entity store.
    pub store: Arc<MemoryEntityStore>,
    /// The operation queue.
    pub queue: Arc<MemoryQueue>,
    /// The shared clock.
    pub clock: Arc<ManualClock>,
}

impl MemoryFixture {
    /// Creates an empty fixture.
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryEntityStore::new()),
            queue: Arc::new(MemoryQueue::new()),
            clock: Arc::new(ManualClock::default()),
        }
    }

    /// Returns the clock as a trait object.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Moves the clock forward.
    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

impl Default for MemoryFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable store and queue over shared in-memory backends.
///
/// [`reopen`](Self::reopen) replays the same bytes, which simulates a
/// process restart; [`fail_writes`](Self::fail_writes) simulates a full
/// or broken disk.
pub struct DurableFixture {
    /// The entity store.
    pub store: Arc<LogEntityStore>,
    /// The operation queue.
    pub queue: Arc<LogQueue>,
    /// The shared clock.
    pub clock: Arc<ManualClock>,
    entities: InMemoryBackend,
    operations: InMemoryBackend,
    options: LogOptions,
}

impl DurableFixture {
    /// Creates an empty fixture with default log options.
    pub fn new() -> Self {
        Self::with_options(LogOptions::default())
    }

    /// Creates an empty fixture.
    pub fn with_options(options: LogOptions) -> Self {
        let entities = InMemoryBackend::new();
        let operations = InMemoryBackend::new();
        let clock = Arc::new(ManualClock::default());
        Self::open(entities, operations, options, clock)
    }

    fn open(
        entities: InMemoryBackend,
        operations: InMemoryBackend,
        options: LogOptions,
        clock: Arc<ManualClock>,
    ) -> Self {
        let store = LogEntityStore::open(Box::new(entities.reopen()), options)
            .expect("Failed to open entity log");
        let queue = LogQueue::open(Box::new(operations.reopen()), options)
            .expect("Failed to open operation log");
        Self {
            store: Arc::new(store),
            queue: Arc::new(queue),
            clock,
            entities,
            operations,
            options,
        }
    }

    /// Opens fresh store and queue instances over the same bytes.
    pub fn reopen(&self) -> Self {
        Self::open(
            self.entities.reopen(),
            self.operations.reopen(),
            self.options,
            Arc::clone(&self.clock),
        )
    }

    /// Makes every subsequent write to both logs fail, or succeed again.
    pub fn fail_writes(&self, fail: bool) {
        self.entities.set_fail_writes(fail);
        self.operations.set_fail_writes(fail);
    }

    /// Makes writes to the operation log fail, leaving the entity log intact.
    pub fn fail_queue_writes(&self, fail: bool) {
        self.operations.set_fail_writes(fail);
    }

    /// Returns the clock as a trait object.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}

impl Default for DurableFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A data directory in a temporary location, removed on drop.
pub struct TempDataDir {
    temp: TempDir,
}

impl TempDataDir {
    /// Creates an empty temporary directory.
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Returns the directory path.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Locks the directory and opens its store and queue.
    ///
    /// Drop the returned [`DataDir`] before opening again.
    pub fn open(&self) -> (DataDir, LogEntityStore, LogQueue) {
        let dir = DataDir::open(self.temp.path(), true).expect("Failed to open data directory");
        let (store, queue) = dir
            .open_stores(LogOptions::default())
            .expect("Failed to open stores");
        (dir, store, queue)
    }
}

impl Default for TempDataDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{EntityRecord, EntityStore, OperationQueue, OperationType, SyncOperation};

    #[test]
    fn durable_fixture_reopens_same_state() {
        let fixture = DurableFixture::new();
        let record = EntityRecord::new_local("notes", json!({ "title": "x" }), fixture.clock.now());
        fixture.store.save(record.clone()).unwrap();
        fixture
            .queue
            .enqueue(SyncOperation::for_record(OperationType::Create, &record, fixture.clock.now()))
            .unwrap();

        let reopened = fixture.reopen();
        assert_eq!(reopened.store.get(record.local_id).unwrap(), Some(record));
        assert_eq!(reopened.queue.len().unwrap(), 1);
    }

    #[test]
    fn failing_fixture_rejects_writes() {
        let fixture = DurableFixture::new();
        fixture.fail_writes(true);
        let record = EntityRecord::new_local("notes", json!({}), fixture.clock.now());
        assert!(fixture.store.save(record).is_err());
        assert!(fixture.store.is_empty().unwrap());
    }

    #[test]
    fn memory_fixture_clock_advances() {
        let fixture = MemoryFixture::new();
        let before = fixture.clock().now();
        fixture.advance_secs(5);
        assert_eq!(fixture.clock().now() - before, chrono::Duration::seconds(5));
    }

    #[test]
    fn temp_data_dir_round_trip() {
        let temp = TempDataDir::new();
        let record = EntityRecord::new_local("notes", json!({}), chrono::Utc::now());
        {
            let (_dir, store, _queue) = temp.open();
            store.save(record.clone()).unwrap();
        }
        let (_dir, store, _queue) = temp.open();
        assert_eq!(store.get(record.local_id).unwrap(), Some(record));
    }
}
