//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store underneath a Tether record log.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` makes all appended data survive process termination
/// - `replace` is all-or-nothing: readers observe either the old or the new content
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends
    /// beyond the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads the entire content.
    ///
    /// Used by record logs during replay on open.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| {
            crate::StorageError::Unavailable(format!("content of {size} bytes does not fit in memory"))
        })?;
        self.read_at(0, len)
    }

    /// Appends data to the end of the storage and returns its offset.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes data and metadata durable on the device.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes (the offset of the next append).
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte after `new_size`.
    ///
    /// Record logs use this to cut off a torn trailing frame left by a crash.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole content with `data`.
    ///
    /// Record logs use this to write a compacted snapshot.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
