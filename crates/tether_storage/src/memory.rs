//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory storage backend.
///
/// Content lives behind a shared handle: [`InMemoryBackend::reopen`] returns
/// a second backend over the same bytes, which is how tests simulate a
/// process restart without touching the file system.
///
/// Writes can be made to fail on demand with [`InMemoryBackend::set_fail_writes`]
/// to exercise local-storage failure paths.
///
/// # Example
///
/// ```rust
/// use tether_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.append(b"frame").unwrap();
///
/// let after_restart = backend.reopen();
/// assert_eq!(after_restart.read_all().unwrap(), b"frame");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with pre-existing content.
    ///
    /// Useful for testing replay of damaged logs.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns another backend sharing this one's content and fault switch.
    #[must_use]
    pub fn reopen(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            fail_writes: Arc::clone(&self.fail_writes),
        }
    }

    /// Makes every subsequent write fail with [`StorageError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("write rejected by backend".into()))
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        // Both bounds were checked against a usize length above.
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_writable()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_writable()
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_writable()?;
        let mut data = self.data.write();
        let size = data.len() as u64;

        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }

        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, new_data: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        *self.data.write() = new_data.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_append_returns_offsets() {
        let mut backend = InMemoryBackend::new();

        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn memory_read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(10, 0),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn memory_reopen_shares_content() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"before").unwrap();

        let mut second = backend.reopen();
        second.append(b"+after").unwrap();

        assert_eq!(backend.read_all().unwrap(), b"before+after");
    }

    #[test]
    fn memory_injected_failure_rejects_writes_only() {
        let mut backend = InMemoryBackend::with_data(b"kept".to_vec());
        backend.set_fail_writes(true);

        assert!(matches!(
            backend.append(b"lost"),
            Err(StorageError::Unavailable(_))
        ));
        assert!(backend.sync().is_err());
        assert_eq!(backend.read_all().unwrap(), b"kept");

        backend.set_fail_writes(false);
        assert!(backend.append(b"!").is_ok());
    }

    #[test]
    fn memory_truncate_and_replace() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.data(), b"hello");
        assert!(backend.truncate(100).is_err());

        backend.replace(b"compacted").unwrap();
        assert_eq!(backend.read_all().unwrap(), b"compacted");
    }
}
