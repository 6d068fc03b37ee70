//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// Data survives process restarts once [`StorageBackend::sync`] returns.
///
/// # Compaction
///
/// [`StorageBackend::replace`] writes the new content to a sibling
/// `<name>.compact` file, syncs it, and renames it over the original. A crash
/// before the rename leaves the old log intact; a leftover `.compact` file is
/// ignored and overwritten by the next compaction.
///
/// # Example
///
/// ```no_run
/// use tether_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("queue.log")).unwrap();
/// backend.append(b"frame").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = Self::open_file(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(path: &Path) -> StorageResult<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    fn compaction_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".compact");
        self.path.with_file_name(name)
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.write();
        let mut size = self.size.write();

        let offset = *size;
        if data.is_empty() {
            return Ok(offset);
        }

        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        *size += data.len() as u64;

        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.write().flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.write().sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: *size,
            });
        }

        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;

        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let staging = self.compaction_path();
        {
            let mut tmp = File::create(&staging)?;
            tmp.write_all(data)?;
            tmp.sync_all()?;
        }

        let mut file = self.file.write();
        let mut size = self.size.write();

        fs::rename(&staging, &self.path)?;
        *file = Self::open_file(&self.path)?;
        *size = data.len() as u64;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entities.log");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_append_and_read_all() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let mut backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);

        assert_eq!(backend.read_all().unwrap(), b"hello world");
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("x.log")).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(3, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entities.log");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"persistent frame").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"persistent frame");
    }

    #[test]
    fn file_truncate_drops_tail() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("x.log")).unwrap();
        backend.append(b"complete|torn").unwrap();

        backend.truncate(8).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"complete");
        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::InvalidTruncate { .. })
        ));
    }

    #[test]
    fn file_replace_swaps_content_and_keeps_appending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"old old old old").unwrap();
        backend.replace(b"snapshot").unwrap();
        assert_eq!(backend.size().unwrap(), 8);

        backend.append(b"+next").unwrap();
        backend.sync().unwrap();
        drop(backend);

        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.read_all().unwrap(), b"snapshot+next");
        assert!(!dir.path().join("queue.log.compact").exists());
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data").join("queue.log");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.path(), path);
        assert!(path.exists());
    }
}
