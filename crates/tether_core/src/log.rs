//! Durable append-only record log.
//!
//! Both durable stores persist every mutation as one frame in a record log
//! and rebuild their in-memory state by replaying it on open.
//!
//! ```text
//! +-------+---------+--------+------------------+-------+
//! | magic | version | length | CBOR payload     | CRC32 |
//! | TLOG  | u16 LE  | u32 LE | `length` bytes   | u32 LE|
//! +-------+---------+--------+------------------+-------+
//! ```
//!
//! The CRC covers header and payload. A frame cut short by a crash can only
//! be the last one; replay drops it and truncates the log back to the last
//! complete frame.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tether_storage::StorageBackend;
use tracing::{debug, warn};

/// Magic bytes starting every frame.
pub const LOG_MAGIC: [u8; 4] = *b"TLOG";

/// Current frame format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
const HEADER_SIZE: usize = 10;

const CRC_SIZE: usize = 4;

/// Tuning for durable stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    /// Sync the backend after every append.
    pub sync_on_write: bool,
    /// Minimum number of frames before compaction is considered.
    pub compact_threshold: usize,
}

impl LogOptions {
    /// Sets whether every append is synced.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub fn with_compact_threshold(mut self, frames: usize) -> Self {
        self.compact_threshold = frames;
        self
    }
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            compact_threshold: 1024,
        }
    }
}

struct LogInner {
    backend: Box<dyn StorageBackend>,
    frames: usize,
}

/// An append-only log of CBOR-encoded records of type `T`.
pub struct RecordLog<T> {
    inner: Mutex<LogInner>,
    options: LogOptions,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Serialize + DeserializeOwned> RecordLog<T> {
    /// Opens a log over `backend` and replays it.
    ///
    /// Returns the log and every record it holds, in append order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupted`] if a frame before the tail fails its
    /// checksum or cannot be decoded, or a storage error.
    pub fn open(mut backend: Box<dyn StorageBackend>, options: LogOptions) -> CoreResult<(Self, Vec<T>)> {
        let data = backend.read_all()?;
        let (records, valid_len) = Self::replay(&data)?;

        if valid_len < data.len() {
            warn!(
                valid_len,
                total_len = data.len(),
                "dropping torn frame at end of record log"
            );
            backend.truncate(valid_len as u64)?;
        }

        debug!(frames = records.len(), "record log replayed");

        let log = Self {
            inner: Mutex::new(LogInner {
                backend,
                frames: records.len(),
            }),
            options,
            _marker: PhantomData,
        };
        Ok((log, records))
    }

    /// Appends one record.
    ///
    /// On failure nothing is left behind: a partially written frame is cut
    /// off before the error is returned.
    pub fn append(&self, record: &T) -> CoreResult<()> {
        let frame = encode_frame(record)?;

        let mut inner = self.inner.lock();
        let before = inner.backend.size()?;

        let mut written = inner.backend.append(&frame).map(|_| ());
        if written.is_ok() {
            written = if self.options.sync_on_write {
                inner.backend.sync()
            } else {
                inner.backend.flush()
            };
        }

        if let Err(e) = written {
            if inner.backend.size().map_or(false, |size| size > before) {
                let _ = inner.backend.truncate(before);
            }
            return Err(e.into());
        }

        inner.frames += 1;
        Ok(())
    }

    /// Replaces the whole log with `records`.
    pub fn rewrite(&self, records: &[T]) -> CoreResult<()> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&encode_frame(record)?);
        }

        let mut inner = self.inner.lock();
        inner.backend.replace(&data)?;
        inner.backend.sync()?;
        inner.frames = records.len();

        debug!(frames = records.len(), bytes = data.len(), "record log compacted");
        Ok(())
    }

    /// Returns the number of frames currently in the log.
    pub fn frames(&self) -> usize {
        self.inner.lock().frames
    }

    /// Returns true if the log has grown enough, relative to `live` records,
    /// to be worth compacting.
    pub fn should_compact(&self, live: usize) -> bool {
        let frames = self.frames();
        frames > self.options.compact_threshold && frames > live.saturating_mul(2)
    }

    /// Returns the options this log was opened with.
    pub fn options(&self) -> LogOptions {
        self.options
    }

    fn replay(data: &[u8]) -> CoreResult<(Vec<T>, usize)> {
        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            let remaining = &data[offset..];
            if remaining.len() < HEADER_SIZE {
                break;
            }

            if remaining[0..4] != LOG_MAGIC {
                return Err(CoreError::corrupted(offset as u64, "bad frame magic"));
            }

            let version = u16::from_le_bytes([remaining[4], remaining[5]]);
            if version != LOG_VERSION {
                return Err(CoreError::corrupted(
                    offset as u64,
                    format!("unsupported frame version {version}"),
                ));
            }

            let len = u32::from_le_bytes([remaining[6], remaining[7], remaining[8], remaining[9]])
                as usize;
            let frame_len = HEADER_SIZE + len + CRC_SIZE;
            if remaining.len() < frame_len {
                break;
            }

            let body = &remaining[..HEADER_SIZE + len];
            let crc_bytes = &remaining[HEADER_SIZE + len..frame_len];
            let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

            if stored != compute_crc32(body) {
                if offset + frame_len == data.len() {
                    // Last frame: an interrupted write, not corruption.
                    break;
                }
                return Err(CoreError::corrupted(offset as u64, "checksum mismatch"));
            }

            let record: T = ciborium::from_reader(&body[HEADER_SIZE..])
                .map_err(|e| CoreError::corrupted(offset as u64, e.to_string()))?;
            records.push(record);
            offset += frame_len;
        }

        Ok((records, offset))
    }
}

fn encode_frame<T: Serialize>(record: &T) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(record, &mut payload).map_err(|e| CoreError::codec(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::codec("record larger than 4 GiB"))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&LOG_MAGIC);
    frame.extend_from_slice(&LOG_VERSION.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);

    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Computes the CRC32 (IEEE polynomial) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
