//! # Tether Storage
//!
//! Byte-level storage backends for Tether.
//!
//! Backends are **opaque byte stores**: the entity store and the operation
//! queue in `tether_core` lay their framed record logs on top of them, and
//! the backends never interpret those bytes.
//!
//! ## Design Principles
//!
//! - Append-mostly: records are appended, then made durable with `flush`/`sync`
//! - Compaction swaps the whole content at once via `replace`
//! - Must be `Send + Sync` so stores can be shared across threads
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral stores; supports simulated
//!   restarts and write-failure injection
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use tether_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"queued op").unwrap();
//! assert_eq!(backend.read_at(offset, 9).unwrap(), b"queued op");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
