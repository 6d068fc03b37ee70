//! # Tether Core
//!
//! Local state of the Tether offline-first sync engine.
//!
//! This crate provides:
//! - Entity records with sync metadata and the sync status lifecycle
//! - Sync operations: queued intents to propagate local mutations
//! - [`EntityStore`]: local keyed storage with a watch capability
//! - [`OperationQueue`]: the ordered, durable log of pending mutations
//! - A CRC-checked append-only record log backing the durable stores
//! - Data directory locking (one sync worker per directory)
//!
//! ## Key Invariants
//!
//! - Every write is durable before it is visible
//! - Operations for one entity are returned in enqueue order
//! - The store and the queue refer to each other only through [`LocalId`]
//! - An entity without a remote id is never `PendingUpdate`, `PendingDelete`
//!   or `Synced`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod clock;
mod dir;
mod entity;
mod error;
mod log;
mod operation;
mod queue;
mod store;
mod types;

pub use change_feed::ChangeFeed;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dir::DataDir;
pub use entity::{EntityRecord, RemoteEntity, SyncStatus};
pub use error::{CoreError, CoreResult};
pub use log::{compute_crc32, LogOptions, RecordLog, LOG_MAGIC, LOG_VERSION};
pub use operation::{OperationType, SyncOperation};
pub use queue::{LogQueue, MemoryQueue, OperationQueue};
pub use store::{EntityStore, LogEntityStore, MemoryEntityStore, Mutation};
pub use types::{LocalId, OperationId, RemoteId};
