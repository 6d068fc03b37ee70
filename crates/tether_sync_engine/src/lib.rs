//! # Tether Sync Engine
//!
//! Offline-first synchronization on top of the Tether core stores.
//!
//! This crate provides:
//! - Offline-first repository (typed local CRUD that queues every mutation)
//! - Sync service (FIFO push passes, pull with watermark, retry with backoff)
//! - Conflict resolution (last-write-wins, server/client wins, manual, merge)
//! - Remote transport abstraction with an in-memory mock and an HTTP mapping
//! - Background scheduler (on reconnect and on an interval)
//!
//! ## Architecture
//!
//! Application code talks only to the [`OfflineRepository`]. Every write
//! lands in the local [`EntityStore`](tether_core::EntityStore) and appends
//! a [`SyncOperation`](tether_core::SyncOperation) to the
//! [`OperationQueue`](tether_core::OperationQueue). The [`SyncService`]
//! drains the queue against a [`RemoteTransport`] and merges remote
//! changes back, deciding divergence with the [`ConflictResolver`].
//!
//! ## Key Invariants
//!
//! - Reads and writes never wait for the network
//! - Operations of one entity reach the remote in enqueue order
//! - At most one pass runs at a time; an operation is never sent twice
//!   concurrently
//! - An entity the remote never saw is deleted without any remote call
//! - Local storage failures surface to the caller; nothing is half-written

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod repository;
mod resolver;
mod scheduler;
mod service;
mod state;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult, TransportError, TransportResult};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpTransport};
pub use repository::{Entity, EntityWatch, OfflineRepository};
pub use resolver::{last_write_wins, ConflictResolver, ConflictStrategy, MergeFn, Resolution};
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use service::SyncService;
pub use state::{
    OperationOutcome, OperationReport, ServiceStatus, SkipReason, SyncReport, SyncState,
    SyncStats,
};
pub use transport::{MockTransport, RemoteAck, RemoteTombstone, RemoteTransport, TransportCall};
