//! Status command implementation.

use super::{emit, open, CommandResult};
use crate::Format;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tether_core::{EntityStore, OperationQueue};

/// Summary of a data directory.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Data directory path.
    pub path: String,
    /// Number of local entities.
    pub entity_count: usize,
    /// Entity counts keyed by sync status.
    pub by_status: BTreeMap<String, usize>,
    /// Entity counts keyed by entity type.
    pub by_type: BTreeMap<String, usize>,
    /// Queued operations.
    pub queued_operations: usize,
    /// Queued operations that are parked.
    pub parked_operations: usize,
    /// Remote time up to which changes have been pulled.
    pub watermark: Option<DateTime<Utc>>,
}

/// Collects the status of the stores.
pub fn collect(
    path: &Path,
    store: &dyn EntityStore,
    queue: &dyn OperationQueue,
) -> CommandResult<StatusReport> {
    let records = store.get_all()?;
    let mut by_status = BTreeMap::new();
    let mut by_type = BTreeMap::new();
    for record in &records {
        *by_status
            .entry(record.sync_status.as_str().to_string())
            .or_insert(0) += 1;
        *by_type.entry(record.entity_type.clone()).or_insert(0) += 1;
    }

    let pending = queue.pending()?;
    Ok(StatusReport {
        path: path.display().to_string(),
        entity_count: records.len(),
        by_status,
        by_type,
        queued_operations: pending.len(),
        parked_operations: pending.iter().filter(|op| op.parked).count(),
        watermark: store.watermark()?,
    })
}

/// Runs the status command.
pub fn run(path: &Path, format: Format) -> CommandResult<()> {
    let (_dir, store, queue) = open(path)?;
    let report = collect(path, &store, &queue)?;

    emit(format, &report, |r| {
        println!("Data directory: {}", r.path);
        println!();
        println!("Entities:          {}", r.entity_count);
        for (status, count) in &r.by_status {
            println!("  {status:<16} {count}");
        }
        if !r.by_type.is_empty() {
            println!();
            println!("Entity types:");
            for (entity_type, count) in &r.by_type {
                println!("  {entity_type:<16} {count}");
            }
        }
        println!();
        println!("Queued operations: {}", r.queued_operations);
        println!("  parked:          {}", r.parked_operations);
        match r.watermark {
            Some(at) => println!("Pull watermark:    {}", at.to_rfc3339()),
            None => println!("Pull watermark:    (never pulled)"),
        }
    })
}
