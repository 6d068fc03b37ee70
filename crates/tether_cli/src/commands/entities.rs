//! Entities command implementation.

use super::{emit, open, CommandResult};
use crate::Format;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tether_core::{EntityRecord, EntityStore};

/// One listed entity.
#[derive(Debug, Serialize)]
pub struct EntityRow {
    /// Local id.
    pub local_id: String,
    /// Entity type.
    pub entity_type: String,
    /// Remote id, once acknowledged.
    pub remote_id: Option<String>,
    /// Sync status.
    pub sync_status: String,
    /// Local modification time.
    pub local_updated_at: DateTime<Utc>,
    /// Last known remote modification time.
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// Local version counter.
    pub version: u64,
    /// Entity payload.
    pub payload: Value,
}

impl From<EntityRecord> for EntityRow {
    fn from(record: EntityRecord) -> Self {
        Self {
            local_id: record.local_id.to_string(),
            entity_type: record.entity_type,
            remote_id: record.remote_id.map(|id| id.to_string()),
            sync_status: record.sync_status.as_str().to_string(),
            local_updated_at: record.local_updated_at,
            remote_updated_at: record.remote_updated_at,
            version: record.version,
            payload: record.payload,
        }
    }
}

/// Lists entities, oldest local change first.
pub fn collect(
    store: &dyn EntityStore,
    pending_only: bool,
    entity_type: Option<&str>,
) -> CommandResult<Vec<EntityRow>> {
    let mut records = match (pending_only, entity_type) {
        (true, _) => store.get_pending()?,
        (false, Some(entity_type)) => store.get_all_of_type(entity_type)?,
        (false, None) => store.get_all()?,
    };
    if let Some(entity_type) = entity_type {
        records.retain(|r| r.entity_type == entity_type);
    }
    records.sort_by_key(|r| (r.local_updated_at, r.local_id));

    Ok(records.into_iter().map(EntityRow::from).collect())
}

/// Runs the entities command.
pub fn run(
    path: &Path,
    pending_only: bool,
    entity_type: Option<&str>,
    format: Format,
) -> CommandResult<()> {
    let (_dir, store, _queue) = open(path)?;
    let rows = collect(&store, pending_only, entity_type)?;

    emit(format, &rows, |rows| {
        if rows.is_empty() {
            println!("No entities");
            return;
        }
        println!(
            "{:<36}  {:<12}  {:<14}  {:>7}  REMOTE ID",
            "LOCAL ID", "TYPE", "STATUS", "VERSION"
        );
        for row in rows {
            println!(
                "{:<36}  {:<12}  {:<14}  {:>7}  {}",
                row.local_id,
                row.entity_type,
                row.sync_status,
                row.version,
                row.remote_id.as_deref().unwrap_or("-")
            );
        }
        println!();
        println!("{} entities", rows.len());
    })
}
