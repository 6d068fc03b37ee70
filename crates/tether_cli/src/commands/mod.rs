//! CLI command implementations.

pub mod compact;
pub mod entities;
pub mod prune;
pub mod queue;
pub mod status;

use crate::Format;
use serde::Serialize;
use std::path::Path;
use tether_core::{DataDir, LogEntityStore, LogOptions, LogQueue};

/// Result type shared by the commands.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Opens an existing data directory and its stores.
///
/// The directory lock is held for the lifetime of the returned [`DataDir`];
/// this fails while a sync worker has the directory open.
pub fn open(path: &Path) -> CommandResult<(DataDir, LogEntityStore, LogQueue)> {
    let dir = DataDir::open(path, false)?;
    let (store, queue) = dir.open_stores(LogOptions::default())?;
    Ok((dir, store, queue))
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> CommandResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints `value` as JSON or runs `text` to print it for humans.
pub fn emit<T: Serialize>(format: Format, value: &T, text: impl FnOnce(&T)) -> CommandResult<()> {
    match format {
        Format::Json => print_json(value),
        Format::Text => {
            text(value);
            Ok(())
        }
    }
}
