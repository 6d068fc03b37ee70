//! Tether CLI
//!
//! Command-line tools for inspecting and maintaining a Tether data directory.
//!
//! # Commands
//!
//! - `status` - Entity counts per sync status, queue length and watermark
//! - `entities` - List local entities
//! - `queue` - List queued sync operations
//! - `prune` - Drop exhausted or parked operations older than a given age
//! - `compact` - Rewrite the record logs to their live contents

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tether data directory tools.
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format
    #[arg(global = true, short, long, value_enum, default_value = "text")]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

/// Output format of listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// JSON via serde_json
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show entity counts per sync status, queue length and pull watermark
    Status,

    /// List local entities
    Entities {
        /// Only entities with unsynced changes, failures or conflicts
        #[arg(long)]
        pending: bool,

        /// Only entities of this type
        #[arg(short = 't', long = "type")]
        entity_type: Option<String>,
    },

    /// List queued sync operations in dispatch order
    Queue,

    /// Drop exhausted or parked operations older than the given age
    Prune {
        /// Minimum age in hours
        #[arg(long, default_value = "168")]
        max_age_hours: i64,

        /// Retry budget the sync service runs with
        #[arg(long, default_value = "3")]
        max_retries: u32,
    },

    /// Rewrite the entity and queue logs to their live contents
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Status => {
            let path = cli.path.ok_or("Data directory path required for status")?;
            commands::status::run(&path, cli.format)?;
        }
        Commands::Entities {
            pending,
            entity_type,
        } => {
            let path = cli.path.ok_or("Data directory path required for entities")?;
            commands::entities::run(&path, pending, entity_type.as_deref(), cli.format)?;
        }
        Commands::Queue => {
            let path = cli.path.ok_or("Data directory path required for queue")?;
            commands::queue::run(&path, cli.format)?;
        }
        Commands::Prune {
            max_age_hours,
            max_retries,
        } => {
            let path = cli.path.ok_or("Data directory path required for prune")?;
            commands::prune::run(&path, max_age_hours, max_retries, cli.format)?;
        }
        Commands::Compact => {
            let path = cli.path.ok_or("Data directory path required for compact")?;
            commands::compact::run(&path, cli.format)?;
        }
        Commands::Version => {
            println!("Tether CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
