//! docvault - Main entry point
//!
//! Backs up collections of a JSON-lines record store, restores them and
//! runs the tier scheduler as a daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docvault::daemon::shutdown::ShutdownCoordinator;
use docvault::restore::RestoreRequest;
use docvault::store::JsonDirStore;
use docvault::{utils, BackupRequest, Config, FormatKind, Tier, Vault};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Directory of <collection>.jsonl files acting as the record store
    #[arg(long, value_name = "DIR", global = true, default_value = "./data")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backup now
    Backup {
        /// daily, weekly or monthly; omit for a manual run
        #[arg(long)]
        tier: Option<Tier>,

        /// Comma-separated include list
        #[arg(long, value_delimiter = ',')]
        collections: Option<Vec<String>>,

        /// Comma-separated formats (sql, bson, xlsx)
        #[arg(long, value_delimiter = ',')]
        formats: Option<Vec<FormatKind>>,

        /// Resolve collections without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore a backup into the record store
    Restore {
        /// `{tier}/{collection}_{timestamp}`, `{tier}/{file}` or a path
        backup_id: String,

        /// sql, bson, xlsx or auto
        #[arg(long, default_value = "auto")]
        format: String,

        /// Target collection (defaults to the backed-up collection)
        #[arg(long)]
        target: Option<String>,

        /// Replace records that already exist
        #[arg(long)]
        overwrite: bool,
    },
    /// List past runs, newest first
    History,
    /// List artifact groups
    Artifacts {
        #[arg(long)]
        tier: Option<Tier>,
    },
    /// Delete a backup
    Delete { backup_id: String },
    /// Show per-tier schedule status
    Status,
    /// Run the scheduler until SIGINT/SIGTERM
    Daemon,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting docvault v{} (root: {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.root.display()
    );

    let store = Arc::new(JsonDirStore::new(&args.store_dir));
    let vault = Vault::new(config, store).await?;

    match args.command {
        Command::Backup {
            tier,
            collections,
            formats,
            dry_run,
        } => {
            let log = vault
                .trigger_backup(BackupRequest {
                    tier,
                    collections,
                    formats,
                    dry_run,
                })
                .await?;
            print_json(&log)?;
        }
        Command::Restore {
            backup_id,
            format,
            target,
            overwrite,
        } => {
            let format = match format.as_str() {
                "auto" => None,
                other => Some(other.parse::<FormatKind>()?),
            };
            let result = vault
                .trigger_restore(RestoreRequest {
                    backup_id,
                    format,
                    target_collection: target,
                    overwrite,
                })
                .await?;
            print_json(&result)?;
        }
        Command::History => print_json(&vault.list_history().await?)?,
        Command::Artifacts { tier } => print_json(&vault.list_artifacts(tier).await?)?,
        Command::Delete { backup_id } => print_json(&vault.delete_backup(&backup_id).await?)?,
        Command::Status => print_json(&vault.status().await)?,
        Command::Daemon => {
            let shutdown = ShutdownCoordinator::new();
            let scheduler = vault.scheduler();
            let token = shutdown.token();
            let handle = tokio::spawn(async move { scheduler.run(token).await });

            // the scheduler cancels and awaits in-flight runs once the token fires
            shutdown.wait_for_signal().await;
            shutdown.drain(handle, Duration::from_secs(30)).await;
        }
    }

    Ok(())
}
