//! Chunk Backup - Main entry point
//!
//! Uploads a directory as a new recovery point, or restores one by id.

use anyhow::{Context, Result};
use chunk_backup::{
    config::Config, shutdown::ShutdownCoordinator, utils, BlobStore, Repository, RestoreExecutor,
    S3Store, UploadExecutor,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a directory as a new recovery point
    Upload {
        /// Directory to back up
        path: PathBuf,
    },

    /// Restore a recovery point into a directory
    Restore {
        /// Recovery point id printed by `upload`
        recovery_point_id: String,

        /// Destination directory
        dest_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration (file, .env, environment)
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting chunk-backup v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn BlobStore> = Arc::new(S3Store::new(&config.storage));
    let repository = Repository::new(&config.cache.dir);

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.listen();

    let outcome = match args.command {
        Command::Upload { path } => {
            let executor = UploadExecutor::with_cancel(
                store,
                config.storage.bucket.clone(),
                repository,
                config.chunker,
                shutdown.token(),
            );
            executor
                .execute(&path)
                .await
                .map(|result| println!("{}", result.recovery_point_id))
                .with_context(|| format!("upload of {} failed", path.display()))
        }
        Command::Restore {
            recovery_point_id,
            dest_dir,
        } => {
            let executor = RestoreExecutor::with_cancel(
                store,
                config.storage.bucket.clone(),
                repository,
                config.restore.concurrency,
                shutdown.token(),
            );
            executor
                .execute(&recovery_point_id, &dest_dir)
                .await
                .map(|_| ())
                .with_context(|| {
                    format!("restore of {} into {} failed", recovery_point_id, dest_dir.display())
                })
        }
    };

    // Stop the signal listener
    shutdown.trigger();
    let _ = listener.await;

    outcome
}
