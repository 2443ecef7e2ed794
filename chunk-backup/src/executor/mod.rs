//! Backup and restore executors.
//!
//! - [`upload`]: walk a tree, chunk every file, upload unseen chunks and
//!   publish the manifest of a new recovery point.
//! - [`restore`]: resolve a recovery point and rebuild its tree with bounded
//!   parallelism.

pub mod restore;
pub mod upload;

pub use restore::{RestoreExecutor, RestoreResult, DEFAULT_CONCURRENCY};
pub use upload::{UploadExecutor, UploadResult};

use crate::utils::errors::Result;

/// Run filesystem work on the blocking pool, off the async workers.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(std::io::Error::other)?
}
