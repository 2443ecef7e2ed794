//! Restore executor: rebuild a tree from a recovery point.
//!
//! Directories are created first, in path order, owner-writable and with
//! their recorded ownership. Files and symlinks are then reconstructed in
//! parallel, gated by a fixed-size semaphore. The first failing node cancels
//! a shared token: the dispatcher stops handing out work and tasks that have
//! not passed their entry checkpoint exit without touching the filesystem.
//! Directory modes and times go on last, deepest first, so a read-only
//! directory still accepts its children.

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::run_blocking;
use crate::chunker::{content_key, FileDigest};
use crate::fs::metadata::{apply_mode, apply_ownership, apply_times};
use crate::index::{Index, Node, NodeType, Repository};
use crate::storage::{index_key, BlobStore};
use crate::utils::errors::{BackupError, Result};

/// Default number of nodes reconstructed concurrently
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Restore statistics
#[derive(Debug, Clone, Default)]
pub struct RestoreResult {
    pub recovery_point_id: String,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    /// Destinations left alone because something already exists there
    pub skipped: usize,
    pub bytes_written: u64,
    pub duration: Duration,
}

/// What happened to one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOutcome {
    Skipped,
    Directory,
    Symlink,
    File { bytes: u64 },
}

impl RestoreResult {
    fn record(&mut self, outcome: NodeOutcome) {
        match outcome {
            NodeOutcome::Skipped => self.skipped += 1,
            NodeOutcome::Directory => self.directories += 1,
            NodeOutcome::Symlink => self.symlinks += 1,
            NodeOutcome::File { bytes } => {
                self.files += 1;
                self.bytes_written += bytes;
            }
        }
    }
}

/// State shared by every restore task
struct TaskContext {
    store: Arc<dyn BlobStore>,
    bucket: String,
}

/// A directory created by this run, finished once its children exist
#[derive(Debug)]
struct CreatedDir {
    path: PathBuf,
    mode: u32,
    access_time: DateTime<Utc>,
    mod_time: DateTime<Utc>,
}

/// Main restore executor
pub struct RestoreExecutor {
    store: Arc<dyn BlobStore>,
    bucket: String,
    repository: Repository,
    concurrency: usize,
    cancel_token: CancellationToken,
}

impl RestoreExecutor {
    /// Create a new restore executor (no external cancellation)
    pub fn new(
        store: Arc<dyn BlobStore>,
        bucket: impl Into<String>,
        repository: Repository,
        concurrency: usize,
    ) -> Self {
        Self::with_cancel(store, bucket, repository, concurrency, CancellationToken::new())
    }

    /// Create a new restore executor that also stops when `cancel_token` fires
    pub fn with_cancel(
        store: Arc<dyn BlobStore>,
        bucket: impl Into<String>,
        repository: Repository,
        concurrency: usize,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            repository,
            concurrency: concurrency.max(1),
            cancel_token,
        }
    }

    /// Restore `recovery_point_id` into `dest_dir`.
    ///
    /// Existing destinations are never overwritten, so running the same
    /// restore twice is a no-op the second time.
    pub async fn execute(&self, recovery_point_id: &str, dest_dir: &Path) -> Result<RestoreResult> {
        let start_time = Instant::now();
        let index = self.resolve_index(recovery_point_id).await?;
        let dest = fs::canonicalize(dest_dir).unwrap_or_else(|_| dest_dir.to_path_buf());

        info!(
            "Restoring recovery point {} ({} entries) to {}",
            recovery_point_id,
            index.len(),
            dest.display()
        );

        let mut result = RestoreResult {
            recovery_point_id: recovery_point_id.to_string(),
            ..Default::default()
        };

        // One token for the whole run; cancelling it never touches the caller's.
        let cancel = self.cancel_token.child_token();

        let created_dirs = self.restore_directories(&index, &dest, &cancel, &mut result).await?;
        self.restore_entries(&index, &dest, &cancel, &mut result).await?;

        // Writing children bumped the parents' mtimes, and a read-only parent
        // would have refused them; finish directories last, deepest first.
        run_blocking(move || finish_directories(&created_dirs)).await?;

        result.duration = start_time.elapsed();
        info!(
            "Restore completed: {} files ({} bytes), {} directories, {} symlinks, {} skipped in {:.1}s",
            result.files,
            result.bytes_written,
            result.directories,
            result.symlinks,
            result.skipped,
            result.duration.as_secs_f64()
        );

        Ok(result)
    }

    /// Load the index from the local cache, else fetch and cache the remote copy.
    async fn resolve_index(&self, recovery_point_id: &str) -> Result<Index> {
        if let Some(index) = self.repository.load_index(recovery_point_id)? {
            debug!("Using cached index for {}", recovery_point_id);
            return Ok(index);
        }

        let key = index_key(recovery_point_id);
        info!("Get {} from storage", key);

        let data = match self.store.get(&self.bucket, &key).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                return Err(BackupError::IndexNotFound(recovery_point_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let index = Index::from_json(&data)?;
        if index.recovery_point_id != recovery_point_id {
            return Err(BackupError::Integrity(format!(
                "index stored under {} belongs to {}",
                recovery_point_id, index.recovery_point_id
            )));
        }

        self.repository.store_raw(recovery_point_id, &data)?;
        Ok(index)
    }

    /// Create missing directories in path order, parents before children.
    ///
    /// Returns the directories created by this run, in creation order.
    async fn restore_directories(
        &self,
        index: &Index,
        dest: &Path,
        cancel: &CancellationToken,
        result: &mut RestoreResult,
    ) -> Result<Vec<CreatedDir>> {
        let dirs: Vec<(Node, PathBuf)> = index
            .nodes()
            .filter(|n| n.node_type == NodeType::Dir)
            .map(|n| (n.clone(), n.restore_path(dest)))
            .collect();
        let cancel = cancel.clone();

        let (created, skipped) = run_blocking(move || {
            let mut created = Vec::new();
            let mut skipped = 0usize;

            for (node, target) in dirs {
                if cancel.is_cancelled() {
                    return Err(BackupError::Cancelled);
                }

                match restore_directory(&node, &target) {
                    Ok(NodeOutcome::Directory) => created.push(CreatedDir {
                        path: target,
                        mode: node.mode,
                        access_time: node.access_time,
                        mod_time: node.mod_time,
                    }),
                    Ok(_) => skipped += 1,
                    Err(e) => {
                        error!("Restore directory {} failed: {}", target.display(), e);
                        return Err(e);
                    }
                }
            }

            Ok((created, skipped))
        })
        .await?;

        result.directories += created.len();
        result.skipped += skipped;
        Ok(created)
    }

    /// Restore files and symlinks with bounded parallelism.
    async fn restore_entries(
        &self,
        index: &Index,
        dest: &Path,
        cancel: &CancellationToken,
        result: &mut RestoreResult,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let context = Arc::new(TaskContext {
            store: Arc::clone(&self.store),
            bucket: self.bucket.clone(),
        });
        let mut tasks = JoinSet::new();
        let mut first_error: Option<BackupError> = None;

        for node in index.nodes().filter(|n| n.node_type != NodeType::Dir) {
            // Wait for a permit, unless a sibling already failed.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| io::Error::other(format!("semaphore closed: {}", e)))?
                }
            };

            if cancel.is_cancelled() {
                break;
            }

            let node = node.clone();
            let target = node.restore_path(dest);
            let context = Arc::clone(&context);
            let task_cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let outcome = restore_node(&context, &node, &target, &task_cancel).await;
                if let Err(e) = &outcome {
                    if !e.is_cancelled() {
                        warn!("Restore {} failed: {}", target.display(), e);
                        task_cancel.cancel();
                    }
                }
                outcome
            });

            while let Some(joined) = tasks.try_join_next() {
                collect(joined, cancel, result, &mut first_error);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, cancel, result, &mut first_error);
        }

        match first_error {
            Some(e) => {
                error!("Restore aborted: {}", e);
                Err(e)
            }
            None if cancel.is_cancelled() => Err(BackupError::Cancelled),
            None => Ok(()),
        }
    }
}

/// Fold one finished task into the running result, keeping the first real error.
fn collect(
    joined: std::result::Result<Result<NodeOutcome>, JoinError>,
    cancel: &CancellationToken,
    result: &mut RestoreResult,
    first_error: &mut Option<BackupError>,
) {
    match joined {
        Ok(Ok(outcome)) => result.record(outcome),
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => {
            first_error.get_or_insert(e);
        }
        Err(e) => {
            cancel.cancel();
            first_error.get_or_insert(BackupError::Io(io::Error::other(format!(
                "restore task panicked: {}",
                e
            ))));
        }
    }
}

/// Dispatch one node by type. Cancellation is only observed here, before
/// any work starts; once started a node runs to completion.
async fn restore_node(
    context: &TaskContext,
    node: &Node,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<NodeOutcome> {
    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled);
    }

    match node.node_type {
        NodeType::File => restore_file(context, node, target).await,
        NodeType::Symlink => {
            let node = node.clone();
            let target = target.to_path_buf();
            run_blocking(move || restore_symlink(&node, &target)).await
        }
        NodeType::Dir => Err(BackupError::Integrity(format!(
            "directory {} dispatched after the directory phase",
            target.display()
        ))),
    }
}

/// `lstat`-based existence: a dangling symlink still counts as present.
fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::DirBuilder::new().recursive(true).mode(0o700).create(parent)
        }
        _ => Ok(()),
    }
}

fn restore_symlink(node: &Node, target: &Path) -> Result<NodeOutcome> {
    if path_exists(target)? {
        debug!("Symlink exists {}", target.display());
        return Ok(NodeOutcome::Skipped);
    }

    let link_target = node.link_target.as_ref().ok_or_else(|| {
        BackupError::Integrity(format!("symlink {} has no target", node.absolute_path.display()))
    })?;

    debug!("Symlink not exist, create {}", target.display());
    create_parent(target)?;
    std::os::unix::fs::symlink(link_target, target)?;
    apply_ownership(target, node.uid, node.gid)?;

    Ok(NodeOutcome::Symlink)
}

/// Create a directory owner-writable with its recorded ownership.
///
/// The recorded mode is applied by [`finish_directories`] once the
/// directory's children are in place.
fn restore_directory(node: &Node, target: &Path) -> Result<NodeOutcome> {
    if path_exists(target)? {
        debug!("Directory exists {}", target.display());
        return Ok(NodeOutcome::Skipped);
    }

    debug!("Directory not exist, create {}", target.display());
    fs::DirBuilder::new().recursive(true).mode(0o700).create(target)?;
    apply_ownership(target, node.uid, node.gid)?;

    Ok(NodeOutcome::Directory)
}

/// Apply recorded modes and times to created directories, deepest first.
fn finish_directories(created: &[CreatedDir]) -> Result<()> {
    for dir in created.iter().rev() {
        apply_mode(&dir.path, dir.mode)?;
        apply_times(&dir.path, dir.access_time, dir.mod_time)?;
    }
    Ok(())
}

async fn restore_file(context: &TaskContext, node: &Node, target: &Path) -> Result<NodeOutcome> {
    let path = target.to_path_buf();
    let created = run_blocking(move || {
        if path_exists(&path)? {
            debug!("File exists {}", path.display());
            return Ok(None);
        }

        debug!("File not exist, create {}", path.display());
        create_parent(&path)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Some(Arc::new(file)))
    })
    .await?;

    let Some(file) = created else {
        return Ok(NodeOutcome::Skipped);
    };

    match write_file(context, node, target, file).await {
        Ok(bytes) => Ok(NodeOutcome::File { bytes }),
        Err(e) => {
            // Leave no half-written file behind for a later run to skip over.
            let path = target.to_path_buf();
            if let Err(rm_err) = run_blocking(move || Ok(fs::remove_file(&path)?)).await {
                warn!("Failed to remove partial file {}: {}", target.display(), rm_err);
            }
            Err(e)
        }
    }
}

/// Fill a freshly created file from its chunks, then reapply metadata.
async fn write_file(
    context: &TaskContext,
    node: &Node,
    target: &Path,
    file: Arc<fs::File>,
) -> Result<u64> {
    let (mode, uid, gid) = (node.mode, node.uid, node.gid);
    let path = target.to_path_buf();
    run_blocking(move || {
        apply_mode(&path, mode)?;
        apply_ownership(&path, uid, gid)?;
        Ok(())
    })
    .await?;

    let mut digest = FileDigest::new();
    let mut written = 0u64;

    for chunk in &node.content {
        let data = context.store.get(&context.bucket, &chunk.key).await?;

        if data.len() as u64 != chunk.length || content_key(&data) != chunk.key {
            return Err(BackupError::Integrity(format!(
                "chunk {} of {} does not match its key",
                chunk.key,
                node.absolute_path.display()
            )));
        }

        digest.update(&data);
        let file = Arc::clone(&file);
        let start = chunk.start;
        run_blocking(move || Ok(file.write_all_at(&data, start)?)).await?;
        written += chunk.length;
    }

    if let Some(expected) = &node.sha256 {
        let actual = digest.finalize_hex();
        if &actual != expected {
            return Err(BackupError::Integrity(format!(
                "{} restored with sha256 {} but {} was recorded",
                target.display(),
                actual,
                expected
            )));
        }
    }

    // Content writes touched the times; metadata goes last.
    let (atime, mtime) = (node.access_time, node.mod_time);
    let path = target.to_path_buf();
    run_blocking(move || {
        apply_mode(&path, mode)?;
        apply_ownership(&path, uid, gid)?;
        apply_times(&path, atime, mtime)?;
        Ok(())
    })
    .await?;

    Ok(written)
}
