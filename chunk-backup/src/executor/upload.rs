//! Upload executor: walk, chunk, deduplicate, publish.
//!
//! Files are processed one at a time and their chunks strictly in order, so
//! only one chunk buffer is alive at any point and the running file digest
//! sees bytes in file order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::run_blocking;
use crate::chunker::{content_key, FileChunker, FileDigest};
use crate::config::ChunkerConfig;
use crate::fs::walker::walk_directory;
use crate::index::{ChunkInfo, Index, Node, Repository};
use crate::storage::{index_key, BlobStore};
use crate::utils::errors::{BackupError, Result};

/// Upload statistics
#[derive(Debug, Clone, Default)]
pub struct UploadResult {
    pub recovery_point_id: String,
    /// Entries recorded in the index
    pub total_entries: usize,
    /// Non-directory entries
    pub total_files: u64,
    /// Regular files chunked
    pub processed_files: usize,
    pub total_chunks: usize,
    pub uploaded_chunks: usize,
    pub deduplicated_chunks: usize,
    pub uploaded_bytes: u64,
    pub deduplicated_bytes: u64,
    pub duration: Duration,
}

/// Main upload executor
pub struct UploadExecutor {
    store: Arc<dyn BlobStore>,
    bucket: String,
    repository: Repository,
    chunker: ChunkerConfig,
    cancel_token: CancellationToken,
}

impl UploadExecutor {
    /// Create a new upload executor (no cancellation support)
    pub fn new(
        store: Arc<dyn BlobStore>,
        bucket: impl Into<String>,
        repository: Repository,
        chunker: ChunkerConfig,
    ) -> Self {
        Self::with_cancel(store, bucket, repository, chunker, CancellationToken::new())
    }

    /// Create a new upload executor with cancellation support
    pub fn with_cancel(
        store: Arc<dyn BlobStore>,
        bucket: impl Into<String>,
        repository: Repository,
        chunker: ChunkerConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            repository,
            chunker,
            cancel_token,
        }
    }

    /// Back up `source` as a new recovery point.
    ///
    /// Nothing becomes resolvable remotely unless every file uploaded and the
    /// manifest push succeeded.
    pub async fn execute(&self, source: &Path) -> Result<UploadResult> {
        let start_time = Instant::now();
        let recovery_point_id = Uuid::new_v4().to_string();
        let root = std::fs::canonicalize(source)?;

        info!("Starting upload of {} as recovery point {}", root.display(), recovery_point_id);

        // Use blocking task for the directory walk
        let walk_root = root.clone();
        let walk_id = recovery_point_id.clone();
        let mut index = run_blocking(move || walk_directory(&walk_root, &walk_id)).await?;

        info!(
            "Scanned {}: {} entries, {} non-directories",
            root.display(),
            index.len(),
            index.total_files
        );
        self.repository.save_index(&index)?;

        let mut result = UploadResult {
            recovery_point_id: recovery_point_id.clone(),
            total_entries: index.len(),
            total_files: index.total_files,
            ..Default::default()
        };

        let file_paths: Vec<PathBuf> = index
            .items
            .iter()
            .filter(|(_, node)| node.is_file())
            .map(|(path, _)| path.clone())
            .collect();

        for path in &file_paths {
            if self.cancel_token.is_cancelled() {
                info!("Upload cancelled after {} files", result.processed_files);
                return Err(BackupError::Cancelled);
            }

            let Some(node) = index.items.get_mut(path) else {
                continue;
            };

            if let Err(e) = self.upload_file(node, &mut result).await {
                error!("Failed to upload {}: {}", path.display(), e);
                return Err(e);
            }
            result.processed_files += 1;

            // Keep local progress after every file.
            self.repository.save_index(&index)?;
        }

        self.publish_index(&index).await?;

        result.duration = start_time.elapsed();
        info!(
            "Upload completed: recovery point {}, {} files, {} chunks ({} uploaded, {} deduplicated), {} bytes sent in {:.1}s",
            recovery_point_id,
            result.processed_files,
            result.total_chunks,
            result.uploaded_chunks,
            result.deduplicated_chunks,
            result.uploaded_bytes,
            result.duration.as_secs_f64()
        );

        Ok(result)
    }

    /// Chunk one file, pushing every chunk the store does not know yet.
    async fn upload_file(&self, node: &mut Node, result: &mut UploadResult) -> Result<()> {
        let path = node.absolute_path.clone();
        let config = self.chunker;
        let mut chunker =
            run_blocking(move || Ok(FileChunker::new(std::fs::File::open(&path)?, &config))).await?;
        let mut digest = FileDigest::new();
        let mut content = Vec::new();

        debug!("Processing file: {}", node.absolute_path.display());

        loop {
            if self.cancel_token.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            // Read and key the next chunk on the blocking pool.
            let (returned, next) = run_blocking(move || {
                let next = chunker.next().transpose()?.map(|chunk| {
                    let key = content_key(&chunk.data);
                    (chunk, key)
                });
                Ok((chunker, next))
            })
            .await?;
            chunker = returned;

            let Some((chunk, key)) = next else {
                break;
            };
            digest.update(&chunk.data);

            if self.put_if_absent(&key, &chunk.data).await? {
                result.uploaded_chunks += 1;
                result.uploaded_bytes += chunk.len();
            } else {
                result.deduplicated_chunks += 1;
                result.deduplicated_bytes += chunk.len();
            }
            result.total_chunks += 1;

            content.push(ChunkInfo {
                start: chunk.start,
                length: chunk.len(),
                key,
            });
        }

        node.content = content;
        node.sha256 = Some(digest.finalize_hex());

        debug!(
            "Chunked {} into {} chunks",
            node.absolute_path.display(),
            node.content.len()
        );
        Ok(())
    }

    /// Upload `data` under `key` unless an object already exists there.
    ///
    /// Returns `true` when the chunk was sent. An existing object is trusted
    /// without comparing bytes: equal keys mean equal content.
    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<bool> {
        match self.store.head(&self.bucket, key).await {
            Ok(_) => {
                debug!("Chunk {} exists, skipping upload", key);
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                debug!("Chunk {} not found, uploading {} bytes", key, data.len());
                self.store.put(&self.bucket, key, data).await?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Push the manifest so the recovery point can be resolved by id alone.
    ///
    /// On failure the local cache entry is purged as well: a recovery point
    /// that never reached the store must not look restorable.
    async fn publish_index(&self, index: &Index) -> Result<()> {
        let data = index.to_json()?;
        self.repository.store_raw(&index.recovery_point_id, &data)?;

        let key = index_key(&index.recovery_point_id);
        info!("Put index {}", key);

        if let Err(e) = self.store.put(&self.bucket, &key, &data).await {
            error!("Failed to upload index {}: {}", key, e);
            if let Err(purge_err) = self.repository.purge(&index.recovery_point_id) {
                warn!("Failed to purge cached index {}: {}", index.recovery_point_id, purge_err);
            }
            return Err(e.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::tests::{noise, small_config};
    use crate::storage::{MemoryStore, StorageError};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const BUCKET: &str = "test-bucket";

    /// Delegates to a memory store, failing selected calls.
    struct FaultyStore {
        inner: MemoryStore,
        fail_index_put: bool,
        fail_head: bool,
    }

    #[async_trait]
    impl BlobStore for FaultyStore {
        async fn head(&self, bucket: &str, key: &str) -> std::result::Result<u64, StorageError> {
            if self.fail_head {
                return Err(StorageError::Backend("connection reset".into()));
            }
            self.inner.head(bucket, key).await
        }

        async fn get(&self, bucket: &str, key: &str) -> std::result::Result<Vec<u8>, StorageError> {
            self.inner.get(bucket, key).await
        }

        async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> std::result::Result<(), StorageError> {
            if self.fail_index_put && key.ends_with("/index") {
                return Err(StorageError::Backend("quota exceeded".into()));
            }
            self.inner.put(bucket, key, data).await
        }
    }

    fn source_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.bin"), noise(40 * 1024, 1)).unwrap();
        fs::write(dir.path().join("sub/b.bin"), noise(10 * 1024, 2)).unwrap();
        fs::write(dir.path().join("empty.txt"), b"").unwrap();
        std::os::unix::fs::symlink("a.bin", dir.path().join("link")).unwrap();
        dir
    }

    fn executor(store: Arc<dyn BlobStore>, cache: &Path) -> UploadExecutor {
        UploadExecutor::new(store, BUCKET, Repository::new(cache), small_config())
    }

    #[tokio::test]
    async fn test_upload_records_tiling_chunks() -> Result<()> {
        let source = source_tree();
        let cache = TempDir::new()?;
        let store = Arc::new(MemoryStore::new());

        let result = executor(store.clone(), cache.path()).execute(source.path()).await?;
        assert_eq!(result.total_entries, 6);
        assert_eq!(result.total_files, 4);
        assert_eq!(result.processed_files, 3);

        let repo = Repository::new(cache.path());
        let index = repo
            .load_index(&result.recovery_point_id)?
            .expect("index cached locally");

        for node in index.nodes().filter(|n| n.is_file()) {
            let original = fs::read(&node.absolute_path)?;
            assert!(node.chunks_are_contiguous());
            assert_eq!(node.content_size(), original.len() as u64);

            let mut rebuilt = Vec::new();
            let mut digest = FileDigest::new();
            for chunk in &node.content {
                let data = store.get(BUCKET, &chunk.key).await?;
                assert_eq!(content_key(&data), chunk.key);
                assert_eq!(data.len() as u64, chunk.length);
                digest.update(&data);
                rebuilt.extend_from_slice(&data);
            }
            assert_eq!(rebuilt, original);
            assert_eq!(node.sha256.as_deref(), Some(digest.finalize_hex().as_str()));
        }

        for node in index.nodes().filter(|n| !n.is_file()) {
            assert!(node.content.is_empty());
            assert!(node.sha256.is_none());
        }

        // The remote manifest matches the cached one.
        let remote = store.get(BUCKET, &index_key(&result.recovery_point_id)).await?;
        assert_eq!(Index::from_json(&remote)?, index);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_upload_sends_no_chunks() -> Result<()> {
        let source = source_tree();
        let cache = TempDir::new()?;
        let store = Arc::new(MemoryStore::new());
        let executor = executor(store.clone(), cache.path());

        let first = executor.execute(source.path()).await?;
        assert!(first.uploaded_chunks > 0);
        let puts_after_first = store.put_calls();

        let second = executor.execute(source.path()).await?;
        assert_ne!(first.recovery_point_id, second.recovery_point_id);
        assert_eq!(second.uploaded_chunks, 0);
        assert_eq!(second.deduplicated_chunks, second.total_chunks);
        // Only the new manifest was written.
        assert_eq!(store.put_calls(), puts_after_first + 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_repeated_pattern_collapses_to_few_chunks() -> Result<()> {
        let source = TempDir::new()?;
        let pattern = noise(1024 * 1024, 99);
        let mut data = Vec::with_capacity(40 * pattern.len());
        for _ in 0..40 {
            data.extend_from_slice(&pattern);
        }
        fs::write(source.path().join("big.bin"), &data)?;

        let cache = TempDir::new()?;
        let store = Arc::new(MemoryStore::new());
        let executor = UploadExecutor::new(
            store.clone(),
            BUCKET,
            Repository::new(cache.path()),
            ChunkerConfig::default(),
        );
        let result = executor.execute(source.path()).await?;

        let chunk_keys: HashSet<String> = store
            .keys(BUCKET)
            .await
            .into_iter()
            .filter(|k| !k.ends_with("/index"))
            .collect();
        assert!(
            chunk_keys.len() < 12,
            "{} unique chunks for a 1 MiB pattern",
            chunk_keys.len()
        );
        assert_eq!(result.uploaded_chunks, chunk_keys.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_push_failure_purges_cache() -> Result<()> {
        let source = source_tree();
        let cache = TempDir::new()?;
        let store = Arc::new(FaultyStore {
            inner: MemoryStore::new(),
            fail_index_put: true,
            fail_head: false,
        });

        let err = executor(store.clone(), cache.path())
            .execute(source.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Storage(StorageError::Backend(_))));

        // No recovery point is left behind locally or remotely.
        assert_eq!(fs::read_dir(cache.path())?.count(), 0);
        assert!(store.inner.keys(BUCKET).await.iter().all(|k| !k.ends_with("/index")));
        Ok(())
    }

    #[tokio::test]
    async fn test_backend_error_on_head_is_fatal() -> Result<()> {
        let source = source_tree();
        let cache = TempDir::new()?;
        let store = Arc::new(FaultyStore {
            inner: MemoryStore::new(),
            fail_index_put: false,
            fail_head: true,
        });

        let err = executor(store.clone(), cache.path())
            .execute(source.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Storage(_)));
        assert_eq!(store.inner.put_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_aborts_before_upload() {
        let cache = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let missing = cache.path().join("does-not-exist");

        let result = executor(store.clone(), cache.path()).execute(&missing).await;
        assert!(matches!(result, Err(BackupError::Io(_))));
        assert_eq!(store.put_calls(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_entry_aborts_before_any_upload() -> Result<()> {
        let source = source_tree();
        let locked = source.path().join("locked");
        fs::create_dir(&locked)?;
        fs::write(locked.join("hidden.txt"), b"unreachable")?;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;

        // Privileged users read through the missing permission bits.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;
            return Ok(());
        }

        let cache = TempDir::new()?;
        let store = Arc::new(MemoryStore::new());
        let result = executor(store.clone(), cache.path()).execute(source.path()).await;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;

        assert!(matches!(result, Err(BackupError::Walk(_))), "{:?}", result.err());
        assert_eq!(store.put_calls(), 0);
        assert_eq!(store.head_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_upload_publishes_nothing() {
        let source = source_tree();
        let cache = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        token.cancel();

        let executor = UploadExecutor::with_cancel(
            store.clone(),
            BUCKET,
            Repository::new(cache.path()),
            small_config(),
            token,
        );
        let result = executor.execute(source.path()).await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
        assert_eq!(store.put_calls(), 0);
    }
}
