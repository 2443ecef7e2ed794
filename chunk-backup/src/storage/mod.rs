//! Remote blob storage.
//!
//! Chunks and manifests live in a bucket-scoped key/value object store. The
//! engine only needs three capabilities from it, captured by [`BlobStore`]:
//! an existence check, a whole-object read and a whole-object write.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use s3::S3Store;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The object does not exist. Expected during upload head-checks.
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Minimal object store capability used by upload and restore.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Return the stored size of `key`, or [`StorageError::NotFound`].
    async fn head(&self, bucket: &str, key: &str) -> Result<u64, StorageError>;

    /// Read the whole object stored under `key`.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `data` under `key`, replacing any previous object.
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;
}

/// Remote key of the manifest for a recovery point.
pub fn index_key(recovery_point_id: &str) -> String {
    format!("{}/index", recovery_point_id)
}
