//! Custom error types for backup and restore.

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chunker error: {0}")]
    Chunker(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Recovery point not found: {0}")]
    IndexNotFound(String),

    #[error("Invalid recovery point id: {0:?}")]
    InvalidRecoveryPoint(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    /// Whether this error is only the echo of a sibling's cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
