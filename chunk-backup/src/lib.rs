//! Chunk Backup Library
//!
//! Deduplicating backup and restore of directory trees. Files are cut into
//! content-defined chunks, each chunk is stored once in an object store under
//! the digest of its bytes, and a per-recovery-point index records how to
//! reassemble every file, directory and symlink.

pub mod chunker;
pub mod config;
pub mod executor;
pub mod fs;
pub mod index;
pub mod shutdown;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{RestoreExecutor, UploadExecutor};
pub use index::{ChunkInfo, Index, Node, NodeType, Repository};
pub use storage::{BlobStore, MemoryStore, S3Store, StorageError};
pub use utils::errors::BackupError;
