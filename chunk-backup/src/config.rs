//! Configuration management for chunk-backup.
//!
//! Loads configuration from an optional TOML file, then applies environment
//! variable overrides (a `.env` file in the working directory is honoured).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::errors::{BackupError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding both chunks and manifests
    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible services (MinIO, Ceph, ...)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    /// Path-style addressing, required by most self-hosted endpoints
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root of the local index cache
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_min_size")]
    pub min_size: u32,

    #[serde(default = "default_avg_size")]
    pub avg_size: u32,

    #[serde(default = "default_max_size")]
    pub max_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Maximum number of nodes reconstructed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_bucket() -> String {
    "backup-hn-1".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache")
}

fn default_min_size() -> u32 {
    512 * 1024
}

fn default_avg_size() -> u32 {
    1024 * 1024
}

fn default_max_size() -> u32 {
    8 * 1024 * 1024
}

fn default_concurrency() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint: None,
            access_key: String::new(),
            secret_key: String::new(),
            force_path_style: default_force_path_style(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            avg_size: default_avg_size(),
            max_size: default_max_size(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Build the effective configuration: file (or defaults), then `.env`,
    /// then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("S3_BUCKET") {
            self.storage.bucket = v;
        }
        if let Some(v) = lookup("S3_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = lookup("S3_ENDPOINT") {
            self.storage.endpoint = Some(v);
        }
        if let Some(v) = lookup("S3_ACCESS_KEY") {
            self.storage.access_key = v;
        }
        if let Some(v) = lookup("S3_SECRET_KEY") {
            self.storage.secret_key = v;
        }
        if let Some(v) = lookup("BACKUP_CACHE_DIR") {
            self.cache.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RESTORE_CONCURRENCY") {
            self.restore.concurrency = v
                .parse()
                .map_err(|_| BackupError::Config(format!("invalid RESTORE_CONCURRENCY: {}", v)))?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.bucket.is_empty() {
            return Err(BackupError::Config("storage bucket must not be empty".into()));
        }
        if self.restore.concurrency == 0 {
            return Err(BackupError::Config("restore concurrency must be at least 1".into()));
        }
        let c = &self.chunker;
        if !(c.min_size <= c.avg_size && c.avg_size <= c.max_size) {
            return Err(BackupError::Config(format!(
                "chunker sizes must satisfy min <= avg <= max (got {}/{}/{})",
                c.min_size, c.avg_size, c.max_size
            )));
        }
        crate::chunker::validate_sizes(c)?;
        Ok(())
    }
}
