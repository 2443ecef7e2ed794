//! Local index cache.
//!
//! Layout: `<root>/<recovery_point_id>/index.json`. The cache is written
//! after every uploaded file and read before falling back to the remote copy
//! of a manifest.

use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::Index;
use crate::utils::errors::{BackupError, Result};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache directory of one recovery point.
    ///
    /// The id becomes a single path component under the cache root, so
    /// anything that could climb out of it is rejected.
    pub fn dir_for(&self, recovery_point_id: &str) -> Result<PathBuf> {
        validate_id(recovery_point_id)?;
        Ok(self.root.join(recovery_point_id))
    }

    pub fn index_path(&self, recovery_point_id: &str) -> Result<PathBuf> {
        Ok(self.dir_for(recovery_point_id)?.join(INDEX_FILE))
    }

    /// Persist `index` under its recovery-point id.
    ///
    /// The document is written to a sibling temp file and renamed into
    /// place, so a crash mid-write leaves the previous snapshot intact.
    pub fn save_index(&self, index: &Index) -> Result<()> {
        let data = index.to_json()?;
        self.store_raw(&index.recovery_point_id, &data)
    }

    /// Persist an already-serialized index document.
    pub fn store_raw(&self, recovery_point_id: &str, data: &[u8]) -> Result<()> {
        let dir = self.dir_for(recovery_point_id)?;
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, dir.join(INDEX_FILE))?;

        debug!("Cached index {} ({} bytes)", recovery_point_id, data.len());
        Ok(())
    }

    /// Raw index document, or `None` if this id was never cached.
    pub fn read_raw(&self, recovery_point_id: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.index_path(recovery_point_id)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load_index(&self, recovery_point_id: &str) -> Result<Option<Index>> {
        match self.read_raw(recovery_point_id)? {
            Some(data) => Ok(Some(Index::from_json(&data)?)),
            None => Ok(None),
        }
    }

    /// Drop everything cached for `recovery_point_id`.
    pub fn purge(&self, recovery_point_id: &str) -> Result<()> {
        let dir = self.dir_for(recovery_point_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to purge cache {}: {}", dir.display(), e);
                Err(e.into())
            }
        }
    }
}

fn validate_id(recovery_point_id: &str) -> Result<()> {
    let invalid = recovery_point_id.is_empty()
        || recovery_point_id == "."
        || recovery_point_id == ".."
        || recovery_point_id.contains(|c| matches!(c, '/' | '\\' | '\0'));

    if invalid {
        return Err(BackupError::InvalidRecoveryPoint(recovery_point_id.to_string()));
    }
    Ok(())
}
