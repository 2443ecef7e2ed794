//! File metadata handling for backup operations.
//!
//! This module captures the metadata a restore has to reproduce (type,
//! permissions, ownership, timestamps, link target) and applies it back to a
//! restored path.

use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

use crate::index::NodeType;

/// Permission bits preserved across backup/restore (rwx plus setuid, setgid, sticky).
pub const MODE_MASK: u32 = 0o7777;

/// Metadata of one filesystem entry, read without following symlinks
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    /// `None` for entries the node model cannot represent (fifos, sockets, devices)
    pub node_type: Option<NodeType>,

    /// Permission bits
    pub mode: u32,

    pub uid: u32,
    pub gid: u32,

    pub access_time: DateTime<Utc>,
    pub mod_time: DateTime<Utc>,

    /// Size in bytes as reported by lstat
    pub size: u64,

    /// Symlink target, symlinks only
    pub link_target: Option<PathBuf>,
}

impl EntryMetadata {
    /// Extract metadata from a path
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Self::from_metadata(path, &metadata)
    }

    /// Build from already-fetched `lstat` metadata of `path`
    pub fn from_metadata(path: &Path, metadata: &fs::Metadata) -> io::Result<Self> {
        let file_type = metadata.file_type();
        let node_type = if file_type.is_symlink() {
            Some(NodeType::Symlink)
        } else if file_type.is_dir() {
            Some(NodeType::Dir)
        } else if file_type.is_file() {
            Some(NodeType::File)
        } else {
            None
        };

        let link_target = if file_type.is_symlink() {
            Some(fs::read_link(path)?)
        } else {
            None
        };

        Ok(Self {
            node_type,
            mode: metadata.mode() & MODE_MASK,
            uid: metadata.uid(),
            gid: metadata.gid(),
            access_time: to_datetime(metadata.accessed()?),
            mod_time: to_datetime(metadata.modified()?),
            size: metadata.len(),
            link_target,
        })
    }
}

fn to_datetime(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Set permission bits on `path` (follows symlinks)
pub fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & MODE_MASK))
}

/// Set ownership on `path` without following a final symlink.
///
/// Only a privileged process may give files away; when the kernel refuses
/// with `EPERM` the restored entry keeps the restoring user's ownership.
pub fn apply_ownership(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    match std::os::unix::fs::lchown(path, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!("Not permitted to chown {} to {}:{}", path.display(), uid, gid);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Set access and modification times on `path` (follows symlinks)
pub fn apply_times(path: &Path, atime: DateTime<Utc>, mtime: DateTime<Utc>) -> io::Result<()> {
    filetime::set_file_times(
        path,
        FileTime::from_system_time(atime.into()),
        FileTime::from_system_time(mtime.into()),
    )
}
