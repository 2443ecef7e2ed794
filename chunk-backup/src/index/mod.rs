//! Snapshot manifest.
//!
//! An [`Index`] records one recovery point: every walked path mapped to the
//! [`Node`] describing it. File nodes carry the ordered list of chunks that
//! tile their contents, so a restore can rebuild the file from the blob store
//! alone.

mod paths;
pub mod repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::fs::metadata::EntryMetadata;

pub use repository::Repository;

/// Kind of filesystem entry a node describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
    Symlink,
}

/// One content-defined chunk of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Byte offset of the chunk in the file
    pub start: u64,

    /// Chunk length in bytes
    pub length: u64,

    /// Content-addressing key; also the remote object key
    pub key: String,
}

impl ChunkInfo {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// The index record for one filesystem entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub node_type: NodeType,

    #[serde(with = "paths")]
    pub absolute_path: PathBuf,

    /// Path relative to `base_path`; empty for the walk root itself
    #[serde(with = "paths")]
    pub relative_path: PathBuf,

    /// Root of the walk that produced this node
    #[serde(with = "paths")]
    pub base_path: PathBuf,

    pub mode: u32,
    pub uid: u32,
    pub gid: u32,

    pub access_time: DateTime<Utc>,
    pub mod_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "paths::option")]
    pub link_target: Option<PathBuf>,

    /// Chunks ordered by `start`; files only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ChunkInfo>,

    /// Hex SHA-256 of the whole file; files only, set once upload finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl Node {
    /// Build a node for `path`, found while walking `base_path`.
    pub fn new(base_path: &Path, path: &Path, node_type: NodeType, metadata: EntryMetadata) -> Self {
        let relative_path = path
            .strip_prefix(base_path)
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self {
            node_type,
            absolute_path: path.to_path_buf(),
            relative_path,
            base_path: base_path.to_path_buf(),
            mode: metadata.mode,
            uid: metadata.uid,
            gid: metadata.gid,
            access_time: metadata.access_time,
            mod_time: metadata.mod_time,
            link_target: match node_type {
                NodeType::Symlink => metadata.link_target,
                _ => None,
            },
            content: Vec::new(),
            sha256: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }

    /// Total size covered by the recorded chunks
    pub fn content_size(&self) -> u64 {
        self.content.last().map(ChunkInfo::end).unwrap_or(0)
    }

    /// Check that the chunks tile `[0, content_size)` with no gap or overlap.
    pub fn chunks_are_contiguous(&self) -> bool {
        let mut expected = 0;
        for chunk in &self.content {
            if chunk.start != expected {
                return false;
            }
            expected = chunk.end();
        }
        true
    }

    /// Where this node lands when restored into `dest_dir`.
    ///
    /// Restoring into the original walk root puts every entry back at its
    /// recorded absolute path; any other destination is rebased onto the
    /// relative path.
    pub fn restore_path(&self, dest_dir: &Path) -> PathBuf {
        if dest_dir == self.base_path {
            self.absolute_path.clone()
        } else if self.relative_path.as_os_str().is_empty() {
            dest_dir.to_path_buf()
        } else {
            dest_dir.join(&self.relative_path)
        }
    }
}

/// Manifest of one recovery point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub recovery_point_id: String,

    /// Root path that was walked
    #[serde(with = "paths")]
    pub source: PathBuf,

    pub created_at: DateTime<Utc>,

    /// Number of non-directory entries
    pub total_files: u64,

    /// Absolute source path -> node
    #[serde(with = "paths::keys")]
    pub items: BTreeMap<PathBuf, Node>,
}

impl Index {
    pub fn new(recovery_point_id: impl Into<String>, source: &Path) -> Self {
        Self {
            recovery_point_id: recovery_point_id.into(),
            source: source.to_path_buf(),
            created_at: Utc::now(),
            total_files: 0,
            items: BTreeMap::new(),
        }
    }

    /// Add a node, keyed by its absolute path; counts non-directories.
    pub fn insert(&mut self, node: Node) {
        if node.node_type != NodeType::Dir {
            self.total_files += 1;
        }
        self.items.insert(node.absolute_path.clone(), node);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.items.values()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn node(base: &str, rel: &str, node_type: NodeType) -> Node {
        let base = PathBuf::from(base);
        let path = if rel.is_empty() { base.clone() } else { base.join(rel) };
        let time = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
        Node::new(
            &base,
            &path,
            node_type,
            EntryMetadata {
                node_type: Some(node_type),
                mode: 0o644,
                uid: 1000,
                gid: 1000,
                access_time: time,
                mod_time: time,
                size: 0,
                link_target: (node_type == NodeType::Symlink).then(|| PathBuf::from("target")),
            },
        )
    }

    #[test]
    fn test_insert_counts_non_directories() {
        let mut index = Index::new("rp", Path::new("/data"));
        index.insert(node("/data", "", NodeType::Dir));
        index.insert(node("/data", "a.txt", NodeType::File));
        index.insert(node("/data", "sub", NodeType::Dir));
        index.insert(node("/data", "link", NodeType::Symlink));

        assert_eq!(index.len(), 4);
        assert_eq!(index.total_files, 2);
    }

    #[test]
    fn test_link_target_only_for_symlinks() {
        let file = node("/data", "a.txt", NodeType::File);
        let link = node("/data", "link", NodeType::Symlink);
        assert!(file.link_target.is_none());
        assert_eq!(link.link_target, Some(PathBuf::from("target")));
    }

    #[test]
    fn test_restore_path_mapping() {
        let root = node("/data", "", NodeType::Dir);
        let file = node("/data", "sub/a.txt", NodeType::File);

        // Same destination as the walk root: original absolute path.
        assert_eq!(file.restore_path(Path::new("/data")), PathBuf::from("/data/sub/a.txt"));
        // Elsewhere: rebased on the relative path.
        assert_eq!(file.restore_path(Path::new("/restore")), PathBuf::from("/restore/sub/a.txt"));
        assert_eq!(root.restore_path(Path::new("/restore")), PathBuf::from("/restore"));
    }

    #[test]
    fn test_contiguity_check() {
        let mut file = node("/data", "a.txt", NodeType::File);
        file.content = vec![
            ChunkInfo { start: 0, length: 10, key: "a".into() },
            ChunkInfo { start: 10, length: 5, key: "b".into() },
        ];
        assert!(file.chunks_are_contiguous());
        assert_eq!(file.content_size(), 15);

        file.content[1].start = 11;
        assert!(!file.chunks_are_contiguous());
    }

    #[test]
    fn test_json_layout() {
        let mut index = Index::new("rp-1", Path::new("/data"));
        let mut file = node("/data", "a.txt", NodeType::File);
        file.content.push(ChunkInfo { start: 0, length: 3, key: "900150983cd24fb0d6963f7d28e17f72".into() });
        file.sha256 = Some("ba7816bf".into());
        index.insert(file);
        index.insert(node("/data", "", NodeType::Dir));

        let value: serde_json::Value = serde_json::from_slice(&index.to_json().unwrap()).unwrap();
        assert_eq!(value["recovery_point_id"], "rp-1");
        assert_eq!(value["total_files"], 1);
        let file = &value["items"]["/data/a.txt"];
        assert_eq!(file["type"], "file");
        assert_eq!(file["content"][0]["key"], "900150983cd24fb0d6963f7d28e17f72");
        let dir = &value["items"]["/data"];
        assert_eq!(dir["type"], "dir");
        assert!(dir.get("content").is_none());
        assert!(dir.get("sha256").is_none());

        let parsed = Index::from_json(&index.to_json().unwrap()).unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn test_non_utf8_names_round_trip() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut index = Index::new("rp-1", Path::new("/data"));
        let mut file = node("/data", "", NodeType::File);
        file.absolute_path = PathBuf::from(OsStr::from_bytes(b"/data/bad\xffname"));
        file.relative_path = PathBuf::from(OsStr::from_bytes(b"bad\xffname"));
        let mut link = node("/data", "link", NodeType::Symlink);
        link.link_target = Some(PathBuf::from(OsStr::from_bytes(b"\xfe")));
        index.insert(file);
        index.insert(link);
        index.insert(node("/data", "plain.txt", NodeType::File));

        let json = index.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert!(value["items"].get("/data/plain.txt").is_some());

        assert_eq!(Index::from_json(&json).unwrap(), index);
    }
}
