//! Directory traversal producing an [`Index`].
//!
//! Every entry under the root, the root included, becomes one [`Node`].
//! Symlinks are recorded, never followed.

use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::metadata::EntryMetadata;
use crate::index::{Index, Node};
use crate::utils::errors::Result;

/// Walk `root` and record every entry into a fresh index for `recovery_point_id`.
///
/// The first unreadable entry aborts the walk.
///
/// # Example
/// ```no_run
/// use chunk_backup::fs::walker::walk_directory;
/// use std::path::Path;
///
/// let index = walk_directory(Path::new("/data"), "rp-1").unwrap();
/// println!("Found {} files", index.total_files);
/// ```
pub fn walk_directory(root: &Path, recovery_point_id: &str) -> Result<Index> {
    let mut index = Index::new(recovery_point_id, root);
    walk_entries(root, |node| index.insert(node))?;

    debug!(
        "Walked {}: {} entries, {} non-directories",
        root.display(),
        index.len(),
        index.total_files
    );
    Ok(index)
}

/// Walk `root`, handing each node to `callback` in traversal order.
fn walk_entries<F>(root: &Path, mut callback: F) -> Result<()>
where
    F: FnMut(Node),
{
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let path = entry.path();
        let metadata = EntryMetadata::from_metadata(path, &entry.metadata()?)?;

        let Some(node_type) = metadata.node_type else {
            warn!("Skipping special file {}", path.display());
            continue;
        };

        callback(Node::new(root, path, node_type, metadata));
    }

    Ok(())
}
