//! Filesystem access: tree walking and metadata capture/reapply.

pub mod metadata;
pub mod walker;

pub use metadata::EntryMetadata;
pub use walker::walk_directory;
