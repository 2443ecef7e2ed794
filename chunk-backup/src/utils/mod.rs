//! Utility modules shared by upload and restore.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};
