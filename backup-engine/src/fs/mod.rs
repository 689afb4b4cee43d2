//! Data directory access: traversal and metadata.

pub mod metadata;
pub mod walker;

pub use walker::{walk_data_directory, DataDirectory, FileInfo, WalkOptions};
