//! Backup Engine Library
//!
//! Page-level backups of a running database cluster: FULL, PAGE, DELTA and
//! PTRACK modes over a file catalog, with chain validation and restore.

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod executor;
pub mod fetch;
pub mod fs;
pub mod page;
pub mod restore;
pub mod server;
pub mod strategy;
pub mod transfer;
pub mod utils;
pub mod validate;

// Re-export commonly used types
pub use cancel::CancellationController;
pub use config::Config;
pub use engine::BackupEngine;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
