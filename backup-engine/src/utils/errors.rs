//! Error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

use crate::catalog::{BackupId, BackupStatus, ChainBreak, Lsn, TimelineId};
use crate::server::ServerError;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database server error: {0}")]
    Server(#[from] ServerError),

    #[error("WAL source error: {0}")]
    Wal(String),

    #[error(
        "No valid parent backup on timeline {timeline}: create a new FULL backup before an incremental one"
    )]
    NoValidParent { timeline: TimelineId },

    #[error("Broken WAL chain on timeline {timeline}: WAL between {from} and {to} is not archived")]
    BrokenWalChain {
        timeline: TimelineId,
        from: Lsn,
        to: Lsn,
    },

    #[error("Page corrupt: block {block} of file \"{path}\" failed validation: {reason}")]
    PageCorrupt {
        path: String,
        block: u32,
        reason: String,
    },

    #[error("File vanished: \"{0}\" is not found")]
    FileVanished(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown tablespace mapping: \"{0}\" has no entry in the tablespace map")]
    UnknownTablespaceMapping(PathBuf),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Block {block} of file \"{path}\" is unavailable: {reason}")]
    BlockUnavailable {
        path: String,
        block: u32,
        reason: String,
    },

    #[error("Backup {0} not found")]
    BackupNotFound(BackupId),

    #[error("Instance \"{instance}\" is locked by {holder}")]
    Locked { instance: String, holder: String },

    #[error("Backup chain of {backup} is broken at {ancestor}: {reason}")]
    ChainBroken {
        backup: BackupId,
        ancestor: BackupId,
        reason: String,
    },

    #[error("Backup {id} is not restorable: status {status}")]
    NotRestorable { id: BackupId, status: BackupStatus },

    #[error("Change tracking unavailable: {0}")]
    ChangeTrackingUnavailable(String),

    #[error(
        "Start LSN {current} is older than start LSN {parent} of parent backup {parent_id}: server is from the past"
    )]
    StartLsnRegressed {
        current: Lsn,
        parent: Lsn,
        parent_id: BackupId,
    },

    #[error("Restore destination \"{0}\" exists and is not empty")]
    DestinationNotEmpty(PathBuf),

    #[error("Tablespace destination \"{0}\" is not an absolute path")]
    InvalidTablespaceDestination(PathBuf),

    #[error("Manifest of backup {id} is unreadable: {reason}")]
    ManifestUnreadable { id: BackupId, reason: String },
}

impl BackupError {
    /// Maps an I/O error raised while opening `path` into the engine's taxonomy.
    pub fn from_open(err: std::io::Error, what: &str, path: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => BackupError::FileVanished(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                BackupError::PermissionDenied(format!("cannot open {} \"{}\"", what, path.display()))
            }
            _ => BackupError::Io(err),
        }
    }

    /// Whether the error is the benign "file disappeared" case.
    pub fn is_vanished(&self) -> bool {
        matches!(self, BackupError::FileVanished(_))
    }
}

impl From<ChainBreak> for BackupError {
    fn from(b: ChainBreak) -> Self {
        BackupError::ChainBroken {
            backup: b.backup,
            ancestor: b.ancestor,
            reason: b.reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
