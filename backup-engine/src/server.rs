//! Interfaces to the live database server and its WAL archive.
//!
//! The engine never talks to a server directly; callers provide
//! implementations of these traits.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::catalog::{Lsn, TimelineId};

/// Changed blocks per relation segment (path relative to the data directory,
/// block numbers within the segment).
pub type BlockChangeMap = BTreeMap<String, BTreeSet<u32>>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("not supported by the server: {0}")]
    Unsupported(String),
}

/// Failure of the out-of-band block fetch query.
#[derive(Error, Debug)]
pub enum BlockFetchError {
    /// The server itself holds an invalid copy of the page.
    #[error("page is corrupt on the server")]
    PageCorrupt,

    /// The relation (or this block of it) no longer exists.
    #[error("relation no longer exists")]
    RelationGone,

    #[error("block fetch failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum WalError {
    /// WAL for the requested range is missing from the archive.
    #[error("WAL between {from} and {to} is missing")]
    Gap { from: Lsn, to: Lsn },

    #[error("cannot read WAL: {0}")]
    Read(String),
}

/// Snapshot of the server's block-change bitmap.
#[derive(Debug, Clone, Default)]
pub struct BlockChanges {
    /// Position from which changes have been tracked
    pub tracked_since: Lsn,
    pub blocks: BlockChangeMap,
}

#[async_trait]
pub trait DatabaseServer: Send + Sync {
    async fn current_timeline(&self) -> Result<TimelineId, ServerError>;

    /// Whether data pages carry checksums.
    async fn checksums_enabled(&self) -> Result<bool, ServerError>;

    /// Put the server in backup mode; returns the backup start LSN.
    async fn start_backup(&self, label: &str) -> Result<Lsn, ServerError>;

    /// Leave backup mode; returns the backup stop LSN.
    async fn stop_backup(&self) -> Result<Lsn, ServerError>;

    /// Fetch a consistent copy of one page through the server.
    ///
    /// `rel_path` is the segment file relative to the data directory and
    /// `block` the block number within that segment.
    async fn fetch_block(&self, rel_path: &str, block: u32) -> Result<Bytes, BlockFetchError>;

    async fn change_tracking_enabled(&self) -> Result<bool, ServerError> {
        Ok(false)
    }

    /// Read the block-change bitmap and start a new tracking epoch.
    async fn take_block_changes(&self) -> Result<BlockChanges, ServerError> {
        Err(ServerError::Unsupported("block change tracking".to_string()))
    }

    /// Start a new tracking epoch without reading the bitmap.
    async fn reset_block_changes(&self) -> Result<(), ServerError> {
        Ok(())
    }
}

#[async_trait]
pub trait WalSource: Send + Sync {
    /// Blocks touched by WAL records in `[from, to)` on `timeline`.
    async fn changed_blocks(
        &self,
        timeline: TimelineId,
        from: Lsn,
        to: Lsn,
    ) -> Result<BlockChangeMap, WalError>;
}
