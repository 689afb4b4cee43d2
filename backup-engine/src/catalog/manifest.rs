//! File manifest of a backup, stored as `manifest.json` next to `backup.json`.
//!
//! Every file that existed in the data directory when the backup ran has an
//! entry. Entries without stored bytes are inherited: their content lives in
//! an ancestor backup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::record::BackupId;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Relation segment, stored block by block.
    DataFile,
    Regular,
    Directory,
}

/// Half-open range of block numbers `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u32,
    pub end: u32,
}

impl BlockRange {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Collapse an ascending list of block numbers into ranges.
pub fn to_ranges(blocks: &[u32]) -> Vec<BlockRange> {
    let mut ranges: Vec<BlockRange> = Vec::new();
    for &blk in blocks {
        match ranges.last_mut() {
            Some(last) if last.end == blk => last.end += 1,
            _ => ranges.push(BlockRange {
                start: blk,
                end: blk + 1,
            }),
        }
    }
    ranges
}

/// Metadata for a single file in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the data directory, `/` separated
    pub path: String,
    pub kind: FileKind,
    /// Source size when the backup ran
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    /// Bytes stored in this backup; `None` when the content is inherited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_bytes: Option<u64>,
    /// CRC-32 of the stored bytes (of the inherited copy for inherited entries)
    #[serde(default)]
    pub checksum: u32,
    /// Relation length in blocks at backup time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_blocks: Option<u32>,
    /// Blocks stored in this backup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copied_blocks: Vec<BlockRange>,
    /// Block at which a concurrent truncation was observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_at: Option<u32>,
    /// Backup holding the bytes of an inherited entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherited_from: Option<BackupId>,
}

impl ManifestEntry {
    pub fn is_stored(&self) -> bool {
        self.stored_bytes.is_some()
    }

    pub fn copied_block_count(&self) -> u64 {
        self.copied_blocks.iter().map(|r| r.len() as u64).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub backup_id: BackupId,
    pub files: Vec<ManifestEntry>,
    /// Paths present in the parent but gone from the data directory
    #[serde(default)]
    pub removed: Vec<String>,
    /// Tablespace oid -> original location
    #[serde(default)]
    pub tablespaces: BTreeMap<String, PathBuf>,
    pub total_files: usize,
    pub total_bytes: u64,
}

impl Manifest {
    pub fn new(backup_id: BackupId) -> Self {
        Self {
            version: MANIFEST_VERSION,
            backup_id,
            files: Vec::new(),
            removed: Vec::new(),
            tablespaces: BTreeMap::new(),
            total_files: 0,
            total_bytes: 0,
        }
    }

    /// Sort entries by path and recompute totals.
    pub fn seal(&mut self) {
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
        self.removed.sort();
        self.total_files = self
            .files
            .iter()
            .filter(|e| e.kind != FileKind::Directory)
            .count();
        self.total_bytes = self.files.iter().filter_map(|e| e.stored_bytes).sum();
    }

    pub fn by_path(&self) -> HashMap<&str, &ManifestEntry> {
        self.files.iter().map(|e| (e.path.as_str(), e)).collect()
    }
}
