//! Backup mode strategies.
//!
//! Each mode turns the current data directory listing, the parent's manifest
//! and an optional change source into a [`FilePlan`]: what to copy, what to
//! inherit and what was removed since the parent.

mod delta;
mod full;
mod page;
mod ptrack;

pub use delta::DeltaStrategy;
pub use full::FullStrategy;
pub use page::{wal_changes, PageStrategy};
pub use ptrack::{tracked_changes, PtrackStrategy};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use tracing::info;

use crate::catalog::{BackupId, BackupMode, BackupRecord, FileKind, Lsn, Manifest, ManifestEntry};
use crate::config::DeltaOptions;
use crate::fs::{DataDirectory, FileInfo};
use crate::server::BlockChangeMap;
use crate::utils::errors::{BackupError, Result};

/// The parent backup an incremental backup builds on.
#[derive(Debug, Clone)]
pub struct ParentBackup {
    pub record: BackupRecord,
    pub manifest: Manifest,
}

impl ParentBackup {
    /// LSN above which a page counts as changed since the parent.
    pub fn watermark(&self) -> Lsn {
        self.record.start_lsn
    }

    fn started_at(&self) -> i64 {
        self.record.start_time.timestamp()
    }
}

/// Which blocks of a data file to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSelection {
    All,
    /// Blocks whose page LSN is at or above the watermark (zero LSNs included)
    LsnAbove(Lsn),
    Listed(BTreeSet<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyAction {
    Directory,
    DataBlocks(BlockSelection),
    Whole,
    /// Copy, but fall back to the parent's copy when the content matches
    WholeIfChanged,
    /// Inherit the parent's copy without reading the file
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub file: FileInfo,
    pub action: CopyAction,
    pub parent_entry: Option<ManifestEntry>,
}

#[derive(Debug, Clone)]
pub struct FilePlan {
    pub mode: BackupMode,
    pub parent_id: Option<BackupId>,
    pub files: Vec<PlannedFile>,
    /// Paths in the parent that no longer exist
    pub removed: Vec<String>,
    pub tablespaces: BTreeMap<String, PathBuf>,
}

impl FilePlan {
    pub fn count(&self, pred: impl Fn(&CopyAction) -> bool) -> usize {
        self.files.iter().filter(|f| pred(&f.action)).count()
    }
}

/// Inputs to planning. Strategies are pure functions of this context.
pub struct PlanContext<'a> {
    pub data_dir: &'a DataDirectory,
    pub parent: Option<&'a ParentBackup>,
    /// Changed blocks (PAGE and PTRACK)
    pub changes: Option<&'a BlockChangeMap>,
    pub delta: &'a DeltaOptions,
}

pub trait PlanStrategy: Send + Sync {
    fn mode(&self) -> BackupMode;

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<FilePlan>;
}

pub fn strategy_for(mode: BackupMode) -> Box<dyn PlanStrategy> {
    match mode {
        BackupMode::Full => Box::new(FullStrategy),
        BackupMode::Page => Box::new(PageStrategy),
        BackupMode::Delta => Box::new(DeltaStrategy),
        BackupMode::Ptrack => Box::new(PtrackStrategy),
    }
}

fn fresh_copy(file: &FileInfo) -> CopyAction {
    match file.kind {
        FileKind::Directory => CopyAction::Directory,
        FileKind::DataFile => CopyAction::DataBlocks(BlockSelection::All),
        FileKind::Regular => CopyAction::Whole,
    }
}

/// How regular files already present in the parent are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegularFiles {
    AlwaysCopy,
    SkipUnmodified,
}

/// Planning shared by the incremental modes: new files are copied in full,
/// directories recreated, vanished paths recorded as removed; `data_action`
/// decides for data files the parent already has.
fn plan_incremental<F>(
    mode: BackupMode,
    ctx: &PlanContext<'_>,
    regular: RegularFiles,
    mut data_action: F,
) -> Result<FilePlan>
where
    F: FnMut(&FileInfo, &ManifestEntry, &ParentBackup) -> Result<CopyAction>,
{
    let parent = ctx
        .parent
        .ok_or_else(|| BackupError::Config(format!("{} backup requires a parent backup", mode)))?;
    let parent_files = parent.manifest.by_path();

    let mut files = Vec::with_capacity(ctx.data_dir.files.len());
    for file in &ctx.data_dir.files {
        let prev = parent_files.get(file.relative_path.as_str()).copied();
        let action = match (file.kind, prev) {
            (FileKind::Directory, _) => CopyAction::Directory,
            (_, None) => fresh_copy(file),
            (_, Some(prev)) if prev.kind != file.kind => fresh_copy(file),
            (FileKind::DataFile, Some(prev)) => data_action(file, prev, parent)?,
            (FileKind::Regular, Some(_)) => match regular {
                RegularFiles::SkipUnmodified if file.mtime < parent.started_at() => {
                    CopyAction::WholeIfChanged
                }
                _ => CopyAction::Whole,
            },
        };
        files.push(PlannedFile {
            file: file.clone(),
            action,
            parent_entry: prev.cloned(),
        });
    }

    let present: HashSet<&str> = ctx
        .data_dir
        .files
        .iter()
        .map(|f| f.relative_path.as_str())
        .collect();
    let removed: Vec<String> = parent
        .manifest
        .files
        .iter()
        .filter(|e| !present.contains(e.path.as_str()))
        .map(|e| e.path.clone())
        .collect();
    for path in &removed {
        info!("File \"{}\" is not found in the data directory, recorded as removed", path);
    }

    Ok(FilePlan {
        mode,
        parent_id: Some(parent.record.id),
        files,
        removed,
        tablespaces: ctx.data_dir.tablespaces.clone(),
    })
}

/// Data file action for modes driven by an explicit changed-block set.
fn changed_blocks_action(
    changes: &BlockChangeMap,
    file: &FileInfo,
) -> CopyAction {
    match changes.get(&file.relative_path) {
        Some(blocks) if !blocks.is_empty() => {
            CopyAction::DataBlocks(BlockSelection::Listed(blocks.clone()))
        }
        _ => CopyAction::Unchanged,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_strategy_for_each_mode() {
        for mode in [
            BackupMode::Full,
            BackupMode::Page,
            BackupMode::Delta,
            BackupMode::Ptrack,
        ] {
            assert_eq!(strategy_for(mode).mode(), mode);
        }
    }

    #[test]
    fn test_incremental_requires_parent() {
        let dir = listing(vec![]);
        let delta = DeltaOptions::default();
        let ctx = PlanContext {
            data_dir: &dir,
            parent: None,
            changes: None,
            delta: &delta,
        };
        assert!(strategy_for(BackupMode::Delta).plan(&ctx).is_err());
    }

    #[test]
    fn test_new_and_removed_files() {
        let dir = listing(vec![
            file("base", FileKind::Directory, 0, 0),
            file("base/1/16384", FileKind::DataFile, 16384, 500),
            file("base/1/16390", FileKind::DataFile, 8192, 500),
        ]);
        let parent = parent(vec![
            entry("base/1/16384", FileKind::DataFile, 16384),
            entry("base/1/16385", FileKind::DataFile, 8192),
        ]);
        let delta = DeltaOptions::default();
        let changes = BlockChangeMap::new();
        let ctx = PlanContext {
            data_dir: &dir,
            parent: Some(&parent),
            changes: Some(&changes),
            delta: &delta,
        };

        for mode in [BackupMode::Page, BackupMode::Delta, BackupMode::Ptrack] {
            let plan = strategy_for(mode).plan(&ctx).unwrap();
            assert_eq!(plan.parent_id, Some(parent.record.id));
            assert_eq!(plan.removed, vec!["base/1/16385".to_string()]);
            assert_eq!(action_of(&plan, "base"), &CopyAction::Directory);
            assert_eq!(
                action_of(&plan, "base/1/16390"),
                &CopyAction::DataBlocks(BlockSelection::All)
            );
        }
    }
}
