use tracing::info;

use super::{
    changed_blocks_action, plan_incremental, FilePlan, ParentBackup, PlanContext, PlanStrategy,
    RegularFiles,
};
use crate::catalog::{BackupMode, Lsn, TimelineId};
use crate::server::{BlockChangeMap, WalError, WalSource};
use crate::utils::errors::{BackupError, Result};

/// Copies the blocks touched by WAL records since the parent's watermark.
pub struct PageStrategy;

impl PlanStrategy for PageStrategy {
    fn mode(&self) -> BackupMode {
        BackupMode::Page
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<FilePlan> {
        let changes = ctx.changes.ok_or_else(|| {
            BackupError::Config("PAGE backup requires the changed-block map from WAL".to_string())
        })?;
        plan_incremental(
            BackupMode::Page,
            ctx,
            RegularFiles::SkipUnmodified,
            |file, _, _| Ok(changed_blocks_action(changes, file)),
        )
    }
}

/// Scan the WAL archive between the parent's watermark and `start_lsn`.
///
/// A gap in the archive is `BrokenWalChain`.
pub async fn wal_changes(
    wal: &dyn WalSource,
    timeline: TimelineId,
    parent: &ParentBackup,
    start_lsn: Lsn,
) -> Result<BlockChangeMap> {
    let from = parent.watermark();
    info!("Scanning WAL from {} to {} on timeline {}", from, start_lsn, timeline);

    match wal.changed_blocks(timeline, from, start_lsn).await {
        Ok(map) => {
            let blocks: usize = map.values().map(|b| b.len()).sum();
            info!("WAL scan found {} changed blocks in {} files", blocks, map.len());
            Ok(map)
        }
        Err(WalError::Gap { from, to }) => Err(BackupError::BrokenWalChain { timeline, from, to }),
        Err(WalError::Read(msg)) => Err(BackupError::Wal(msg)),
    }
}
