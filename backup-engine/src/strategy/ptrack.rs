use tracing::info;

use super::{
    changed_blocks_action, plan_incremental, FilePlan, ParentBackup, PlanContext, PlanStrategy,
    RegularFiles,
};
use crate::catalog::BackupMode;
use crate::server::{BlockChangeMap, DatabaseServer};
use crate::utils::errors::{BackupError, Result};

/// Copies the blocks recorded in the server's block-change bitmap.
pub struct PtrackStrategy;

impl PlanStrategy for PtrackStrategy {
    fn mode(&self) -> BackupMode {
        BackupMode::Ptrack
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<FilePlan> {
        let changes = ctx.changes.ok_or_else(|| {
            BackupError::Config("PTRACK backup requires the block-change bitmap".to_string())
        })?;
        plan_incremental(
            BackupMode::Ptrack,
            ctx,
            RegularFiles::SkipUnmodified,
            |file, _, _| Ok(changed_blocks_action(changes, file)),
        )
    }
}

/// Read the block-change bitmap for a PTRACK backup on top of `parent`.
///
/// The bitmap must have been tracking since before the parent stopped,
/// otherwise changes made in between would be missed.
pub async fn tracked_changes(
    server: &dyn DatabaseServer,
    parent: &ParentBackup,
) -> Result<BlockChangeMap> {
    if !server.change_tracking_enabled().await? {
        return Err(BackupError::ChangeTrackingUnavailable(
            "block change tracking is disabled on the server".to_string(),
        ));
    }

    let changes = server.take_block_changes().await?;
    if !changes.tracked_since.is_valid() || changes.tracked_since > parent.record.stop_lsn {
        return Err(BackupError::ChangeTrackingUnavailable(format!(
            "tracking started at {}, after parent backup {} stopped at {}; create a new FULL backup",
            changes.tracked_since, parent.record.id, parent.record.stop_lsn
        )));
    }

    info!(
        "Block-change bitmap covers {} files since {}",
        changes.blocks.len(),
        changes.tracked_since
    );
    Ok(changes.blocks)
}
