use super::{
    plan_incremental, BlockSelection, CopyAction, FilePlan, PlanContext, PlanStrategy,
    RegularFiles,
};
use crate::catalog::BackupMode;
use crate::config::DeltaFallback;
use crate::utils::errors::Result;

/// Reads every existing data file and keeps the pages whose LSN moved past
/// the parent's watermark.
pub struct DeltaStrategy;

impl PlanStrategy for DeltaStrategy {
    fn mode(&self) -> BackupMode {
        BackupMode::Delta
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<FilePlan> {
        let options = ctx.delta;
        let regular = match options.fallback {
            DeltaFallback::FullCopy => RegularFiles::AlwaysCopy,
            DeltaFallback::ModificationTime => RegularFiles::SkipUnmodified,
        };

        plan_incremental(BackupMode::Delta, ctx, regular, |file, prev, parent| {
            if options.trust_page_lsn {
                return Ok(CopyAction::DataBlocks(BlockSelection::LsnAbove(
                    parent.watermark(),
                )));
            }
            Ok(match options.fallback {
                DeltaFallback::FullCopy => CopyAction::DataBlocks(BlockSelection::All),
                DeltaFallback::ModificationTime
                    if file.mtime < parent.started_at() && file.size == prev.size =>
                {
                    CopyAction::Unchanged
                }
                DeltaFallback::ModificationTime => CopyAction::DataBlocks(BlockSelection::All),
            })
        })
    }
}
