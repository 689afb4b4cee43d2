use super::{fresh_copy, FilePlan, PlanContext, PlanStrategy, PlannedFile};
use crate::catalog::BackupMode;
use crate::utils::errors::Result;

/// Every file, every block.
pub struct FullStrategy;

impl PlanStrategy for FullStrategy {
    fn mode(&self) -> BackupMode {
        BackupMode::Full
    }

    fn plan(&self, ctx: &PlanContext<'_>) -> Result<FilePlan> {
        let files = ctx
            .data_dir
            .files
            .iter()
            .map(|file| PlannedFile {
                file: file.clone(),
                action: fresh_copy(file),
                parent_entry: None,
            })
            .collect();

        Ok(FilePlan {
            mode: BackupMode::Full,
            parent_id: None,
            files,
            removed: Vec::new(),
            tablespaces: ctx.data_dir.tablespaces.clone(),
        })
    }
}
