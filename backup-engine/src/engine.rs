//! Entry points: take, validate and restore backups of one instance.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cancel::CancellationController;
use crate::catalog::{BackupId, BackupMode, BackupRecord, Catalog, Manifest, RunningBackup};
use crate::config::Config;
use crate::executor::{CopyPipeline, PipelineOptions, RunFailure};
use crate::fetch::BlockFetcher;
use crate::fs::{walk_data_directory, DataDirectory, WalkOptions};
use crate::restore::{RestoreRequest, RestoreSummary, Restorer};
use crate::server::{DatabaseServer, WalSource};
use crate::strategy::{strategy_for, tracked_changes, wal_changes, CopyAction, ParentBackup, PlanContext};
use crate::utils::errors::{BackupError, Result};
use crate::validate::{InstanceReport, ValidationReport, Validator};

pub struct BackupEngine {
    config: Config,
    catalog: Catalog,
    server: Arc<dyn DatabaseServer>,
    wal: Option<Arc<dyn WalSource>>,
}

impl BackupEngine {
    pub fn new(config: Config, server: Arc<dyn DatabaseServer>) -> Result<Self> {
        let catalog = Catalog::open(
            &config.catalog.path,
            &config.catalog.instance,
            config.lock.stale_after(),
        )?;
        Ok(Self {
            config,
            catalog,
            server,
            wal: None,
        })
    }

    /// WAL archive used by PAGE backups.
    pub fn with_wal_source(mut self, wal: Arc<dyn WalSource>) -> Self {
        self.wal = Some(wal);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.catalog.clone(), self.config.backup.jobs)
    }

    /// Take a backup of `mode` with `parallelism` copy jobs.
    ///
    /// The record is registered before anything else so that every failed
    /// attempt, including a missing parent, leaves an `ERROR` entry.
    pub async fn backup(
        &self,
        mode: BackupMode,
        parallelism: usize,
        controller: &CancellationController,
    ) -> Result<BackupRecord> {
        let timeline = self.server.current_timeline().await?;
        let mut running = self.catalog.create(mode, timeline).await?;
        let id = running.id();
        info!(
            backup_id = %id,
            "Starting {} backup of instance \"{}\" on timeline {}",
            mode,
            self.catalog.instance(),
            timeline
        );

        let parent = match self.load_parent(&mut running).await {
            Ok(parent) => parent,
            Err(e) => {
                return Err(controller
                    .fail(&self.catalog, running, e, &Manifest::new(id))
                    .await)
            }
        };

        match self.run(&mut running, parent, parallelism, controller).await {
            Ok(manifest) => {
                let record = controller.finish(&self.catalog, running, &manifest).await?;
                info!(
                    backup_id = %id,
                    "Backup completed: {} files, start LSN {}, stop LSN {}",
                    manifest.total_files,
                    record.start_lsn,
                    record.stop_lsn
                );
                if !self.config.backup.validate_after_backup {
                    return Ok(record);
                }
                let report = self.validator().validate(id).await?;
                if !report.is_ok() {
                    error!(backup_id = %id, "Backup failed validation right after completion");
                }
                self.catalog.get(id).await
            }
            Err(RunFailure { error, partial }) => {
                Err(controller.fail(&self.catalog, running, error, &partial).await)
            }
        }
    }

    async fn load_parent(&self, running: &mut RunningBackup) -> Result<Option<ParentBackup>> {
        let record = running.record();
        let Some(parent) = self
            .catalog
            .find_parent(record.timeline_id, record.mode)
            .await?
        else {
            return Ok(None);
        };
        let manifest = self.catalog.read_manifest(parent.id).await?;
        info!(backup_id = %running.id(), "Parent backup: {}", parent.id);
        running.record_mut().parent_id = Some(parent.id);
        Ok(Some(ParentBackup {
            record: parent,
            manifest,
        }))
    }

    async fn run(
        &self,
        running: &mut RunningBackup,
        parent: Option<ParentBackup>,
        parallelism: usize,
        controller: &CancellationController,
    ) -> std::result::Result<Manifest, RunFailure> {
        let id = running.id();
        let fail = |error: BackupError| RunFailure {
            error,
            partial: Manifest::new(id),
        };
        let mode = running.record().mode;

        let checksums_enabled = self.server.checksums_enabled().await.map_err(|e| fail(e.into()))?;
        running.record_mut().checksums_enabled = checksums_enabled;
        if !checksums_enabled {
            warn!(backup_id = %id, "Data page checksums are disabled; only page headers are verified");
        }

        // PTRACK reads the bitmap once the start LSN is fixed; every other
        // mode opens a new tracking epoch before it.
        if mode != BackupMode::Ptrack {
            self.reset_tracking().await.map_err(fail)?;
        }

        let label = format!("{} {}", self.catalog.instance(), id);
        let start_lsn = self.server.start_backup(&label).await.map_err(|e| fail(e.into()))?;
        running.record_mut().start_lsn = start_lsn;

        let result = self
            .copy(running, parent.as_ref(), parallelism, controller)
            .await;

        // Leave backup mode whatever happened to the copy.
        let stop = self.server.stop_backup().await;
        let manifest = match (result, stop) {
            (Ok(manifest), Ok(stop_lsn)) => {
                running.record_mut().stop_lsn = stop_lsn;
                manifest
            }
            (Ok(manifest), Err(e)) => {
                return Err(RunFailure {
                    error: e.into(),
                    partial: manifest,
                })
            }
            (Err(failure), stop) => {
                if let Err(e) = stop {
                    warn!(backup_id = %id, "Cannot stop backup mode on the server: {}", e);
                }
                return Err(failure);
            }
        };
        Ok(manifest)
    }

    async fn copy(
        &self,
        running: &mut RunningBackup,
        parent: Option<&ParentBackup>,
        parallelism: usize,
        controller: &CancellationController,
    ) -> std::result::Result<Manifest, RunFailure> {
        let id = running.id();
        let fail = |error: BackupError| RunFailure {
            error,
            partial: Manifest::new(id),
        };
        let record = running.record().clone();

        if let Some(parent) = parent {
            if record.start_lsn < parent.record.start_lsn {
                return Err(fail(BackupError::StartLsnRegressed {
                    current: record.start_lsn,
                    parent: parent.record.start_lsn,
                    parent_id: parent.record.id,
                }));
            }
        }
        self.catalog.save(running).await.map_err(fail)?;

        let listing = self.walk().await.map_err(fail)?;
        info!(
            backup_id = %id,
            "Found {} entries and {} tablespaces in the data directory",
            listing.files.len(),
            listing.tablespaces.len()
        );

        let changes = match (record.mode, parent) {
            (BackupMode::Page, Some(parent)) => {
                let wal = self.wal.as_ref().ok_or_else(|| {
                    fail(BackupError::Config(
                        "PAGE backups need a WAL source".to_string(),
                    ))
                })?;
                Some(
                    wal_changes(&**wal, record.timeline_id, parent, record.start_lsn)
                        .await
                        .map_err(fail)?,
                )
            }
            // Writes after the bitmap read land above start_lsn and are
            // covered by WAL replay.
            (BackupMode::Ptrack, Some(parent)) => Some(
                tracked_changes(self.server.as_ref(), parent)
                    .await
                    .map_err(fail)?,
            ),
            _ => None,
        };

        let plan = strategy_for(record.mode)
            .plan(&PlanContext {
                data_dir: &listing,
                parent,
                changes: changes.as_ref(),
                delta: &self.config.backup.delta,
            })
            .map_err(fail)?;
        info!(
            backup_id = %id,
            "Plan: {} data files, {} other files, {} unchanged, {} removed since parent",
            plan.count(|a| matches!(a, CopyAction::DataBlocks(_))),
            plan.count(|a| matches!(a, CopyAction::Whole | CopyAction::WholeIfChanged)),
            plan.count(|a| matches!(a, CopyAction::Unchanged)),
            plan.removed.len()
        );

        let fetcher = BlockFetcher::new(Arc::clone(&self.server), &self.config.fetch, record.checksums_enabled);
        let pipeline = CopyPipeline::new(
            id,
            running.database_dir(),
            Arc::new(fetcher),
            PipelineOptions {
                compression: self.config.backup.compression,
                compression_level: self.config.backup.compression_level,
                progress_interval: Duration::from_secs(self.config.progress.interval_secs.max(1)),
            },
            controller.token(),
        );
        running.record_mut().compression = self.config.backup.compression;
        pipeline.run(plan, parallelism).await
    }

    async fn reset_tracking(&self) -> Result<()> {
        if self.server.change_tracking_enabled().await? {
            self.server.reset_block_changes().await?;
        }
        Ok(())
    }

    async fn walk(&self) -> Result<DataDirectory> {
        let root = self.config.instance.data_dir.clone();
        let options = WalkOptions {
            exclude: self.config.backup.exclude.clone(),
        };
        tokio::task::spawn_blocking(move || walk_data_directory(&root, &options))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(format!("walk task failed: {}", e))))?
    }

    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreSummary> {
        Restorer::new(self.catalog.clone(), self.validator())
            .restore(request)
            .await
    }

    pub async fn validate(&self, id: BackupId) -> Result<ValidationReport> {
        self.validator().validate(id).await
    }

    pub async fn validate_instance(&self) -> Result<InstanceReport> {
        self.validator().validate_instance().await
    }

    /// Backups of the instance ordered by start time.
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        self.catalog.list().await
    }

    pub async fn show(&self, id: BackupId) -> Result<(BackupRecord, Option<Manifest>)> {
        let record = self.catalog.get(id).await?;
        let manifest = self.catalog.read_manifest(id).await.ok();
        Ok((record, manifest))
    }
}
