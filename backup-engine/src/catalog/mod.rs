//! Backup catalog: one directory per backup under `<root>/backups/<instance>/`.
//!
//! ```text
//! backups/<instance>/run.lock
//! backups/<instance>/<id>/backup.json
//! backups/<instance>/<id>/manifest.json
//! backups/<instance>/<id>/database/...
//! ```
//!
//! Records are written with write-to-temp, fsync and rename so readers never
//! observe a torn file. The manifest only appears when the run finalizes.

pub mod index;
pub mod lock;
pub mod manifest;
pub mod record;

pub use index::{CatalogIndex, ChainBreak};
pub use lock::RunLock;
pub use manifest::{BlockRange, FileKind, Manifest, ManifestEntry};
pub use record::{BackupId, BackupMode, BackupRecord, BackupStatus, Lsn, TimelineId};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::utils::errors::{BackupError, Result};

pub const RECORD_FILE: &str = "backup.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATABASE_DIR: &str = "database";

/// Catalog of one instance.
#[derive(Debug, Clone)]
pub struct Catalog {
    dir: PathBuf,
    instance: String,
    stale_after: Duration,
}

impl Catalog {
    /// Open (creating if needed) the catalog of `instance` under `root`.
    pub fn open(root: &Path, instance: &str, stale_after: Duration) -> Result<Self> {
        let dir = root.join("backups").join(instance);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            instance: instance.to_string(),
            stale_after,
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backup_dir(&self, id: BackupId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Directory holding the stored file contents of a backup.
    pub fn database_dir(&self, id: BackupId) -> PathBuf {
        self.backup_dir(id).join(DATABASE_DIR)
    }

    pub fn manifest_path(&self, id: BackupId) -> PathBuf {
        self.backup_dir(id).join(MANIFEST_FILE)
    }

    /// All backups ordered by start time.
    ///
    /// Entries removed or half-written by a concurrent retention run are
    /// skipped.
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<BackupId>().ok()) else {
                continue;
            };
            match read_json::<BackupRecord>(&entry.path().join(RECORD_FILE)).await {
                Ok(record) if record.id == id => records.push(record),
                Ok(record) => warn!(
                    "Skipping backup directory {}: record names backup {}",
                    entry.path().display(),
                    record.id
                ),
                Err(BackupError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    debug!("Backup directory {} vanished during scan", entry.path().display());
                }
                Err(e) => warn!("Skipping unreadable backup {}: {}", id, e),
            }
        }

        records.sort_by_key(|r| (r.start_time, r.id));
        Ok(records)
    }

    pub async fn get(&self, id: BackupId) -> Result<BackupRecord> {
        match read_json(&self.backup_dir(id).join(RECORD_FILE)).await {
            Err(BackupError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(BackupError::BackupNotFound(id))
            }
            other => other,
        }
    }

    pub async fn index(&self) -> Result<CatalogIndex> {
        Ok(CatalogIndex::build(self.list().await?))
    }

    /// Parent for a new backup of `mode` on `timeline`.
    ///
    /// FULL backups have no parent. Incremental modes get the most recent
    /// `OK` backup on the timeline or fail with `NoValidParent`.
    pub async fn find_parent(
        &self,
        timeline: TimelineId,
        mode: BackupMode,
    ) -> Result<Option<BackupRecord>> {
        if !mode.is_incremental() {
            return Ok(None);
        }
        let index = self.index().await?;
        match index.latest_ok(timeline) {
            Some(parent) => Ok(Some(parent.clone())),
            None => Err(BackupError::NoValidParent { timeline }),
        }
    }

    /// Take the run lock and register a new `RUNNING` backup.
    pub async fn create(&self, mode: BackupMode, timeline: TimelineId) -> Result<RunningBackup> {
        let lock = RunLock::acquire(&self.dir, &self.instance, self.stale_after)?;

        let mut id = BackupId::from_time(Utc::now());
        if let Some(newest) = self.list().await?.iter().map(|r| r.id).max() {
            if id <= newest {
                id = newest.next();
            }
        }
        let dir = loop {
            let dir = self.backup_dir(id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => break dir,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => id = id.next(),
                Err(e) => return Err(e.into()),
            }
        };
        tokio::fs::create_dir_all(dir.join(DATABASE_DIR)).await?;

        let record = BackupRecord::new(id, &self.instance, mode, timeline);
        write_json_atomic(&dir.join(RECORD_FILE), &record).await?;
        info!(backup_id = %id, mode = %mode, timeline = %timeline, "Backup registered as RUNNING");

        Ok(RunningBackup {
            record,
            dir,
            lock: Some(lock),
            finalized: false,
        })
    }

    /// Persist the in-progress record (LSNs, parent) of a running backup.
    pub async fn save(&self, running: &RunningBackup) -> Result<()> {
        write_json_atomic(&running.dir.join(RECORD_FILE), &running.record).await
    }

    /// Write the manifest and terminal status, then release the run lock.
    pub async fn finalize(
        &self,
        mut running: RunningBackup,
        status: BackupStatus,
        manifest: &Manifest,
    ) -> Result<BackupRecord> {
        debug_assert!(status != BackupStatus::Running);

        write_json_atomic(&running.dir.join(MANIFEST_FILE), manifest).await?;

        running.record.status = status;
        running.record.end_time = Some(Utc::now());
        running.record.data_bytes = manifest.total_bytes;
        write_json_atomic(&running.dir.join(RECORD_FILE), &running.record).await?;
        running.finalized = true;

        if let Some(lock) = running.lock.take() {
            lock.release()?;
        }
        info!(backup_id = %running.record.id, status = %status, "Backup finalized");
        Ok(running.record.clone())
    }

    pub async fn read_manifest(&self, id: BackupId) -> Result<Manifest> {
        read_json(&self.manifest_path(id))
            .await
            .map_err(|e| BackupError::ManifestUnreadable {
                id,
                reason: e.to_string(),
            })
    }

    /// Overwrite the status of a finished backup.
    pub async fn write_status(&self, id: BackupId, status: BackupStatus) -> Result<BackupRecord> {
        let mut record = self.get(id).await?;
        if record.status != status {
            info!(backup_id = %id, from = %record.status, to = %status, "Changing backup status");
            record.status = status;
            write_json_atomic(&self.backup_dir(id).join(RECORD_FILE), &record).await?;
        }
        Ok(record)
    }

    /// Mark a backup whose chain is broken as `ERROR`.
    pub async fn mark_error(&self, id: BackupId) -> Result<BackupRecord> {
        self.write_status(id, BackupStatus::Error).await
    }

    /// Whether a live process currently holds the run lock.
    pub fn run_lock_held(&self) -> Result<bool> {
        Ok(lock::read_holder(&self.dir)?
            .map(|holder| holder.is_live(self.stale_after))
            .unwrap_or(false))
    }
}

/// A backup in `RUNNING` state together with the instance run lock.
///
/// Dropping it without [`Catalog::finalize`] marks the record `ERROR` on a
/// best-effort basis and releases the lock.
#[derive(Debug)]
pub struct RunningBackup {
    record: BackupRecord,
    dir: PathBuf,
    lock: Option<RunLock>,
    finalized: bool,
}

impl RunningBackup {
    pub fn id(&self) -> BackupId {
        self.record.id
    }

    pub fn record(&self) -> &BackupRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut BackupRecord {
        &mut self.record
    }

    pub fn database_dir(&self) -> PathBuf {
        self.dir.join(DATABASE_DIR)
    }
}

impl Drop for RunningBackup {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        warn!(backup_id = %self.record.id, "Backup dropped while RUNNING, marking ERROR");
        self.record.status = BackupStatus::Error;
        self.record.end_time = Some(Utc::now());
        if let Err(e) = write_json_atomic_sync(&self.dir.join(RECORD_FILE), &self.record) {
            warn!(backup_id = %self.record.id, "Failed to mark backup ERROR: {}", e);
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn write_json_atomic_sync<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use std::io::Write;

    let data = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    Ok(())
}
