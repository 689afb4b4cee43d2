//! Copy pipeline: executes a [`FilePlan`] against the backup directory.
//!
//! Each file is one task gated by a semaphore sized to the job count. Files
//! are dispatched largest first. The first unrecoverable error cancels the
//! remaining work; entries of files that finished are kept in the partial
//! manifest returned with the error.

pub mod datafile;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{BackupId, FileKind, Manifest, ManifestEntry};
use crate::config::Compression;
use crate::fetch::BlockFetcher;
use crate::fs::FileInfo;
use crate::strategy::{CopyAction, FilePlan, PlannedFile};
use crate::transfer::progress::{format_bytes, format_duration, spawn_reporter, CopyProgress};
use crate::utils::errors::{BackupError, Result};

use datafile::{copy_data_file, StoredWriter};

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub compression: Compression,
    pub compression_level: i32,
    pub progress_interval: Duration,
}

/// A failed run with the entries of the files that did complete.
#[derive(Debug)]
pub struct RunFailure {
    pub error: BackupError,
    pub partial: Manifest,
}

pub struct CopyPipeline {
    backup_id: BackupId,
    destination: PathBuf,
    fetcher: Arc<BlockFetcher>,
    options: PipelineOptions,
    cancel: CancellationToken,
}

/// State shared by the copy tasks of one run.
pub(crate) struct FileCopier {
    pub(crate) destination: PathBuf,
    pub(crate) fetcher: Arc<BlockFetcher>,
    pub(crate) compression: Compression,
    pub(crate) compression_level: i32,
    pub(crate) parent_id: Option<BackupId>,
    pub(crate) progress: Arc<CopyProgress>,
    pub(crate) cancel: CancellationToken,
}

impl CopyPipeline {
    /// `destination` is the `database/` directory of the running backup.
    pub fn new(
        backup_id: BackupId,
        destination: PathBuf,
        fetcher: Arc<BlockFetcher>,
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backup_id,
            destination,
            fetcher,
            options,
            cancel,
        }
    }

    pub async fn run(
        &self,
        plan: FilePlan,
        parallelism: usize,
    ) -> std::result::Result<Manifest, RunFailure> {
        let started = Instant::now();
        let mut manifest = Manifest::new(self.backup_id);
        manifest.removed = plan.removed;
        manifest.tablespaces = plan.tablespaces;

        let mut work = Vec::new();
        for planned in plan.files {
            match (&planned.action, &planned.parent_entry, plan.parent_id) {
                (CopyAction::Directory, _, _) => {
                    if let Err(e) = self.make_directory(&planned.file).await {
                        manifest.seal();
                        return Err(RunFailure {
                            error: e,
                            partial: manifest,
                        });
                    }
                    manifest.files.push(directory_entry(&planned.file));
                }
                (CopyAction::Unchanged, Some(prev), Some(parent_id)) => {
                    manifest.files.push(inherited_entry(&planned.file, prev, parent_id));
                }
                _ => work.push(planned),
            }
        }
        work.sort_by(|a, b| b.file.size.cmp(&a.file.size));

        let total_bytes: u64 = work.iter().map(|p| p.file.size).sum();
        let progress = Arc::new(CopyProgress::new(work.len(), total_bytes));
        info!(
            "Copying {} files ({}) with {} jobs, {} inherited from the parent",
            work.len(),
            format_bytes(total_bytes),
            parallelism.max(1),
            manifest.files.iter().filter(|e| e.inherited_from.is_some()).count()
        );

        let run_token = self.cancel.child_token();
        let copier = Arc::new(FileCopier {
            destination: self.destination.clone(),
            fetcher: Arc::clone(&self.fetcher),
            compression: self.options.compression,
            compression_level: self.options.compression_level,
            parent_id: plan.parent_id,
            progress: Arc::clone(&progress),
            cancel: run_token.clone(),
        });

        let stop_reporter = CancellationToken::new();
        let reporter = spawn_reporter(
            Arc::clone(&progress),
            self.options.progress_interval,
            stop_reporter.clone(),
        );

        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut handles = Vec::with_capacity(work.len());

        for planned in work {
            let sem = Arc::clone(&semaphore);
            let copier = Arc::clone(&copier);
            let token = run_token.clone();

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = sem.acquire_owned() => permit
                        .map_err(|e| BackupError::Io(std::io::Error::other(format!("Semaphore closed: {}", e))))?,
                    _ = token.cancelled() => return Err(BackupError::Cancelled),
                };
                if token.is_cancelled() {
                    return Err(BackupError::Cancelled);
                }

                let path = planned.file.relative_path.clone();
                let result = copy_file(&copier, &planned).await;
                drop(permit);
                copier.progress.file_done();

                match result {
                    Ok(entry) => Ok(Some(entry)),
                    Err(e) if e.is_vanished() => {
                        info!("File \"{}\" is not found", path);
                        Ok(None)
                    }
                    Err(BackupError::Cancelled) => Err(BackupError::Cancelled),
                    Err(e) => {
                        error!("Failed to copy \"{}\": {}", path, e);
                        token.cancel();
                        Err(e)
                    }
                }
            });
            handles.push(handle);
        }

        let mut failure: Option<BackupError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(Some(entry))) => manifest.files.push(entry),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    // Keep the root cause rather than the cancellations it triggered.
                    if matches!(failure, None | Some(BackupError::Cancelled)) {
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    warn!("File copy task panicked: {}", e);
                    run_token.cancel();
                    if failure.is_none() {
                        failure = Some(BackupError::Io(std::io::Error::other(format!(
                            "file copy task failed: {}",
                            e
                        ))));
                    }
                }
            }
        }

        stop_reporter.cancel();
        let _ = reporter.await;

        if self.cancel.is_cancelled() {
            failure = Some(BackupError::Cancelled);
        }
        manifest.seal();

        let snap = progress.snapshot();
        match failure {
            Some(error) => {
                warn!(
                    "Copy stopped after {}/{} files: {}",
                    snap.files_done, snap.total_files, error
                );
                Err(RunFailure {
                    error,
                    partial: manifest,
                })
            }
            None => {
                info!(
                    "Copied {} files, read {}, stored {} in {}",
                    snap.files_done,
                    format_bytes(snap.bytes_read),
                    format_bytes(manifest.total_bytes),
                    format_duration(started.elapsed().as_secs())
                );
                Ok(manifest)
            }
        }
    }

    async fn make_directory(&self, file: &FileInfo) -> Result<()> {
        tokio::fs::create_dir_all(self.destination.join(&file.relative_path)).await?;
        Ok(())
    }
}

async fn copy_file(copier: &FileCopier, planned: &PlannedFile) -> Result<ManifestEntry> {
    match &planned.action {
        CopyAction::DataBlocks(selection) => copy_data_file(copier, planned, selection).await,
        CopyAction::Whole => copy_regular_file(copier, planned, false).await,
        CopyAction::WholeIfChanged => copy_regular_file(copier, planned, true).await,
        // Unchanged without a parent entry cannot be inherited.
        CopyAction::Unchanged => copy_regular_file(copier, planned, false).await,
        CopyAction::Directory => Ok(directory_entry(&planned.file)),
    }
}

/// Copy a non-data file as-is with a running CRC-32.
///
/// With `skip_if_same`, a copy identical to the parent's is discarded and
/// the entry inherits the parent's bytes.
async fn copy_regular_file(
    copier: &FileCopier,
    planned: &PlannedFile,
    skip_if_same: bool,
) -> Result<ManifestEntry> {
    let file = &planned.file;
    let mut source = tokio::fs::File::open(&file.path)
        .await
        .map_err(|e| BackupError::from_open(e, "file", &file.path))?;

    let dest = copier.destination.join(&file.relative_path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let guard = PartialFile::new(dest.clone());
    let mut writer = StoredWriter::new(BufWriter::new(tokio::fs::File::create(&dest).await?));

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        if copier.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await?;
        copier.progress.add_bytes(n as u64);
    }

    let (mut out, checksum, stored) = writer.into_parts();
    out.flush().await?;
    out.into_inner().sync_all().await?;

    if skip_if_same {
        if let (Some(prev), Some(parent_id)) = (&planned.parent_entry, copier.parent_id) {
            if prev.kind == FileKind::Regular && prev.checksum == checksum && prev.size == stored {
                debug!("File \"{}\" unchanged since the parent", file.relative_path);
                drop(guard);
                return Ok(inherited_entry(file, prev, parent_id));
            }
        }
    }
    guard.keep();

    Ok(ManifestEntry {
        path: file.relative_path.clone(),
        kind: FileKind::Regular,
        size: stored,
        mode: file.mode,
        mtime: file.mtime,
        stored_bytes: Some(stored),
        checksum,
        n_blocks: None,
        copied_blocks: Vec::new(),
        truncated_at: None,
        inherited_from: None,
    })
}

fn directory_entry(file: &FileInfo) -> ManifestEntry {
    ManifestEntry {
        path: file.relative_path.clone(),
        kind: FileKind::Directory,
        size: 0,
        mode: file.mode,
        mtime: file.mtime,
        stored_bytes: None,
        checksum: 0,
        n_blocks: None,
        copied_blocks: Vec::new(),
        truncated_at: None,
        inherited_from: None,
    }
}

/// Entry for a file whose bytes live in the parent chain.
pub(crate) fn inherited_entry(file: &FileInfo, prev: &ManifestEntry, parent_id: BackupId) -> ManifestEntry {
    let holder = if prev.is_stored() {
        parent_id
    } else {
        prev.inherited_from.unwrap_or(parent_id)
    };
    ManifestEntry {
        path: file.relative_path.clone(),
        kind: prev.kind,
        size: if prev.kind == FileKind::DataFile { file.size } else { prev.size },
        mode: file.mode,
        mtime: file.mtime,
        stored_bytes: None,
        checksum: prev.checksum,
        n_blocks: (prev.kind == FileKind::DataFile)
            .then(|| file.size.div_ceil(crate::page::BLOCK_SIZE as u64) as u32),
        copied_blocks: Vec::new(),
        truncated_at: None,
        inherited_from: Some(holder),
    }
}

/// Destination file removed on drop unless kept.
pub(crate) struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial file {}: {}", self.path.display(), e);
                }
            }
        }
    }
}
