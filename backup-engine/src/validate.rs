//! Backup validation: recompute stored checksums, decode data files page by
//! page and check lineage.
//!
//! Validation only ever changes the status of the backup it validates.
//! Descendants of a broken chain are reported, and marked `ERROR` only on
//! request through [`Validator::mark_orphans`].

use std::collections::BTreeSet;
use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::catalog::{
    BackupId, BackupMode, BackupRecord, BackupStatus, Catalog, ChainBreak, FileKind, Manifest,
    ManifestEntry, MANIFEST_FILE,
};
use crate::executor::datafile::{StoredBlockReader, StoredContent};
use crate::fs::walker::segment_number;
use crate::page::{self, absolute_block, PageState};
use crate::utils::errors::{BackupError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileProblem {
    Missing,
    Unreadable(String),
    /// Stored data file does not decode
    Malformed(String),
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch { expected: u32, actual: u32 },
    InvalidPage { block: u32, reason: String },
    /// Entry of a FULL backup without stored content
    NotStored,
}

impl fmt::Display for FileProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileProblem::Missing => write!(f, "stored file is missing"),
            FileProblem::Unreadable(e) => write!(f, "cannot read stored file: {}", e),
            FileProblem::Malformed(e) => write!(f, "stored file is malformed: {}", e),
            FileProblem::SizeMismatch { expected, actual } => {
                write!(f, "size {} differs from recorded {}", actual, expected)
            }
            FileProblem::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum {:08X} differs from recorded {:08X}",
                actual, expected
            ),
            FileProblem::InvalidPage { block, reason } => {
                write!(f, "block {} is invalid: {}", block, reason)
            }
            FileProblem::NotStored => write!(f, "FULL backup entry has no stored content"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIssue {
    pub path: String,
    pub problem: FileProblem,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub backup_id: BackupId,
    pub status: BackupStatus,
    pub issues: Vec<FileIssue>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.status == BackupStatus::Ok
    }
}

#[derive(Debug, Default)]
pub struct InstanceReport {
    /// Reports in validation order (oldest first)
    pub reports: Vec<ValidationReport>,
    /// Backups refused because an ancestor is not `OK`
    pub chain_breaks: Vec<ChainBreak>,
}

impl InstanceReport {
    pub fn is_ok(&self) -> bool {
        self.chain_breaks.is_empty()
            && self
                .reports
                .iter()
                .all(|r| matches!(r.status, BackupStatus::Ok | BackupStatus::Running))
    }
}

#[derive(Clone)]
pub struct Validator {
    catalog: Catalog,
    jobs: usize,
}

impl Validator {
    pub fn new(catalog: Catalog, jobs: usize) -> Self {
        Self {
            catalog,
            jobs: jobs.max(1),
        }
    }

    /// Validate one backup and record the outcome in its status.
    ///
    /// `ERROR` and `CORRUPT` backups are reported without rechecking. An
    /// `OK` backup with a broken chain fails with `ChainBroken`.
    pub async fn validate(&self, id: BackupId) -> Result<ValidationReport> {
        let record = self.catalog.get(id).await?;
        let report = |status, issues| ValidationReport {
            backup_id: id,
            status,
            issues,
        };

        match record.status {
            BackupStatus::Running => {
                if self.is_running_now(id).await? {
                    info!(backup_id = %id, "Backup is still running");
                    return Ok(report(BackupStatus::Running, Vec::new()));
                }
                warn!(backup_id = %id, "Backup is RUNNING without a live process, marking ERROR");
                self.catalog.write_status(id, BackupStatus::Error).await?;
                return Ok(report(BackupStatus::Error, Vec::new()));
            }
            BackupStatus::Error | BackupStatus::Corrupt => {
                info!(backup_id = %id, status = %record.status, "Skipping backup with terminal status");
                return Ok(report(record.status, Vec::new()));
            }
            BackupStatus::Ok => {}
        }

        let index = self.catalog.index().await?;
        index.chain(id)?;

        info!(backup_id = %id, "Validating backup");
        let issues = match self.catalog.read_manifest(id).await {
            Ok(manifest) => self.check_files(&record, &manifest).await?,
            Err(e) => vec![FileIssue {
                path: MANIFEST_FILE.to_string(),
                problem: FileProblem::Unreadable(e.to_string()),
            }],
        };

        if issues.is_empty() {
            info!(backup_id = %id, "Backup is valid");
            return Ok(report(BackupStatus::Ok, issues));
        }

        for issue in &issues {
            warn!(backup_id = %id, "File \"{}\": {}", issue.path, issue.problem);
        }
        error!("Backup {} data files are corrupted", id);
        self.catalog.write_status(id, BackupStatus::Corrupt).await?;
        Ok(report(BackupStatus::Corrupt, issues))
    }

    /// Whether `id` and its whole chain can be restored. Changes nothing.
    pub async fn validate_restorable(&self, id: BackupId) -> Result<bool> {
        let index = self.catalog.index().await?;
        let chain = match index.chain(id) {
            Ok(chain) => chain,
            Err(b) => {
                warn!(backup_id = %id, "Chain broken at {}: {}", b.ancestor, b.reason);
                return Ok(false);
            }
        };

        for member in chain {
            if member.status != BackupStatus::Ok {
                warn!(backup_id = %member.id, status = %member.status, "Chain member is not OK");
                return Ok(false);
            }
            let manifest = match self.catalog.read_manifest(member.id).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(backup_id = %member.id, "{}", e);
                    return Ok(false);
                }
            };
            let issues = self.check_files(member, &manifest).await?;
            if let Some(issue) = issues.first() {
                warn!(
                    backup_id = %member.id,
                    "File \"{}\": {} ({} problems)",
                    issue.path,
                    issue.problem,
                    issues.len()
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Validate every backup of the instance, oldest first.
    pub async fn validate_instance(&self) -> Result<InstanceReport> {
        let mut out = InstanceReport::default();

        for record in self.catalog.list().await? {
            match self.validate(record.id).await {
                Ok(report) => out.reports.push(report),
                Err(BackupError::ChainBroken {
                    backup,
                    ancestor,
                    reason,
                }) => {
                    warn!(backup_id = %backup, "Chain broken at {}: {}", ancestor, reason);
                    out.chain_breaks.push(ChainBreak {
                        backup,
                        ancestor,
                        reason,
                    });
                }
                Err(BackupError::BackupNotFound(id)) => {
                    debug!(backup_id = %id, "Backup removed during validation");
                }
                Err(e) => return Err(e),
            }
        }

        if out.is_ok() {
            info!("All backups are valid");
        } else {
            warn!("Some backups are not valid");
        }
        Ok(out)
    }

    /// Mark `ERROR` every backup a validation found orphaned, together with
    /// the backups built on top of it.
    pub async fn mark_orphans(&self, report: &InstanceReport) -> Result<Vec<BackupId>> {
        let index = self.catalog.index().await?;
        let mut orphans = BTreeSet::new();
        for b in &report.chain_breaks {
            orphans.insert(b.backup);
            orphans.extend(index.descendants_of(b.backup).into_iter().map(|r| r.id));
        }

        let mut marked = Vec::new();
        for id in orphans {
            if index.get(id).is_some_and(|r| r.status == BackupStatus::Error) {
                continue;
            }
            match self.catalog.mark_error(id).await {
                Ok(_) => marked.push(id),
                Err(BackupError::BackupNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if !marked.is_empty() {
            warn!("Marked {} orphaned backups ERROR", marked.len());
        }
        Ok(marked)
    }

    /// A `RUNNING` record is live when a process holds the run lock and no
    /// newer backup exists.
    async fn is_running_now(&self, id: BackupId) -> Result<bool> {
        if !self.catalog.run_lock_held()? {
            return Ok(false);
        }
        let newest = self.catalog.list().await?.iter().map(|r| r.id).max();
        Ok(newest == Some(id))
    }

    async fn check_files(&self, record: &BackupRecord, manifest: &Manifest) -> Result<Vec<FileIssue>> {
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let mut issues = Vec::new();
        let mut handles = Vec::new();

        for entry in &manifest.files {
            if entry.kind == FileKind::Directory {
                continue;
            }
            if !entry.is_stored() {
                if record.mode == BackupMode::Full {
                    issues.push(FileIssue {
                        path: entry.path.clone(),
                        problem: FileProblem::NotStored,
                    });
                }
                continue;
            }

            let sem = Arc::clone(&semaphore);
            let entry = entry.clone();
            let stored = self.catalog.database_dir(record.id).join(&entry.path);
            let checksums = record.checksums_enabled;
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                check_stored_file(&stored, &entry, checksums)
                    .await
                    .map(|problem| FileIssue {
                        path: entry.path.clone(),
                        problem,
                    })
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Some(issue)) => issues.push(issue),
                Ok(None) => {}
                Err(e) => {
                    return Err(BackupError::Io(std::io::Error::other(format!(
                        "validation task failed: {}",
                        e
                    ))))
                }
            }
        }
        issues.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(issues)
    }
}

/// First problem found with one stored file.
pub(crate) async fn check_stored_file(
    stored: &std::path::Path,
    entry: &ManifestEntry,
    checksums_enabled: bool,
) -> Option<FileProblem> {
    let file = match tokio::fs::File::open(stored).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Some(FileProblem::Missing),
        Err(e) => return Some(FileProblem::Unreadable(e.to_string())),
    };
    let reader = BufReader::new(file);

    let (checksum, size, bad_page) = match entry.kind {
        FileKind::DataFile => {
            let segno = segment_number(&entry.path);
            let mut blocks = StoredBlockReader::new(reader);
            let mut bad_page = None;
            loop {
                match blocks.next_block().await {
                    Ok(Some(block)) => {
                        let StoredContent::Page(page) = block.content else {
                            continue;
                        };
                        let abs = absolute_block(segno, block.blkno);
                        if let PageState::Invalid(defect) =
                            page::inspect(&page, abs, checksums_enabled)
                        {
                            bad_page.get_or_insert(FileProblem::InvalidPage {
                                block: block.blkno,
                                reason: defect.to_string(),
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.kind() == ErrorKind::InvalidData => {
                        return Some(FileProblem::Malformed(e.to_string()))
                    }
                    Err(e) => return Some(FileProblem::Unreadable(e.to_string())),
                }
            }
            let (crc, len) = blocks.finish();
            (crc, len, bad_page)
        }
        _ => match hash_stream(reader).await {
            Ok((crc, len)) => (crc, len, None),
            Err(e) => return Some(FileProblem::Unreadable(e.to_string())),
        },
    };

    let expected_size = entry.stored_bytes.unwrap_or_default();
    if size != expected_size {
        return Some(FileProblem::SizeMismatch {
            expected: expected_size,
            actual: size,
        });
    }
    if checksum != entry.checksum {
        return Some(FileProblem::ChecksumMismatch {
            expected: entry.checksum,
            actual: checksum,
        });
    }
    bad_page
}

async fn hash_stream<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> std::io::Result<(u32, u64)> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize(), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::manifest::to_ranges;
    use crate::catalog::{Lsn, TimelineId};
    use crate::config::Compression;
    use crate::executor::datafile::encode_block;
    use std::time::Duration;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(3600);

    /// FULL backup with one data file of two pages and one regular file.
    async fn full_backup(catalog: &Catalog) -> BackupId {
        let mut running = catalog.create(BackupMode::Full, TimelineId(1)).await.unwrap();
        running.record_mut().checksums_enabled = true;
        let id = running.id();
        let db = running.database_dir();

        let mut stored = encode_block(0, &page::new_page(Lsn(0x10), 0, 1), Compression::None, 1);
        stored.extend(encode_block(1, &page::new_page(Lsn(0x20), 1, 2), Compression::Zstd, 1));
        std::fs::create_dir_all(db.join("base/1")).unwrap();
        std::fs::write(db.join("base/1/16384"), &stored).unwrap();
        std::fs::write(db.join("PG_VERSION"), b"16\n").unwrap();

        let mut manifest = Manifest::new(id);
        manifest.files.push(ManifestEntry {
            path: "base/1/16384".to_string(),
            kind: FileKind::DataFile,
            size: 16384,
            mode: 0o600,
            mtime: 0,
            stored_bytes: Some(stored.len() as u64),
            checksum: crc32fast::hash(&stored),
            n_blocks: Some(2),
            copied_blocks: to_ranges(&[0, 1]),
            truncated_at: None,
            inherited_from: None,
        });
        manifest.files.push(ManifestEntry {
            path: "PG_VERSION".to_string(),
            kind: FileKind::Regular,
            size: 3,
            mode: 0o600,
            mtime: 0,
            stored_bytes: Some(3),
            checksum: crc32fast::hash(b"16\n"),
            n_blocks: None,
            copied_blocks: Vec::new(),
            truncated_at: None,
            inherited_from: None,
        });
        manifest.seal();
        catalog.save(&running).await.unwrap();
        catalog.finalize(running, BackupStatus::Ok, &manifest).await.unwrap();
        id
    }

    async fn child(catalog: &Catalog, parent: BackupId) -> BackupId {
        let mut running = catalog.create(BackupMode::Delta, TimelineId(1)).await.unwrap();
        running.record_mut().parent_id = Some(parent);
        let id = running.id();
        catalog.save(&running).await.unwrap();
        catalog.finalize(running, BackupStatus::Ok, &Manifest::new(id)).await.unwrap();
        id
    }

    fn setup() -> (TempDir, Catalog, Validator) {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path(), "main", STALE).unwrap();
        let validator = Validator::new(catalog.clone(), 2);
        (tmp, catalog, validator)
    }

    #[tokio::test]
    async fn test_untouched_backup_is_valid() {
        let (_tmp, catalog, validator) = setup();
        let id = full_backup(&catalog).await;

        let report = validator.validate(id).await.unwrap();
        assert!(report.is_ok(), "{:?}", report.issues);
        assert!(validator.validate_restorable(id).await.unwrap());
        assert_eq!(catalog.get(id).await.unwrap().status, BackupStatus::Ok);
    }

    #[tokio::test]
    async fn test_flipped_byte_makes_backup_corrupt() {
        let (_tmp, catalog, validator) = setup();
        let id = full_backup(&catalog).await;

        let path = catalog.database_dir(id).join("base/1/16384");
        let mut data = std::fs::read(&path).unwrap();
        data[8 + 6000] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let report = validator.validate(id).await.unwrap();
        assert_eq!(report.status, BackupStatus::Corrupt);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].path, "base/1/16384");
        assert_eq!(catalog.get(id).await.unwrap().status, BackupStatus::Corrupt);

        // Terminal: not rechecked.
        let again = validator.validate(id).await.unwrap();
        assert_eq!(again.status, BackupStatus::Corrupt);
        assert!(again.issues.is_empty());
    }

    #[tokio::test]
    async fn test_missing_manifest_is_corrupt() {
        let (_tmp, catalog, validator) = setup();
        let id = full_backup(&catalog).await;
        std::fs::remove_file(catalog.manifest_path(id)).unwrap();

        let report = validator.validate(id).await.unwrap();
        assert_eq!(report.status, BackupStatus::Corrupt);
        assert_eq!(report.issues[0].path, MANIFEST_FILE);
    }

    #[tokio::test]
    async fn test_missing_stored_file() {
        let (_tmp, catalog, validator) = setup();
        let id = full_backup(&catalog).await;
        std::fs::remove_file(catalog.database_dir(id).join("PG_VERSION")).unwrap();

        let report = validator.validate(id).await.unwrap();
        assert_eq!(
            report.issues,
            vec![FileIssue {
                path: "PG_VERSION".to_string(),
                problem: FileProblem::Missing,
            }]
        );
    }

    #[tokio::test]
    async fn test_broken_chain_is_reported_not_cascaded() {
        let (_tmp, catalog, validator) = setup();
        let full = full_backup(&catalog).await;
        let delta = child(&catalog, full).await;
        catalog.write_status(full, BackupStatus::Corrupt).await.unwrap();

        let err = validator.validate(delta).await.unwrap_err();
        assert!(matches!(err, BackupError::ChainBroken { ancestor, .. } if ancestor == full));
        assert!(!validator.validate_restorable(delta).await.unwrap());
        assert_eq!(catalog.get(delta).await.unwrap().status, BackupStatus::Ok);

        let report = validator.validate_instance().await.unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.chain_breaks.len(), 1);
        assert_eq!(catalog.get(delta).await.unwrap().status, BackupStatus::Ok);

        let marked = validator.mark_orphans(&report).await.unwrap();
        assert_eq!(marked, vec![delta]);
        assert_eq!(catalog.get(delta).await.unwrap().status, BackupStatus::Error);
    }

    #[tokio::test]
    async fn test_mark_orphans_follows_descendants() {
        let (_tmp, catalog, validator) = setup();
        let full = full_backup(&catalog).await;
        let first = child(&catalog, full).await;
        let second = child(&catalog, first).await;
        catalog.write_status(full, BackupStatus::Corrupt).await.unwrap();

        // Only the direct child was validated.
        let err = validator.validate(first).await.unwrap_err();
        let chain_break = match err {
            BackupError::ChainBroken { backup, ancestor, reason } => ChainBreak {
                backup,
                ancestor,
                reason,
            },
            other => panic!("expected a broken chain, got {other}"),
        };
        let report = InstanceReport {
            reports: Vec::new(),
            chain_breaks: vec![chain_break],
        };

        let marked = validator.mark_orphans(&report).await.unwrap();
        assert_eq!(marked, vec![first, second]);
        assert_eq!(catalog.get(second).await.unwrap().status, BackupStatus::Error);
        assert_eq!(catalog.get(full).await.unwrap().status, BackupStatus::Corrupt);

        // Already ERROR, nothing left to mark.
        assert!(validator.mark_orphans(&report).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_crashed_running_backup_becomes_error() {
        let (_tmp, catalog, validator) = setup();
        let running = catalog.create(BackupMode::Full, TimelineId(1)).await.unwrap();
        let id = running.id();

        // Lock held by this process: still running.
        assert_eq!(
            validator.validate(id).await.unwrap().status,
            BackupStatus::Running
        );

        // Simulate a crash: lock gone, record left RUNNING.
        std::mem::forget(running);
        std::fs::remove_file(catalog.dir().join(crate::catalog::lock::LOCK_FILE)).unwrap();
        assert_eq!(validator.validate(id).await.unwrap().status, BackupStatus::Error);
        assert_eq!(catalog.get(id).await.unwrap().status, BackupStatus::Error);
    }
}
