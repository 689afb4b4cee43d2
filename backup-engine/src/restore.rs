//! Rebuild a data directory from a backup chain.
//!
//! Data files are reassembled block by block from the base FULL forward to
//! the target and cut to the target's length. Regular files come from the
//! newest chain member that stored them.

use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::catalog::{BackupId, BackupRecord, BackupStatus, Catalog, FileKind, Manifest, ManifestEntry};
use crate::executor::datafile::{StoredBlockReader, StoredContent};
use crate::fs::metadata::apply_mode;
use crate::fs::walker::TABLESPACE_DIR;
use crate::page::BLOCK_SIZE;
use crate::transfer::progress::format_bytes;
use crate::utils::errors::{BackupError, Result};
use crate::validate::Validator;

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub backup_id: BackupId,
    pub destination: PathBuf,
    /// Original tablespace location -> new location
    pub tablespace_remap: BTreeMap<PathBuf, PathBuf>,
    /// Validate every chain member first
    pub verify: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub backup_id: BackupId,
    /// Chain members, base FULL first
    pub chain: Vec<BackupId>,
    pub files: usize,
    pub bytes_written: u64,
}

struct ChainMember {
    record: BackupRecord,
    manifest: Manifest,
    database_dir: PathBuf,
}

pub struct Restorer {
    catalog: Catalog,
    validator: Validator,
}

impl Restorer {
    pub fn new(catalog: Catalog, validator: Validator) -> Self {
        Self { catalog, validator }
    }

    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreSummary> {
        let id = request.backup_id;
        let target = self.catalog.get(id).await?;
        if target.status != BackupStatus::Ok {
            return Err(BackupError::NotRestorable {
                id,
                status: target.status,
            });
        }

        let index = self.catalog.index().await?;
        let mut records: Vec<BackupRecord> = index.chain(id)?.into_iter().cloned().collect();
        records.reverse();

        let mut chain = Vec::with_capacity(records.len());
        for record in records {
            let manifest = self.catalog.read_manifest(record.id).await?;
            chain.push(ChainMember {
                database_dir: self.catalog.database_dir(record.id),
                record,
                manifest,
            });
        }
        let Some(target) = chain.last() else {
            return Err(BackupError::BackupNotFound(id));
        };

        let tablespaces = plan_tablespaces(&target.manifest, &request.tablespace_remap)?;
        for dest in tablespaces.values() {
            ensure_empty(dest).await?;
        }
        ensure_empty(&request.destination).await?;

        if request.verify && !self.validator.validate_restorable(id).await? {
            // Validate member by member to record which one is damaged.
            for member in &chain {
                let report = self.validator.validate(member.record.id).await?;
                if !report.is_ok() {
                    return Err(BackupError::NotRestorable {
                        id: member.record.id,
                        status: report.status,
                    });
                }
            }
            return Err(BackupError::NotRestorable {
                id,
                status: self.catalog.get(id).await?.status,
            });
        }

        info!(
            backup_id = %id,
            "Restoring chain of {} backups into {}",
            chain.len(),
            request.destination.display()
        );
        tokio::fs::create_dir_all(&request.destination).await?;
        for (oid, dest) in &tablespaces {
            tokio::fs::create_dir_all(dest).await?;
            let link_dir = request.destination.join(TABLESPACE_DIR);
            tokio::fs::create_dir_all(&link_dir).await?;
            make_symlink(dest, &link_dir.join(oid)).await?;
            info!("Tablespace {} restored to {}", oid, dest.display());
        }

        let mut files = 0usize;
        let mut bytes_written = 0u64;
        let mut directories = Vec::new();
        for entry in &target.manifest.files {
            let dest = request.destination.join(&entry.path);
            match entry.kind {
                FileKind::Directory => {
                    if !is_tablespace_link(&entry.path, &tablespaces) {
                        tokio::fs::create_dir_all(&dest).await?;
                        directories.push((dest, entry.mode));
                    }
                    continue;
                }
                FileKind::DataFile => {
                    bytes_written += restore_data_file(&chain, entry, &dest).await?;
                }
                FileKind::Regular => {
                    bytes_written += restore_regular_file(&chain, id, entry, &dest).await?;
                }
            }
            apply_mode(&dest, entry.mode)?;
            files += 1;
        }
        // Directory permissions last, so restrictive modes do not block writes.
        for (dir, mode) in directories.iter().rev() {
            apply_mode(dir, *mode)?;
        }

        info!(
            backup_id = %id,
            "Restore completed: {} files, {}",
            files,
            format_bytes(bytes_written)
        );
        Ok(RestoreSummary {
            backup_id: id,
            chain: chain.iter().map(|m| m.record.id).collect(),
            files,
            bytes_written,
        })
    }
}

/// Destination of every tablespace of `manifest`, keyed by oid.
fn plan_tablespaces(
    manifest: &Manifest,
    remap: &BTreeMap<PathBuf, PathBuf>,
) -> Result<BTreeMap<String, PathBuf>> {
    for old in remap.keys() {
        if !manifest.tablespaces.values().any(|orig| orig == old) {
            return Err(BackupError::UnknownTablespaceMapping(old.clone()));
        }
    }

    let mut out = BTreeMap::new();
    for (oid, orig) in &manifest.tablespaces {
        let dest = remap.get(orig).unwrap_or(orig).clone();
        if !dest.is_absolute() {
            return Err(BackupError::InvalidTablespaceDestination(dest));
        }
        out.insert(oid.clone(), dest);
    }
    Ok(out)
}

async fn ensure_empty(dir: &Path) -> Result<()> {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(BackupError::DestinationNotEmpty(dir.to_path_buf()));
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::from_open(e, "directory", dir)),
    }
}

fn is_tablespace_link(path: &str, tablespaces: &BTreeMap<String, PathBuf>) -> bool {
    path.strip_prefix(TABLESPACE_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|oid| tablespaces.contains_key(oid))
}

#[cfg(unix)]
async fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn make_symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "tablespace links need a unix platform",
    ))
}

fn stored_entry<'a>(member: &'a ChainMember, path: &str) -> Option<&'a ManifestEntry> {
    member
        .manifest
        .files
        .binary_search_by(|e| e.path.as_str().cmp(path))
        .ok()
        .map(|idx| &member.manifest.files[idx])
        .filter(|e| e.is_stored())
}

/// Apply stored blocks oldest backup first, then cut to the target length.
async fn restore_data_file(chain: &[ChainMember], entry: &ManifestEntry, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(dest)
        .await?;

    let mut written = 0u64;
    for member in chain {
        let Some(stored) = stored_entry(member, &entry.path).filter(|e| e.kind == FileKind::DataFile)
        else {
            continue;
        };
        let source = member.database_dir.join(&stored.path);
        let file = tokio::fs::File::open(&source)
            .await
            .map_err(|e| BackupError::from_open(e, "stored file", &source))?;
        let mut blocks = StoredBlockReader::new(BufReader::new(file));

        while let Some(block) = blocks.next_block().await? {
            let offset = block.blkno as u64 * BLOCK_SIZE as u64;
            match block.content {
                StoredContent::Page(page) => {
                    out.seek(SeekFrom::Start(offset)).await?;
                    out.write_all(&page).await?;
                    written += page.len() as u64;
                }
                StoredContent::Truncated => {
                    out.flush().await?;
                    out.set_len(offset).await?;
                }
            }
        }
        debug!(
            "Applied {} blocks of \"{}\" from {}",
            stored.copied_block_count(),
            entry.path,
            member.record.id
        );
    }

    let length = entry.n_blocks.unwrap_or_default() as u64 * BLOCK_SIZE as u64;
    out.flush().await?;
    out.set_len(length).await?;
    out.sync_all().await?;
    Ok(written)
}

async fn restore_regular_file(
    chain: &[ChainMember],
    target: BackupId,
    entry: &ManifestEntry,
    dest: &Path,
) -> Result<u64> {
    let Some(member) = chain
        .iter()
        .rev()
        .find(|m| stored_entry(m, &entry.path).is_some_and(|e| e.kind == FileKind::Regular))
    else {
        return Err(BackupError::ManifestUnreadable {
            id: target,
            reason: format!("no backup in the chain stores \"{}\"", entry.path),
        });
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let source = member.database_dir.join(&entry.path);
    let bytes = tokio::fs::copy(&source, dest)
        .await
        .map_err(|e| BackupError::from_open(e, "stored file", &source))?;
    Ok(bytes)
}
