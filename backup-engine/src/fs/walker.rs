//! Data directory traversal.
//!
//! Walks the cluster data directory, classifies every entry (relation
//! segment, regular file, directory), applies the exclusion policy and
//! follows tablespace links under `pg_tblspc/`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use super::metadata::EntryStat;
use crate::catalog::FileKind;
use crate::utils::errors::{BackupError, Result};

pub const TABLESPACE_DIR: &str = "pg_tblspc";

/// Server runtime files with no meaning in a backup.
const EXCLUDED_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "postgresql.auto.conf.tmp",
    "current_logfiles.tmp",
    "recovery.conf",
    "backup_label",
    "tablespace_map",
    "pg_internal.init",
    "ptrack_init",
];

/// Directories kept empty in a backup: the directory itself is recorded,
/// its contents are not.
const EXCLUDED_DIR_CONTENTS: &[&str] = &[
    "pg_wal",
    "pg_xlog",
    "pg_stat_tmp",
    "pgsql_tmp",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_subtrans",
];

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Extra file or directory names to leave out entirely
    pub exclude: Vec<String>,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path of the file on disk (tablespace links resolved)
    pub path: PathBuf,

    /// Path relative to the data directory, `/` separated
    pub relative_path: String,

    pub kind: FileKind,

    pub size: u64,

    /// Unix mode bits
    pub mode: u32,

    /// Modification time (seconds since the epoch)
    pub mtime: i64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, rel_prefix: &str, root: &Path) -> std::io::Result<Self> {
        let stat = EntryStat::read(entry.path())?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let relative_path = join_relative(rel_prefix, &to_slash(relative));

        let kind = if stat.is_dir {
            FileKind::Directory
        } else if is_data_file(&relative_path) {
            FileKind::DataFile
        } else {
            FileKind::Regular
        };

        Ok(Self {
            path: entry.path().to_path_buf(),
            relative_path,
            kind,
            size: stat.size,
            mode: stat.mode.unwrap_or(0o600),
            mtime: stat.mtime,
        })
    }

    /// Segment number encoded in a relation file name (`16384.2` -> 2).
    pub fn segment_number(&self) -> u32 {
        segment_number(&self.relative_path)
    }
}

/// Result of walking a data directory.
#[derive(Debug, Default)]
pub struct DataDirectory {
    /// Entries sorted by relative path
    pub files: Vec<FileInfo>,
    /// Tablespace oid -> link target
    pub tablespaces: BTreeMap<String, PathBuf>,
}

/// Walk a data directory and collect every entry to back up.
///
/// Unreadable directories are fatal (`PermissionDenied`); entries that vanish
/// mid-walk are skipped.
pub fn walk_data_directory(root: &Path, options: &WalkOptions) -> Result<DataDirectory> {
    if !root.is_dir() {
        return Err(BackupError::Io(std::io::Error::new(
            ErrorKind::NotFound,
            format!("data directory \"{}\" does not exist", root.display()),
        )));
    }

    let mut out = DataDirectory::default();
    walk_tree(root, "", options, &mut out)?;

    let links: Vec<(String, PathBuf)> = out
        .tablespaces
        .iter()
        .map(|(oid, target)| (oid.clone(), target.clone()))
        .collect();
    for (oid, target) in links {
        info!("Following tablespace {} at {}", oid, target.display());
        let prefix = format!("{}/{}", TABLESPACE_DIR, oid);
        out.files.push(FileInfo {
            path: target.clone(),
            relative_path: prefix.clone(),
            kind: FileKind::Directory,
            size: 0,
            mode: EntryStat::read(&target)
                .ok()
                .and_then(|s| s.mode)
                .unwrap_or(0o700),
            mtime: 0,
        });
        walk_tree(&target, &prefix, options, &mut out)?;
    }

    out.files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(out)
}

fn walk_tree(
    root: &Path,
    rel_prefix: &str,
    options: &WalkOptions,
    out: &mut DataDirectory,
) -> Result<()> {
    let mut iter = WalkDir::new(root).follow_links(false).min_depth(1).into_iter();
    while let Some(entry) = iter.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                match err.io_error().map(|e| e.kind()) {
                    Some(ErrorKind::NotFound) => {
                        debug!("{} vanished during walk", path.display());
                        continue;
                    }
                    Some(ErrorKind::PermissionDenied) => {
                        return Err(BackupError::PermissionDenied(format!(
                            "Cannot open directory \"{}\"",
                            path.display()
                        )));
                    }
                    _ => return Err(BackupError::Io(err.into())),
                }
            }
        };

        let name = entry.file_name().to_string_lossy();
        if options.exclude.iter().any(|pattern| name == pattern.as_str()) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }

        if entry.file_type().is_symlink() {
            if rel_prefix.is_empty() && is_tablespace_link(&entry, root) {
                let target = std::fs::read_link(entry.path())?;
                out.tablespaces.insert(name.to_string(), target);
            } else {
                debug!("Skipping symbolic link {}", entry.path().display());
            }
            continue;
        }

        if !entry.file_type().is_dir() && is_excluded_file(&name) {
            debug!("Excluding {}", entry.path().display());
            continue;
        }

        let info = match FileInfo::from_entry(&entry, rel_prefix, root) {
            Ok(info) => info,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} vanished during walk", entry.path().display());
                continue;
            }
            Err(e) => return Err(BackupError::from_open(e, "file", entry.path())),
        };

        if entry.file_type().is_dir() && EXCLUDED_DIR_CONTENTS.contains(&&*name) {
            iter.skip_current_dir();
        }
        out.files.push(info);
    }

    Ok(())
}

fn is_tablespace_link(entry: &DirEntry, root: &Path) -> bool {
    entry.depth() == 2
        && entry
            .path()
            .parent()
            .map(|p| p == root.join(TABLESPACE_DIR))
            .unwrap_or(false)
}

fn is_excluded_file(name: &str) -> bool {
    EXCLUDED_FILES.contains(&name) || name.ends_with("_ptrack") || is_temp_relation(name)
}

/// Temporary relation files are named `t<backend>_<relfilenode>`.
fn is_temp_relation(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('t') else {
        return false;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && rest[digits..].starts_with('_')
}

fn is_relation_name(name: &str) -> bool {
    let mut parts = name.splitn(2, '.');
    let base = parts.next().unwrap_or("");
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(base) && parts.next().map(all_digits).unwrap_or(true)
}

/// Whether `rel_path` is a relation segment stored page by page.
pub fn is_data_file(rel_path: &str) -> bool {
    let parts: Vec<&str> = rel_path.split('/').collect();
    let name = match parts.as_slice() {
        ["global", name] => name,
        ["base", _db, name] => name,
        [TABLESPACE_DIR, _oid, _version, _db, name] => name,
        _ => return false,
    };
    is_relation_name(name)
}

/// Segment number of a relation file path (`base/1/16384.2` -> 2).
pub fn segment_number(rel_path: &str) -> u32 {
    rel_path
        .rsplit('/')
        .next()
        .and_then(|name| name.split_once('.'))
        .and_then(|(_, seg)| seg.parse().ok())
        .unwrap_or(0)
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn join_relative(prefix: &str, rel: &str) -> String {
    if prefix.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", prefix, rel)
    }
}
