//! Entry attributes read by the walker and reapplied on restore.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Attributes of a data directory entry, links followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    pub size: u64,
    /// Seconds since the epoch
    pub mtime: i64,
    /// Permission bits, `None` where the platform has none
    pub mode: Option<u32>,
    pub is_dir: bool,
}

impl EntryStat {
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        Ok(Self {
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime,
            mode: permission_bits(&meta),
            is_dir: meta.is_dir(),
        })
    }
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permission_bits(_meta: &fs::Metadata) -> Option<u32> {
    None
}

/// Set permission bits of a restored entry. Mode 0 means unknown.
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
pub fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
