//! Exclusive per-instance run lock stored as `run.lock`.
//!
//! The lock file is created with exclusive-create semantics and carries the
//! owner's identity. A lock whose holder process is gone (same host), or that
//! is older than the stale timeout, is broken on the next acquisition.

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::utils::errors::{BackupError, Result};

pub const LOCK_FILE: &str = "run.lock";

/// Attempts to break a stale lock before giving up.
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub owner: Uuid,
    pub hostname: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockEntry {
    fn current() -> Self {
        Self {
            owner: Uuid::new_v4(),
            hostname: local_hostname(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// Whether the holder can still be running.
    pub fn is_live(&self, stale_after: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        if age.to_std().map(|a| a > stale_after).unwrap_or(false) {
            return false;
        }
        if self.hostname != local_hostname() {
            // Cannot check a remote process; trust the timeout.
            return true;
        }
        process_alive(self.pid)
    }

    fn describe(&self) -> String {
        format!(
            "pid {} on {} since {}",
            self.pid,
            self.hostname,
            self.acquired_at.to_rfc3339()
        )
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Read the current lock holder, if any.
pub fn read_holder(dir: &Path) -> Result<Option<LockEntry>> {
    match fs::read(dir.join(LOCK_FILE)) {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Ignoring unreadable lock file in {}: {}", dir.display(), e);
                Ok(None)
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Handle to an acquired run lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    owner: Uuid,
    released: bool,
}

impl RunLock {
    /// Acquire the lock for the instance directory `dir`.
    pub fn acquire(dir: &Path, instance: &str, stale_after: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE);

        for _ in 0..MAX_ATTEMPTS {
            let entry = LockEntry::current();
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let data = serde_json::to_vec_pretty(&entry)?;
                    file.write_all(&data)?;
                    file.sync_all()?;
                    debug!("Acquired run lock {} ({})", path.display(), entry.describe());
                    return Ok(Self {
                        path,
                        owner: entry.owner,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match read_holder(dir)? {
                        Some(holder) if holder.is_live(stale_after) => {
                            return Err(BackupError::Locked {
                                instance: instance.to_string(),
                                holder: holder.describe(),
                            });
                        }
                        Some(holder) => {
                            warn!("Breaking stale run lock held by {}", holder.describe());
                        }
                        None => {
                            warn!("Breaking unreadable run lock {}", path.display());
                        }
                    }
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BackupError::Locked {
            instance: instance.to_string(),
            holder: "a competing process".to_string(),
        })
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Release the lock explicitly.
    pub fn release(mut self) -> Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Only remove a lock we still own: it may have been broken as stale.
        match read_holder(self.path.parent().unwrap_or(Path::new(".")))? {
            Some(entry) if entry.owner == self.owner => {
                fs::remove_file(&self.path)?;
                debug!("Released run lock {}", self.path.display());
            }
            Some(_) => warn!("Run lock {} was taken over by another process", self.path.display()),
            None => {}
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(3600);

    #[test]
    fn test_second_acquire_is_locked() -> Result<()> {
        let dir = TempDir::new()?;
        let lock = RunLock::acquire(dir.path(), "main", STALE)?;

        let err = RunLock::acquire(dir.path(), "main", STALE).unwrap_err();
        assert!(matches!(err, BackupError::Locked { .. }));

        lock.release()?;
        assert!(!dir.path().join(LOCK_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_drop_releases() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let _lock = RunLock::acquire(dir.path(), "main", STALE)?;
            assert!(read_holder(dir.path())?.is_some());
        }
        assert!(read_holder(dir.path())?.is_none());
        let _again = RunLock::acquire(dir.path(), "main", STALE)?;
        Ok(())
    }

    #[test]
    fn test_dead_holder_is_broken() -> Result<()> {
        let dir = TempDir::new()?;
        let stale = LockEntry {
            owner: Uuid::new_v4(),
            hostname: local_hostname(),
            pid: i32::MAX as u32,
            acquired_at: Utc::now(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&stale)?)?;

        let lock = RunLock::acquire(dir.path(), "main", STALE)?;
        let holder = read_holder(dir.path())?.unwrap();
        assert_eq!(holder.owner, lock.owner());
        assert_eq!(holder.pid, std::process::id());
        Ok(())
    }

    #[test]
    fn test_expired_lock_is_broken() -> Result<()> {
        let dir = TempDir::new()?;
        let old = LockEntry {
            owner: Uuid::new_v4(),
            hostname: "some-other-host".to_string(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(7),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&old)?)?;

        let lock = RunLock::acquire(dir.path(), "main", Duration::from_secs(6 * 3600));
        assert!(lock.is_ok());
        Ok(())
    }

    #[test]
    fn test_remote_fresh_lock_is_respected() -> Result<()> {
        let dir = TempDir::new()?;
        let remote = LockEntry {
            owner: Uuid::new_v4(),
            hostname: "some-other-host".to_string(),
            pid: 1,
            acquired_at: Utc::now(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&remote)?)?;

        let err = RunLock::acquire(dir.path(), "main", STALE).unwrap_err();
        assert!(err.to_string().contains("some-other-host"));
        Ok(())
    }
}
