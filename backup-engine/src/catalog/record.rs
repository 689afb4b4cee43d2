//! Backup record types persisted as `backup.json` in each backup directory.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::config::Compression;

/// Time-derived backup identifier.
///
/// Internally the unix timestamp (seconds) of the backup start; rendered as
/// upper-case base36, which keeps identifiers short and sortable by length
/// then lexically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupId(i64);

impl BackupId {
    pub fn from_time(time: DateTime<Utc>) -> Self {
        Self(time.timestamp())
    }

    pub fn from_timestamp(secs: i64) -> Self {
        Self(secs)
    }

    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// The start time encoded in the identifier.
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// The next identifier, used when two backups start within the same second.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

        if self.0 <= 0 {
            return write!(f, "0");
        }
        let mut value = self.0 as u64;
        let mut buf = Vec::with_capacity(13);
        while value > 0 {
            buf.push(DIGITS[(value % 36) as usize]);
            value /= 36;
        }
        buf.reverse();
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

impl FromStr for BackupId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        i64::from_str_radix(s, 36)
            .map(Self)
            .map_err(|_| format!("invalid backup id: {}", s))
    }
}

impl Serialize for BackupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BackupId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Log sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

/// WAL timeline identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimelineId(pub u32);

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupMode {
    Full,
    Page,
    Delta,
    Ptrack,
}

impl BackupMode {
    pub fn is_incremental(&self) -> bool {
        !matches!(self, BackupMode::Full)
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupMode::Full => "FULL",
            BackupMode::Page => "PAGE",
            BackupMode::Delta => "DELTA",
            BackupMode::Ptrack => "PTRACK",
        };
        f.write_str(name)
    }
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupMode::Full),
            "PAGE" => Ok(BackupMode::Page),
            "DELTA" => Ok(BackupMode::Delta),
            "PTRACK" => Ok(BackupMode::Ptrack),
            other => Err(format!("invalid backup mode: {}", other)),
        }
    }
}

/// Lifecycle status of a backup.
///
/// `RUNNING -> {OK, ERROR}`, `OK -> CORRUPT`. `ERROR` and `CORRUPT` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Running,
    Ok,
    Error,
    Corrupt,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Error | BackupStatus::Corrupt)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupStatus::Running => "RUNNING",
            BackupStatus::Ok => "OK",
            BackupStatus::Error => "ERROR",
            BackupStatus::Corrupt => "CORRUPT",
        };
        f.write_str(name)
    }
}

/// Metadata of one taken backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub instance: String,
    pub mode: BackupMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<BackupId>,
    pub timeline_id: TimelineId,
    pub status: BackupStatus,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Bytes stored in this backup's own directory.
    #[serde(default)]
    pub data_bytes: u64,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub checksums_enabled: bool,
    pub program_version: String,
}

impl BackupRecord {
    pub fn new(id: BackupId, instance: &str, mode: BackupMode, timeline_id: TimelineId) -> Self {
        Self {
            id,
            instance: instance.to_string(),
            mode,
            parent_id: None,
            timeline_id,
            status: BackupStatus::Running,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time: id.time(),
            end_time: None,
            data_bytes: 0,
            compression: Compression::None,
            checksums_enabled: false,
            program_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
