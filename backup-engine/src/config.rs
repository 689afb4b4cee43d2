//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`PGBACKUP_<SECTION>__<KEY>`, e.g. `PGBACKUP_BACKUP__JOBS=4`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "PGBACKUP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Root directory of the backup catalog
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,

    /// Instance name; each instance has its own lineage and run lock
    #[serde(default = "default_instance_name")]
    pub instance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Data directory of the database cluster
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Page compression for stored data files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

/// What DELTA does with files whose pages carry no trustworthy LSN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeltaFallback {
    /// Copy the whole file.
    FullCopy,
    /// Skip the file when its mtime predates the parent backup and its
    /// content is unchanged; copy it otherwise.
    #[default]
    ModificationTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaOptions {
    /// Select data file pages by their header LSN
    #[serde(default = "default_true")]
    pub trust_page_lsn: bool,

    /// Change detection for files without page LSNs
    #[serde(default)]
    pub fallback: DeltaFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Parallel file copy jobs
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Page compression (none, zstd)
    #[serde(default)]
    pub compression: Compression,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Validate the backup right after it completes
    #[serde(default = "default_true")]
    pub validate_after_backup: bool,

    /// Extra file or directory names to exclude
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub delta: DeltaOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Local re-reads of a page that failed validation
    #[serde(default = "default_local_retries")]
    pub local_retries: u32,

    /// Delay between local re-reads in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Timeout of the out-of-band block fetch query in seconds
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Age after which a run lock is considered abandoned
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Seconds between progress log lines
    #[serde(default = "default_progress_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_catalog_path() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine")
}

fn default_instance_name() -> String {
    "main".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/postgresql/data")
}

fn default_true() -> bool {
    true
}

fn default_jobs() -> usize {
    1
}

fn default_compression_level() -> i32 {
    3
}

fn default_local_retries() -> u32 {
    100
}

fn default_retry_delay_ms() -> u64 {
    1
}

fn default_query_timeout_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    6 * 60 * 60
}

fn default_progress_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            instance: default_instance_name(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            trust_page_lsn: true,
            fallback: DeltaFallback::default(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            compression: Compression::default(),
            compression_level: default_compression_level(),
            validate_after_backup: true,
            exclude: Vec::new(),
            delta: DeltaOptions::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            local_retries: default_local_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_progress_interval_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FetchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Toml,
            ))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.backup.jobs == 0 {
            anyhow::bail!("backup.jobs must be at least 1");
        }
        if self.catalog.instance.is_empty() || self.catalog.instance.contains('/') {
            anyhow::bail!("catalog.instance must be a plain directory name");
        }
        if self.backup.compression == Compression::Zstd
            && !(1..=22).contains(&self.backup.compression_level)
        {
            anyhow::bail!("backup.compression_level must be between 1 and 22 for zstd");
        }
        Ok(())
    }
}
