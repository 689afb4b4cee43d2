//! Progress tracking for copy operations.
//!
//! Workers bump shared counters; a reporter task logs files and bytes done
//! with the current throughput at a fixed interval.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared counters of a copy run
#[derive(Debug)]
pub struct CopyProgress {
    pub total_files: usize,
    pub total_bytes: u64,
    files_done: AtomicUsize,
    bytes_read: AtomicU64,
}

/// Point-in-time view of [`CopyProgress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub files_done: usize,
    pub total_files: usize,
    pub bytes_read: u64,
    pub total_bytes: u64,
}

impl ProgressSnapshot {
    pub fn percent_complete(&self) -> f64 {
        if self.total_bytes > 0 {
            ((self.bytes_read as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else if self.total_files == 0 {
            100.0
        } else {
            0.0
        }
    }
}

impl CopyProgress {
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        Self {
            total_files,
            total_bytes,
            files_done: AtomicUsize::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn file_done(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_done: self.files_done.load(Ordering::Relaxed),
            total_files: self.total_files,
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            total_bytes: self.total_bytes,
        }
    }
}

/// Spawn the reporter. It exits when `stop` is cancelled.
pub fn spawn_reporter(
    progress: Arc<CopyProgress>,
    every: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick completes immediately.
        interval.tick().await;
        let mut last_bytes = 0u64;
        let mut last_time = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.cancelled() => { break; }
            }

            let snap = progress.snapshot();
            let now = Instant::now();
            let window = now.duration_since(last_time).as_secs_f64();
            let speed = if window > 0.0 {
                (snap.bytes_read.saturating_sub(last_bytes) as f64 / window) as u64
            } else {
                0
            };
            last_bytes = snap.bytes_read;
            last_time = now;

            info!(
                "Progress: {}/{} files, {} of {} ({:.1}%), {}",
                snap.files_done,
                snap.total_files,
                format_bytes(snap.bytes_read),
                format_bytes(snap.total_bytes),
                snap.percent_complete(),
                format_speed(speed)
            );
        }
    })
}

/// Binary units, two decimals (`1536` -> `1.50 KB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Coarse elapsed time for log lines.
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
