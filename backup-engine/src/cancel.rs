//! Cancellation of a running backup on SIGINT/SIGTERM.
//!
//! The controller owns the run's cancellation token and the final catalog
//! write, so a cancelled or failed run always ends as `ERROR` with its run
//! lock released.

use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{BackupRecord, BackupStatus, Catalog, Manifest, RunningBackup};
use crate::utils::errors::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    CancelRequested,
    Error,
    Done,
}

#[derive(Debug, Clone)]
pub struct CancellationController {
    token: CancellationToken,
    state: Arc<Mutex<RunState>>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(RunState::Running)),
        }
    }

    /// Token checked by copy tasks between files and between blocks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn request_cancel(&self) {
        self.transition(RunState::Running, RunState::CancelRequested);
        self.token.cancel();
    }

    /// Spawn a task that requests cancellation on SIGINT or SIGTERM.
    ///
    /// The task ends on its own once the token is cancelled.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sig) => {
                        sig.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {
                    warn!("Received SIGINT, cancelling backup");
                    controller.request_cancel();
                }
                _ = terminate => {
                    warn!("Received SIGTERM, cancelling backup");
                    controller.request_cancel();
                }
                _ = controller.token.cancelled() => {}
            }
        })
    }

    /// Finalize a run whose copy completed. A cancel that arrived meanwhile
    /// still wins: the record becomes `ERROR` and `Cancelled` is returned.
    pub async fn finish(
        &self,
        catalog: &Catalog,
        running: RunningBackup,
        manifest: &Manifest,
    ) -> Result<BackupRecord> {
        if self.is_cancelled() {
            return Err(self.fail(catalog, running, BackupError::Cancelled, manifest).await);
        }
        let record = catalog.finalize(running, BackupStatus::Ok, manifest).await?;
        self.set(RunState::Done);
        Ok(record)
    }

    /// Finalize a failed run as `ERROR` keeping `partial` for inspection.
    /// Returns the error to report.
    pub async fn fail(
        &self,
        catalog: &Catalog,
        running: RunningBackup,
        err: BackupError,
        partial: &Manifest,
    ) -> BackupError {
        let id = running.id();
        let err = if self.is_cancelled() && !matches!(err, BackupError::Cancelled) {
            warn!(backup_id = %id, "Run failed after cancellation: {}", err);
            BackupError::Cancelled
        } else {
            err
        };
        error!(backup_id = %id, "Backup failed: {}", err);

        if let Err(e) = catalog.finalize(running, BackupStatus::Error, partial).await {
            error!(backup_id = %id, "Cannot record ERROR status: {}", e);
        } else {
            info!(
                backup_id = %id,
                "Partial manifest with {} entries kept",
                partial.files.len()
            );
        }
        self.set(RunState::Error);
        err
    }

    fn transition(&self, from: RunState, to: RunState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
        }
    }

    fn set(&self, to: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}
