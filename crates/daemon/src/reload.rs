//! Hot reload
//!
//! On every config change: back up the active spec, load the new file, diff,
//! reconcile, then make the new spec active. A failed backup or an
//! unreadable file aborts the cycle and leaves the running mesh alone.

use crate::adapter::parse_key;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::state::SpecHandle;
use crate::watcher::ChangeEvent;
use chrono::Utc;
use meshsync_common::{diff_peers, load_mesh_spec, write_backup, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a reload was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    /// The new file declares the same mesh
    Unchanged,
    /// Peer changes applied one by one
    Incremental,
    /// Interface settings changed, device rebuilt from scratch
    Restart,
}

/// Result of one reload cycle
#[derive(Debug)]
pub struct ReloadReport {
    pub backup: PathBuf,
    pub kind: ReloadKind,
    pub outcome: ReconcileOutcome,
}

pub struct HotReloadDriver {
    config_path: PathBuf,
    backup_dir: Option<PathBuf>,
    spec: SpecHandle,
    reconciler: Arc<Reconciler>,
    debounce: Duration,
}

impl HotReloadDriver {
    pub fn new(config_path: PathBuf, spec: SpecHandle, reconciler: Arc<Reconciler>) -> Self {
        Self {
            config_path,
            backup_dir: None,
            spec,
            reconciler,
            debounce: Duration::from_millis(250),
        }
    }

    pub fn with_backup_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.backup_dir = dir;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Process change events until cancelled or the notifier goes away.
    /// Bursts of events collapse into a single reload, and reloads run one
    /// at a time.
    pub async fn run(self, mut events: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) {
        info!(path = %self.config_path.display(), "Hot reload started");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        warn!("Change notifier closed");
                        break;
                    }
                },
            };

            if let ChangeEvent::Error(message) = event {
                error!(error = %message, "Error watching file");
                continue;
            }

            info!("Detected config file change");
            if !self.settle(&mut events, &cancel).await {
                break;
            }

            match self.reload().await {
                Ok(report) => info!(
                    kind = ?report.kind,
                    applied = report.outcome.applied.len(),
                    removed = report.outcome.removed.len(),
                    failed = report.outcome.failed.len(),
                    "Config reloaded"
                ),
                Err(e) => error!(error = %e, "Config reload aborted"),
            }
        }

        info!("Hot reload stopped");
    }

    /// Wait until no event arrived for the debounce period. Returns false if
    /// cancelled meanwhile.
    async fn settle(
        &self,
        events: &mut mpsc::Receiver<ChangeEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                event = events.recv() => match event {
                    Some(ChangeEvent::Modified) => continue,
                    Some(ChangeEvent::Error(message)) => {
                        error!(error = %message, "Error watching file");
                    }
                    None => return true,
                },
                _ = tokio::time::sleep(self.debounce) => return true,
            }
        }
    }

    /// Run one reload cycle against the current file contents
    pub async fn reload(&self) -> Result<ReloadReport> {
        let current = self.spec.current();

        let backup = write_backup(
            &current,
            &self.config_path,
            self.backup_dir.as_deref(),
            Utc::now(),
        )?;

        let next = load_mesh_spec(&self.config_path)?;

        if next == *current {
            info!("Config unchanged");
            self.spec.replace(next);
            return Ok(ReloadReport {
                backup,
                kind: ReloadKind::Unchanged,
                outcome: ReconcileOutcome::default(),
            });
        }

        if current.interface_differs(&next) {
            // A bad local key is rejected like a parse error
            parse_key(&next.network_name, &next.local_private_key)?;

            info!(
                from = %current.network_name,
                to = %next.network_name,
                "Interface settings changed, restarting mesh"
            );
            let result = self.reconciler.restart(&current.network_name, &next).await;
            self.spec.replace(next);
            return result.map(|outcome| ReloadReport {
                backup,
                kind: ReloadKind::Restart,
                outcome,
            });
        }

        let diff = diff_peers(&current.peers, &next.peers);
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            updated = diff.updated.len(),
            "Applying peer changes"
        );
        let outcome = self.reconciler.incremental(&next, &diff).await;

        // Declared intent wins even when some peers failed
        self.spec.replace(next);

        Ok(ReloadReport {
            backup,
            kind: ReloadKind::Incremental,
            outcome,
        })
    }
}
