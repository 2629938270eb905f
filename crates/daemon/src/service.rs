//! Mesh service
//!
//! Owns one mesh instance: the initial reconciliation, the health monitor,
//! the config watcher and the hot reload driver, all tied to a single
//! cancellation token.

use crate::adapter::{parse_key, ControllerAdapter};
use crate::config::DaemonConfig;
use crate::controller::NetworkController;
use crate::monitor::HealthMonitor;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::reload::HotReloadDriver;
use crate::state::{SpecHandle, StatusTracker};
use crate::watcher::FileWatcher;
use meshsync_common::{load_mesh_spec, Error, MeshSpec, MeshStatus, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct MeshService {
    config_path: PathBuf,
    config: DaemonConfig,
    adapter: ControllerAdapter,
    tracker: StatusTracker,
    spec: SpecHandle,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
    watcher: Option<FileWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshService {
    /// Load the mesh config at `config_path`. Nothing touches the device
    /// until [`start`](Self::start).
    pub fn new(
        config_path: impl Into<PathBuf>,
        config: DaemonConfig,
        controller: Arc<dyn NetworkController>,
    ) -> Result<Self> {
        let config_path = config_path.into();
        let spec = load_mesh_spec(&config_path)?;

        let tracker =
            StatusTracker::with_freshness(spec.network_name.as_str(), config.handshake_freshness());
        let adapter = ControllerAdapter::new(controller, config.nat_keepalive_secs);
        let reconciler = Arc::new(Reconciler::new(
            adapter.clone(),
            tracker.clone(),
            config.removal_mode,
        ));

        Ok(Self {
            config_path,
            config,
            adapter,
            tracker,
            spec: SpecHandle::new(spec),
            reconciler,
            cancel: CancellationToken::new(),
            watcher: None,
            tasks: Vec::new(),
        })
    }

    /// Configure the device and start the background units.
    ///
    /// The returned outcome lists peers that failed validation; the mesh
    /// runs degraded without them. An `Err` from the device apply is
    /// returned too, but the units are still started so a later config
    /// change can bring the mesh up.
    pub async fn start(&mut self) -> Result<ReconcileOutcome> {
        if !self.tasks.is_empty() {
            return Err(Error::Internal("mesh service already started".to_string()));
        }

        // Watch before applying so edits made during the apply are not lost
        let (watcher, events) = FileWatcher::watch(&self.config_path)?;
        self.watcher = Some(watcher);

        let spec = self.spec.current();
        match parse_key(&spec.network_name, &spec.local_private_key) {
            Ok(key) => info!(
                network = %spec.network_name,
                public_key = %key.public_key(),
                listen_port = spec.listen_port,
                "Starting mesh"
            ),
            Err(e) => error!(network = %spec.network_name, error = %e, "Invalid local private key"),
        }

        let result = self.reconciler.full(&spec).await;

        let monitor =
            HealthMonitor::new(self.adapter.clone(), self.tracker.clone(), self.spec.clone())
                .with_interval(self.config.health_interval())
                .with_status_file(self.config.status_file.clone());
        self.tasks.push(tokio::spawn(monitor.run(self.cancel.clone())));

        let driver = HotReloadDriver::new(
            self.config_path.clone(),
            self.spec.clone(),
            self.reconciler.clone(),
        )
        .with_backup_dir(self.config.backup_dir.clone())
        .with_debounce(self.config.reload_debounce());
        self.tasks.push(tokio::spawn(driver.run(events, self.cancel.clone())));

        match &result {
            Ok(outcome) => {
                if let Some(e) = outcome.first_error() {
                    warn!(error = %e, "Mesh started with invalid peers");
                } else {
                    info!(peers = outcome.applied.len(), "Mesh started");
                }
            }
            Err(e) => error!(
                error = %e,
                "Initial configuration failed, waiting for config changes"
            ),
        }

        result
    }

    /// Clear the device and reapply the active spec
    pub async fn restart(&self) -> Result<ReconcileOutcome> {
        let spec = self.spec.current();
        self.reconciler.restart(&spec.network_name, &spec).await
    }

    /// Point-in-time mesh status
    pub fn status(&self) -> MeshStatus {
        self.tracker.snapshot()
    }

    /// The active mesh spec
    pub fn spec(&self) -> Arc<MeshSpec> {
        self.spec.current()
    }

    /// Whether the monitor and the reload driver are running
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Stop all units and wait for them, bounded by the shutdown timeout.
    /// Units that do not stop in time are aborted.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Stopping mesh service");
        self.cancel.cancel();
        self.watcher = None;

        let deadline = Instant::now() + self.config.shutdown_timeout();
        for mut task in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task failed"),
                Err(_) => {
                    warn!("Background task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        if self.config.teardown_on_shutdown {
            let spec = self.spec.current();
            self.reconciler.teardown(&spec.network_name).await?;
        }

        info!("Mesh service stopped");
        Ok(())
    }
}
