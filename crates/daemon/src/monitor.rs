//! Peer health monitoring
//!
//! Polls the device on a fixed interval and feeds handshake times and
//! transfer counters into the status tracker.

use crate::adapter::ControllerAdapter;
use crate::state::{SpecHandle, StatusTracker};
use meshsync_common::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default poll interval
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);

pub struct HealthMonitor {
    adapter: ControllerAdapter,
    tracker: StatusTracker,
    spec: SpecHandle,
    interval: Duration,
    status_file: Option<PathBuf>,
}

impl HealthMonitor {
    pub fn new(adapter: ControllerAdapter, tracker: StatusTracker, spec: SpecHandle) -> Self {
        Self {
            adapter,
            tracker,
            spec,
            interval: HEALTH_INTERVAL,
            status_file: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Write the mesh status as JSON to `path` after every poll
    pub fn with_status_file(mut self, path: Option<PathBuf>) -> Self {
        self.status_file = path;
        self
    }

    /// Poll until cancelled. A failed poll is logged and the loop keeps going.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs_f64(), "Health monitor started");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Failed to get device status");
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }

    /// Query the device once and record every declared peer it reports.
    /// Returns the number of peers updated.
    pub async fn poll_once(&self) -> Result<usize> {
        let spec = self.spec.current();
        let device = self.adapter.query_device(&spec.network_name).await?;

        let mut updated = 0;
        for device_peer in &device.peers {
            let Some(peer) = spec.peer_by_public_key(&device_peer.public_key) else {
                debug!(peer = %device_peer.public_key, "Ignoring undeclared device peer");
                continue;
            };

            // Peers removed while this poll was in flight stay removed
            let Some(state) = self.tracker.record_traffic(
                &peer.name,
                device_peer.bytes_sent,
                device_peer.bytes_received,
                device_peer.last_handshake,
            ) else {
                continue;
            };
            debug!(peer = %peer.name, state = %state, "Peer polled");
            updated += 1;
        }

        if let Some(path) = &self.status_file {
            if let Err(e) = self.write_status(path).await {
                warn!(path = %path.display(), error = %e, "Failed to write status file");
            }
        }

        Ok(updated)
    }

    async fn write_status(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.tracker.snapshot())?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}
