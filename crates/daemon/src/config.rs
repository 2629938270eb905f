//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between device polls
    pub health_interval_secs: u64,

    /// A handshake newer than this marks the peer up
    pub handshake_freshness_secs: u64,

    /// Keepalive applied to NAT-assisted peers without an explicit interval
    pub nat_keepalive_secs: u16,

    /// How long shutdown waits for background tasks
    pub shutdown_timeout_secs: u64,

    /// Quiet period after a file event before reloading
    pub reload_debounce_ms: u64,

    /// How a removed peer is taken off the device
    pub removal_mode: RemovalMode,

    /// Directory for config backups, defaults to the config file's directory
    pub backup_dir: Option<PathBuf>,

    /// JSON status dump refreshed on every health poll
    pub status_file: Option<PathBuf>,

    /// Path to the wg(8) binary
    pub wg_binary: String,

    /// Clear all peers from the device on shutdown
    pub teardown_on_shutdown: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 10,
            handshake_freshness_secs: 180,
            nat_keepalive_secs: 25,
            shutdown_timeout_secs: 5,
            reload_debounce_ms: 250,
            removal_mode: RemovalMode::default(),
            backup_dir: None,
            status_file: None,
            wg_binary: "wg".to_string(),
            teardown_on_shutdown: false,
        }
    }
}

/// Removal strategy for peers dropped from the config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMode {
    /// Delete only the removed peer's entry
    SinglePeer,
    /// Clear the whole device peer table; remaining peers come back on the
    /// next restart
    FullTeardown,
}

impl Default for RemovalMode {
    fn default() -> Self {
        Self::SinglePeer
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn handshake_freshness(&self) -> Duration {
        Duration::from_secs(self.handshake_freshness_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}
