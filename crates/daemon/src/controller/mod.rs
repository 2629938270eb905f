//! Network controller interface
//!
//! The daemon never touches the kernel directly. Everything it needs from a
//! WireGuard device goes through [`NetworkController`]: read the live peer
//! table, or apply a configuration that either replaces every peer or
//! touches only the peers it lists.

mod wg;

pub use wg::{parse_dump, WgController};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use meshsync_common::{Key, Result};
use std::fmt::{self, Write as _};
use std::net::SocketAddr;
use std::time::Duration;

/// Device-level configuration for a single peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeerConfig {
    pub public_key: Key,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNetwork>,
    /// Replace the peer's allowed IPs rather than appending to them
    pub replace_allowed_ips: bool,
    pub persistent_keepalive: Option<Duration>,
    /// Delete the peer; every other field is ignored
    pub remove: bool,
}

impl DevicePeerConfig {
    /// Request deleting the peer with `public_key`
    pub fn removal(public_key: Key) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            replace_allowed_ips: false,
            persistent_keepalive: None,
            remove: true,
        }
    }
}

/// A configuration request for one device
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub peers: Vec<DevicePeerConfig>,
    /// Peers not listed are deleted
    pub replace_peers: bool,
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("private_key", &self.private_key.map(|_| "<redacted>"))
            .field("listen_port", &self.listen_port)
            .field("peers", &self.peers)
            .field("replace_peers", &self.replace_peers)
            .finish()
    }
}

/// Live state of one device peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
    pub public_key: Key,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNetwork>,
    /// `None` if no handshake ever completed
    pub last_handshake: Option<DateTime<Utc>>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Live state of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub name: String,
    pub public_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub peers: Vec<DevicePeer>,
}

/// Access to a WireGuard device
#[async_trait]
pub trait NetworkController: Send + Sync {
    /// Read the device and its peers
    async fn device(&self, name: &str) -> Result<DeviceSnapshot>;

    /// Apply `config` to the device in a single call
    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> Result<()>;
}

/// Render `config` in the wg(8) configuration file format. Removal requests
/// have no file representation and are skipped.
pub fn render_config(config: &DeviceConfig) -> String {
    let mut out = String::from("[Interface]\n");
    if let Some(key) = &config.private_key {
        let _ = writeln!(out, "PrivateKey = {}", key);
    }
    if let Some(port) = config.listen_port {
        let _ = writeln!(out, "ListenPort = {}", port);
    }

    for peer in config.peers.iter().filter(|p| !p.remove) {
        out.push_str("\n[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if !peer.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", join_networks(&peer.allowed_ips, ", "));
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive.as_secs());
        }
    }

    out
}

pub(crate) fn join_networks(networks: &[IpNetwork], sep: &str) -> String {
    networks
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}
