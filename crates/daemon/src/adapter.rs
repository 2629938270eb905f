//! Network controller adapter
//!
//! Validates declared peers and turns them into device requests. All calls
//! against the [`NetworkController`] made by the daemon go through here.

use crate::controller::{DeviceConfig, DevicePeerConfig, DeviceSnapshot, NetworkController};
use ipnetwork::IpNetwork;
use meshsync_common::{Error, Key, PeerSpec, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Adapter between declared peers and the device controller
#[derive(Clone)]
pub struct ControllerAdapter {
    controller: Arc<dyn NetworkController>,
    nat_keepalive: Duration,
}

impl ControllerAdapter {
    pub fn new(controller: Arc<dyn NetworkController>, nat_keepalive_secs: u16) -> Self {
        Self {
            controller,
            nat_keepalive: Duration::from_secs(u64::from(nat_keepalive_secs)),
        }
    }

    /// Validate `peer` and build its device configuration
    pub async fn build_peer_config(&self, peer: &PeerSpec) -> Result<DevicePeerConfig> {
        let public_key = parse_key(&peer.name, &peer.public_key)?;

        let mut allowed_ips = Vec::with_capacity(peer.allowed_address_ranges.len());
        for entry in &peer.allowed_address_ranges {
            allowed_ips.push(parse_cidr(&peer.name, entry)?);
        }

        let endpoint = match peer.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => {
                Some(resolve_endpoint(&peer.name, endpoint).await?)
            }
            _ => None,
        };

        let persistent_keepalive = if peer.keepalive_seconds > 0 {
            Some(Duration::from_secs(u64::from(peer.keepalive_seconds)))
        } else if peer.nat_assisted {
            Some(self.nat_keepalive)
        } else {
            None
        };

        Ok(DevicePeerConfig {
            public_key,
            endpoint,
            allowed_ips,
            replace_allowed_ips: true,
            persistent_keepalive,
            remove: false,
        })
    }

    /// Replace the device's entire configuration
    pub async fn apply_device(
        &self,
        network: &str,
        private_key: Key,
        listen_port: u16,
        peers: Vec<DevicePeerConfig>,
    ) -> Result<()> {
        debug!(network = %network, peers = peers.len(), "Applying full device config");
        let config = DeviceConfig {
            private_key: Some(private_key),
            listen_port: Some(listen_port),
            peers,
            replace_peers: true,
        };
        self.controller.configure_device(network, &config).await
    }

    /// Add or update one peer without disturbing the others
    pub async fn apply_single_peer(&self, network: &str, peer: DevicePeerConfig) -> Result<()> {
        debug!(network = %network, peer = %peer.public_key, "Applying peer config");
        let config = DeviceConfig {
            peers: vec![peer],
            ..Default::default()
        };
        self.controller.configure_device(network, &config).await
    }

    /// Delete one peer without disturbing the others
    pub async fn remove_peer(&self, network: &str, public_key: Key) -> Result<()> {
        debug!(network = %network, peer = %public_key, "Removing peer");
        let config = DeviceConfig {
            peers: vec![DevicePeerConfig::removal(public_key)],
            ..Default::default()
        };
        self.controller.configure_device(network, &config).await
    }

    /// Replace the peer set with an empty one
    pub async fn clear_all_peers(&self, network: &str) -> Result<()> {
        debug!(network = %network, "Clearing all peers");
        let config = DeviceConfig {
            replace_peers: true,
            ..Default::default()
        };
        self.controller.configure_device(network, &config).await
    }

    /// Live peers with counters and handshake times
    pub async fn query_device(&self, network: &str) -> Result<DeviceSnapshot> {
        self.controller.device(network).await
    }
}

/// Parse a base64 WireGuard key belonging to `peer`
pub fn parse_key(peer: &str, key: &str) -> Result<Key> {
    key.parse::<Key>().map_err(|e| Error::InvalidKey {
        peer: peer.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an allowed-IPs entry. A prefix length is required; host bits are
/// masked off.
pub fn parse_cidr(peer: &str, entry: &str) -> Result<IpNetwork> {
    let invalid = |reason: String| Error::InvalidCidr {
        peer: peer.to_string(),
        entry: entry.to_string(),
        reason,
    };

    let trimmed = entry.trim();
    if !trimmed.contains('/') {
        return Err(invalid("missing prefix length".to_string()));
    }
    let network: IpNetwork = trimmed.parse().map_err(|e| invalid(format!("{}", e)))?;
    IpNetwork::new(network.network(), network.prefix()).map_err(|e| invalid(format!("{}", e)))
}

/// Resolve a `host:port` endpoint, preferring IPv4 like the wg tooling
pub async fn resolve_endpoint(peer: &str, endpoint: &str) -> Result<SocketAddr> {
    let invalid = |reason: String| Error::InvalidEndpoint {
        peer: peer.to_string(),
        endpoint: endpoint.to_string(),
        reason,
    };

    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| invalid(e.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| invalid("no addresses found".to_string()))
}
