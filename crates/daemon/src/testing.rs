//! Test doubles shared by the daemon's unit tests

use crate::controller::{DeviceConfig, DevicePeer, DeviceSnapshot, NetworkController};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshsync_common::{Error, Key, MeshSpec, PeerSpec, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

pub const LOCAL_KEY: &str = "ANVQk8Dtlqb9FwKITBjsNy7q4a1olz1kLQ8YeC/03U8=";
pub const KEY_A: &str = "a/iotNMJnrHngs6pBu/fFusGJW88oFYf3/U/hKCq3EA=";
pub const KEY_B: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
pub const KEY_C: &str = "kfNqMizGBFpBiax2IkoT5R2hd1zVCaC+n4i9eq9npX4=";
pub const KEY_D: &str = "RXMfaS9Kkt6ZG7YmaxAOb5jrOHFywUka0qcK6fDug/0=";

pub fn peer(name: &str, key: &str) -> PeerSpec {
    PeerSpec {
        name: name.to_string(),
        address: "10.0.0.1/24".to_string(),
        public_key: key.to_string(),
        allowed_address_ranges: vec!["10.0.0.0/24".to_string()],
        ..Default::default()
    }
}

pub fn mesh(peers: Vec<PeerSpec>) -> MeshSpec {
    MeshSpec {
        network_name: "wg0".to_string(),
        listen_port: 51820,
        local_private_key: LOCAL_KEY.to_string(),
        peers,
    }
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Vec<DevicePeer>>,
    calls: Vec<(String, DeviceConfig)>,
    fail_configure: Option<String>,
    fail_device: Option<String>,
}

/// In-memory device table recording every configure call
#[derive(Default)]
pub struct MemoryController {
    inner: Mutex<Inner>,
}

impl MemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every configure call fail with `message` (`None` to recover)
    pub fn fail_configure(&self, message: Option<&str>) {
        self.inner.lock().fail_configure = message.map(str::to_string);
    }

    pub fn fail_device(&self, message: Option<&str>) {
        self.inner.lock().fail_device = message.map(str::to_string);
    }

    pub fn configure_calls(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn calls(&self) -> Vec<(String, DeviceConfig)> {
        self.inner.lock().calls.clone()
    }

    /// Public keys on `network`, sorted
    pub fn peer_keys(&self, network: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .devices
            .get(network)
            .map(|peers| peers.iter().map(|p| p.public_key.to_string()).collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn device_peer(&self, network: &str, key: &str) -> Option<DevicePeer> {
        let key: Key = key.parse().ok()?;
        self.inner
            .lock()
            .devices
            .get(network)?
            .iter()
            .find(|p| p.public_key == key)
            .cloned()
    }

    /// Set live counters for a device peer, inserting it if needed
    pub fn set_stats(
        &self,
        network: &str,
        key: &str,
        last_handshake: Option<DateTime<Utc>>,
        bytes_sent: u64,
        bytes_received: u64,
    ) {
        let key: Key = key.parse().expect("test key");
        let mut inner = self.inner.lock();
        let peers = inner.devices.entry(network.to_string()).or_default();
        match peers.iter_mut().find(|p| p.public_key == key) {
            Some(p) => {
                p.last_handshake = last_handshake;
                p.bytes_sent = bytes_sent;
                p.bytes_received = bytes_received;
            }
            None => peers.push(DevicePeer {
                public_key: key,
                endpoint: None,
                allowed_ips: Vec::new(),
                last_handshake,
                bytes_sent,
                bytes_received,
            }),
        }
    }
}

#[async_trait]
impl NetworkController for MemoryController {
    async fn device(&self, name: &str) -> Result<DeviceSnapshot> {
        let inner = self.inner.lock();
        if let Some(message) = &inner.fail_device {
            return Err(Error::ControllerApply(message.clone()));
        }
        Ok(DeviceSnapshot {
            name: name.to_string(),
            public_key: None,
            listen_port: None,
            peers: inner.devices.get(name).cloned().unwrap_or_default(),
        })
    }

    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push((name.to_string(), config.clone()));
        if let Some(message) = &inner.fail_configure {
            return Err(Error::ControllerApply(message.clone()));
        }

        let peers = inner.devices.entry(name.to_string()).or_default();
        if config.replace_peers {
            peers.clear();
        }
        for requested in &config.peers {
            peers.retain(|p| p.public_key != requested.public_key);
            if !requested.remove {
                peers.push(DevicePeer {
                    public_key: requested.public_key,
                    endpoint: requested.endpoint,
                    allowed_ips: requested.allowed_ips.clone(),
                    last_handshake: None,
                    bytes_sent: 0,
                    bytes_received: 0,
                });
            }
        }
        Ok(())
    }
}
