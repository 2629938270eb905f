//! Core types for MeshSync
//!
//! `MeshSpec`/`PeerSpec` describe the declared mesh as read from the config
//! file. `MeshStatus`/`PeerStatus` describe what has been observed on the
//! device.

use crate::key::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared peer
#[derive(Debug, Clone, Default, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Unique name within the mesh
    pub name: String,

    /// Informational address of the peer inside the mesh
    #[serde(rename = "ip", default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    /// Only meaningful for the local node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    pub public_key: String,

    #[serde(rename = "allowed_ips", default)]
    pub allowed_address_ranges: Vec<String>,

    /// `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Persistent keepalive in seconds, 0 = disabled
    #[serde(rename = "port", default, skip_serializing_if = "is_zero")]
    pub keepalive_seconds: u16,

    /// Forces a persistent keepalive
    #[serde(rename = "nat", default, skip_serializing_if = "is_false")]
    pub nat_assisted: bool,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

// Field-by-field so that a new field fails to compile here until it is
// added to the comparison.
impl PartialEq for PeerSpec {
    fn eq(&self, other: &Self) -> bool {
        let PeerSpec {
            name,
            address,
            private_key,
            public_key,
            allowed_address_ranges,
            endpoint,
            keepalive_seconds,
            nat_assisted,
        } = self;

        *name == other.name
            && *address == other.address
            && *private_key == other.private_key
            && *public_key == other.public_key
            && *allowed_address_ranges == other.allowed_address_ranges
            && *endpoint == other.endpoint
            && *keepalive_seconds == other.keepalive_seconds
            && *nat_assisted == other.nat_assisted
    }
}

impl PeerSpec {
    /// Human readable summary of what changed between `self` and `new`.
    /// Private keys are never included, only the fact that they changed.
    pub fn describe_changes(&self, new: &PeerSpec) -> String {
        let mut changes = Vec::new();

        if self.address != new.address {
            changes.push(format!("ip: {} -> {}", self.address, new.address));
        }
        if self.private_key != new.private_key {
            changes.push("private_key changed".to_string());
        }
        if self.public_key != new.public_key {
            changes.push(format!(
                "public_key: {} -> {}",
                self.public_key, new.public_key
            ));
        }
        if self.allowed_address_ranges != new.allowed_address_ranges {
            changes.push(format!(
                "allowed_ips: {} -> {}",
                self.allowed_address_ranges.join(","),
                new.allowed_address_ranges.join(",")
            ));
        }
        if self.endpoint != new.endpoint {
            changes.push(format!(
                "endpoint: {} -> {}",
                self.endpoint.as_deref().unwrap_or("-"),
                new.endpoint.as_deref().unwrap_or("-")
            ));
        }
        if self.keepalive_seconds != new.keepalive_seconds {
            changes.push(format!(
                "keepalive: {} -> {}",
                self.keepalive_seconds, new.keepalive_seconds
            ));
        }
        if self.nat_assisted != new.nat_assisted {
            changes.push(format!("nat: {} -> {}", self.nat_assisted, new.nat_assisted));
        }

        changes.join(", ")
    }
}

/// Declared mesh, one per local network device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSpec {
    pub network_name: String,
    pub listen_port: u16,
    #[serde(rename = "private_key")]
    pub local_private_key: String,
    #[serde(default)]
    pub peers: Vec<PeerSpec>,
}

impl MeshSpec {
    /// Find the declared peer owning a public key. Declared keys are
    /// compared parsed, so formatting differences do not matter.
    pub fn peer_by_public_key(&self, public_key: &Key) -> Option<&PeerSpec> {
        self.peers
            .iter()
            .find(|p| p.public_key.parse::<Key>().ok().as_ref() == Some(public_key))
    }

    /// Whether the device-level settings differ. The peer diff cannot
    /// express these, so a change requires a full reconciliation.
    pub fn interface_differs(&self, other: &MeshSpec) -> bool {
        self.network_name != other.network_name
            || self.listen_port != other.listen_port
            || self.local_private_key != other.local_private_key
    }
}

/// Observed peer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Configuring,
    Up,
    Down,
    Error,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Configuring => write!(f, "configuring"),
            PeerState::Up => write!(f, "up"),
            PeerState::Down => write!(f, "down"),
            PeerState::Error => write!(f, "error"),
        }
    }
}

/// Aggregate mesh state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshState {
    Up,
    Partial,
    Down,
}

impl Default for MeshState {
    fn default() -> Self {
        Self::Down
    }
}

impl MeshState {
    /// `Up` if every peer is up, `Down` if every peer is down or there are
    /// no peers, `Partial` otherwise.
    pub fn summarize<'a>(peers: impl IntoIterator<Item = &'a PeerStatus>) -> Self {
        let mut any = false;
        let mut all_up = true;
        let mut all_down = true;

        for peer in peers {
            any = true;
            if peer.state != PeerState::Up {
                all_up = false;
            }
            if peer.state != PeerState::Down {
                all_down = false;
            }
        }

        if !any || all_down {
            MeshState::Down
        } else if all_up {
            MeshState::Up
        } else {
            MeshState::Partial
        }
    }
}

impl std::fmt::Display for MeshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshState::Up => write!(f, "up"),
            MeshState::Partial => write!(f, "partial"),
            MeshState::Down => write!(f, "down"),
        }
    }
}

/// Observed peer status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub name: String,
    pub state: PeerState,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl PeerStatus {
    pub fn new(name: impl Into<String>, state: PeerState) -> Self {
        Self {
            name: name.into(),
            state,
            last_seen: None,
            last_error: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

/// Observed mesh status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStatus {
    pub network_name: String,
    pub state: MeshState,
    pub peers: BTreeMap<String, PeerStatus>,
    pub last_update: DateTime<Utc>,
}

impl MeshStatus {
    pub fn new(network_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            state: MeshState::Down,
            peers: BTreeMap::new(),
            last_update: Utc::now(),
        }
    }
}
