//! Shared daemon state
//!
//! [`StatusTracker`] owns the observed mesh status and [`SpecHandle`] the
//! active declared mesh. Both are cheap to clone and are the only way other
//! components reach that state.

use chrono::{DateTime, Utc};
use meshsync_common::{MeshSpec, MeshState, MeshStatus, PeerState, PeerStatus};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default window in which a handshake counts as liveness
pub const HANDSHAKE_FRESHNESS: Duration = Duration::from_secs(180);

/// Observed per-peer and aggregate mesh health.
///
/// Every update recomputes the aggregate state under the same write lock,
/// so a snapshot never pairs a peer map with a stale aggregate.
#[derive(Clone)]
pub struct StatusTracker {
    status: Arc<RwLock<MeshStatus>>,
    freshness: Duration,
}

impl StatusTracker {
    pub fn new(network_name: impl Into<String>) -> Self {
        Self::with_freshness(network_name, HANDSHAKE_FRESHNESS)
    }

    pub fn with_freshness(network_name: impl Into<String>, freshness: Duration) -> Self {
        Self {
            status: Arc::new(RwLock::new(MeshStatus::new(network_name))),
            freshness,
        }
    }

    /// Upsert a peer's state and error
    pub fn set_peer_state(&self, name: &str, state: PeerState, error: Option<String>) {
        let now = Utc::now();
        let mut status = self.status.write();

        let peer = status
            .peers
            .entry(name.to_string())
            .or_insert_with(|| PeerStatus::new(name, state));
        peer.state = state;
        peer.last_error = error;
        peer.last_seen = Some(now);

        recompute(&mut status, now);
    }

    /// Record device counters for a tracked peer; the peer is up when its
    /// last handshake falls within the freshness window. Returns `None` for
    /// peers the reconciler has not attempted or has already removed.
    pub fn record_traffic(
        &self,
        name: &str,
        bytes_sent: u64,
        bytes_received: u64,
        last_handshake: Option<DateTime<Utc>>,
    ) -> Option<PeerState> {
        self.record_traffic_at(name, bytes_sent, bytes_received, last_handshake, Utc::now())
    }

    pub fn record_traffic_at(
        &self,
        name: &str,
        bytes_sent: u64,
        bytes_received: u64,
        last_handshake: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<PeerState> {
        let state = liveness(last_handshake, now, self.freshness);
        let mut status = self.status.write();

        let peer = status.peers.get_mut(name)?;
        peer.state = state;
        peer.bytes_sent = bytes_sent;
        peer.bytes_received = bytes_received;
        if state == PeerState::Up {
            peer.last_seen = last_handshake;
            peer.last_error = None;
        }

        recompute(&mut status, now);
        Some(state)
    }

    /// Drop a peer. Returns whether it was tracked.
    pub fn remove_peer(&self, name: &str) -> bool {
        let mut status = self.status.write();
        let removed = status.peers.remove(name).is_some();
        if removed {
            debug!(peer = %name, "Dropped peer status");
        }
        recompute(&mut status, Utc::now());
        removed
    }

    /// Drop every peer not in `names`
    pub fn retain_peers(&self, names: &HashSet<&str>) {
        let mut status = self.status.write();
        status.peers.retain(|name, _| names.contains(name.as_str()));
        recompute(&mut status, Utc::now());
    }

    pub fn set_network_name(&self, network_name: &str) {
        self.status.write().network_name = network_name.to_string();
    }

    /// Consistent point-in-time copy
    pub fn snapshot(&self) -> MeshStatus {
        self.status.read().clone()
    }

    pub fn peer(&self, name: &str) -> Option<PeerStatus> {
        self.status.read().peers.get(name).cloned()
    }
}

fn recompute(status: &mut MeshStatus, now: DateTime<Utc>) {
    status.state = MeshState::summarize(status.peers.values());
    status.last_update = now;
}

/// `Up` if the handshake is younger than `window`, `Down` otherwise
pub fn liveness(
    last_handshake: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> PeerState {
    let Some(at) = last_handshake else {
        return PeerState::Down;
    };
    // A handshake stamped in the future (clock skew) has age zero
    let age = now.signed_duration_since(at).to_std().unwrap_or_default();
    if age < window {
        PeerState::Up
    } else {
        PeerState::Down
    }
}

/// The active mesh spec. Replaced wholesale, never mutated in place;
/// readers hold on to the `Arc` they got for the whole operation.
#[derive(Clone)]
pub struct SpecHandle {
    current: Arc<RwLock<Arc<MeshSpec>>>,
}

impl SpecHandle {
    pub fn new(spec: MeshSpec) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(spec))),
        }
    }

    pub fn current(&self) -> Arc<MeshSpec> {
        self.current.read().clone()
    }

    /// Swap in a new spec, returning the previous one
    pub fn replace(&self, spec: MeshSpec) -> Arc<MeshSpec> {
        std::mem::replace(&mut *self.current.write(), Arc::new(spec))
    }
}
