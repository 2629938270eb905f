//! Reconciliation
//!
//! Makes the device's peer table match a declared [`MeshSpec`]. A peer that
//! fails validation or cannot be applied is marked `Error` and skipped; it
//! never blocks the rest of the mesh.

use crate::adapter::{parse_key, ControllerAdapter};
use crate::config::RemovalMode;
use crate::state::StatusTracker;
use meshsync_common::{Error, Key, MeshSpec, PeerDiff, PeerSpec, PeerState, PeerUpdate, Result};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What a reconciliation pass did
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Peers handed to the device
    pub applied: Vec<String>,
    /// Peers taken off the device
    pub removed: Vec<String>,
    /// Peers that failed, in processing order
    pub failed: Vec<(String, Error)>,
}

impl ReconcileOutcome {
    /// The first per-peer failure. Set alongside a successful device apply
    /// when the mesh runs degraded.
    pub fn first_error(&self) -> Option<&Error> {
        self.failed.first().map(|(_, e)| e)
    }

    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Reconciler that drives the device towards the declared mesh
pub struct Reconciler {
    adapter: ControllerAdapter,
    tracker: StatusTracker,
    removal_mode: RemovalMode,
    /// Serialises passes so device changes never interleave
    apply_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        adapter: ControllerAdapter,
        tracker: StatusTracker,
        removal_mode: RemovalMode,
    ) -> Self {
        Self {
            adapter,
            tracker,
            removal_mode,
            apply_lock: Mutex::new(()),
        }
    }

    /// Replace the device configuration with `spec` in a single apply.
    ///
    /// Invalid peers are marked `Error` and left out. Returns `Err` only if
    /// the local key is invalid or the device apply itself fails; in the
    /// latter case every attempted peer is marked `Error`. Applied peers stay
    /// `Configuring` until the health monitor observes them.
    pub async fn full(&self, spec: &MeshSpec) -> Result<ReconcileOutcome> {
        let _guard = self.apply_lock.lock().await;
        self.full_locked(spec).await
    }

    /// Rebuild the device from `spec`. When the device name changed, the
    /// peers on `previous_network` are cleared first. An invalid local key
    /// fails before anything on either device is touched.
    pub async fn restart(
        &self,
        previous_network: &str,
        spec: &MeshSpec,
    ) -> Result<ReconcileOutcome> {
        let _guard = self.apply_lock.lock().await;

        parse_key(&spec.network_name, &spec.local_private_key)?;

        info!(network = %previous_network, "Restarting mesh");
        // The full apply replaces every peer on the same device anyway
        if previous_network != spec.network_name {
            if let Err(e) = self.adapter.clear_all_peers(previous_network).await {
                warn!(network = %previous_network, error = %e, "Failed to clear previous device");
            }
        }

        self.full_locked(spec).await
    }

    /// Remove every peer from the device and forget their status
    pub async fn teardown(&self, network: &str) -> Result<()> {
        let _guard = self.apply_lock.lock().await;

        self.adapter.clear_all_peers(network).await?;
        self.tracker.retain_peers(&HashSet::new());
        info!(network = %network, "Mesh stopped");
        Ok(())
    }

    async fn full_locked(&self, spec: &MeshSpec) -> Result<ReconcileOutcome> {
        let private_key = parse_key(&spec.network_name, &spec.local_private_key)?;

        self.tracker.set_network_name(&spec.network_name);
        self.tracker
            .retain_peers(&spec.peers.iter().map(|p| p.name.as_str()).collect());

        let mut outcome = ReconcileOutcome::default();
        let mut configs = Vec::with_capacity(spec.peers.len());

        for peer in &spec.peers {
            match self.adapter.build_peer_config(peer).await {
                Ok(config) => {
                    configs.push(config);
                    self.tracker.set_peer_state(&peer.name, PeerState::Configuring, None);
                    outcome.applied.push(peer.name.clone());
                }
                Err(e) => {
                    self.peer_failed(&peer.name, &e);
                    outcome.failed.push((peer.name.clone(), e));
                }
            }
        }

        if let Err(e) = self
            .adapter
            .apply_device(&spec.network_name, private_key, spec.listen_port, configs)
            .await
        {
            error!(network = %spec.network_name, error = %e, "Failed to configure device");
            for name in &outcome.applied {
                self.tracker
                    .set_peer_state(name, PeerState::Error, Some(e.to_string()));
            }
            return Err(e);
        }

        if outcome.is_degraded() {
            warn!(
                network = %spec.network_name,
                applied = outcome.applied.len(),
                failed = outcome.failed.len(),
                "Mesh running degraded"
            );
        } else {
            info!(
                network = %spec.network_name,
                peers = outcome.applied.len(),
                "Device configured"
            );
        }

        Ok(outcome)
    }

    /// Apply a peer diff against the device: additions, then removals, then
    /// updates. Each peer is handled on its own; failures are recorded and
    /// processing continues.
    pub async fn incremental(&self, spec: &MeshSpec, diff: &PeerDiff) -> ReconcileOutcome {
        let _guard = self.apply_lock.lock().await;
        let network = spec.network_name.as_str();
        let mut outcome = ReconcileOutcome::default();

        // Keys the new spec still uses must survive removals and updates,
        // whichever peer declared them before
        let declared: HashSet<Key> = spec
            .peers
            .iter()
            .filter_map(|p| p.public_key.parse().ok())
            .collect();

        for peer in &diff.added {
            info!(peer = %peer.name, "Adding peer");
            match self.add_peer(network, peer).await {
                Ok(()) => outcome.applied.push(peer.name.clone()),
                Err(e) => outcome.failed.push((peer.name.clone(), e)),
            }
        }

        for peer in &diff.removed {
            info!(peer = %peer.name, "Removing peer");
            match self.remove_peer(network, peer, &declared).await {
                Ok(()) => outcome.removed.push(peer.name.clone()),
                Err(e) => {
                    error!(peer = %peer.name, error = %e, "Failed to remove peer");
                    self.tracker
                        .set_peer_state(&peer.name, PeerState::Error, Some(e.to_string()));
                    outcome.failed.push((peer.name.clone(), e));
                }
            }
        }

        for update in &diff.updated {
            match self.update_peer(network, update, &declared).await {
                Ok(()) => outcome.applied.push(update.name().to_string()),
                Err(e) => outcome.failed.push((update.name().to_string(), e)),
            }
        }

        outcome
    }

    async fn add_peer(&self, network: &str, peer: &PeerSpec) -> Result<()> {
        let config = match self.adapter.build_peer_config(peer).await {
            Ok(config) => config,
            Err(e) => {
                self.peer_failed(&peer.name, &e);
                return Err(e);
            }
        };

        if let Err(e) = self.adapter.apply_single_peer(network, config).await {
            self.peer_failed(&peer.name, &e);
            return Err(e);
        }

        self.tracker.set_peer_state(&peer.name, PeerState::Configuring, None);
        debug!(peer = %peer.name, "Peer applied");
        Ok(())
    }

    async fn remove_peer(
        &self,
        network: &str,
        peer: &PeerSpec,
        declared: &HashSet<Key>,
    ) -> Result<()> {
        let key = match parse_key(&peer.name, &peer.public_key) {
            Ok(key) => key,
            Err(_) => {
                // Never accepted by the device, nothing to delete
                debug!(peer = %peer.name, "Removed peer had no valid key");
                self.tracker.remove_peer(&peer.name);
                return Ok(());
            }
        };

        if declared.contains(&key) {
            debug!(peer = %peer.name, "Key still declared, keeping device entry");
            self.tracker.remove_peer(&peer.name);
            return Ok(());
        }

        match self.removal_mode {
            RemovalMode::SinglePeer => {
                self.adapter.remove_peer(network, key).await?;
            }
            RemovalMode::FullTeardown => {
                self.adapter.clear_all_peers(network).await?;
                let message = format!("peer table cleared to remove {}", peer.name);
                for name in self.tracker.snapshot().peers.keys() {
                    if *name != peer.name {
                        self.tracker
                            .set_peer_state(name, PeerState::Down, Some(message.clone()));
                    }
                }
            }
        }

        self.tracker.remove_peer(&peer.name);
        Ok(())
    }

    async fn update_peer(
        &self,
        network: &str,
        update: &PeerUpdate,
        declared: &HashSet<Key>,
    ) -> Result<()> {
        info!(
            peer = %update.name(),
            changes = %update.previous.describe_changes(&update.current),
            "Updating peer"
        );

        if let Err(e) = self.remove_peer(network, &update.previous, declared).await {
            warn!(peer = %update.name(), error = %e, "Failed to remove old peer before update");
        }

        self.add_peer(network, &update.current).await
    }

    fn peer_failed(&self, name: &str, e: &Error) {
        error!(peer = %name, error = %e, "Failed to configure peer");
        self.tracker
            .set_peer_state(name, PeerState::Error, Some(e.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mesh, peer, MemoryController, KEY_A, KEY_B, KEY_C, KEY_D};
    use meshsync_common::{diff_peers, MeshState};
    use std::sync::Arc;

    fn reconciler(
        controller: &Arc<MemoryController>,
        mode: RemovalMode,
    ) -> (Reconciler, StatusTracker) {
        let tracker = StatusTracker::new("wg0");
        let adapter = ControllerAdapter::new(controller.clone(), 25);
        (Reconciler::new(adapter, tracker.clone(), mode), tracker)
    }

    #[tokio::test]
    async fn test_full_applies_all_peers() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let spec = mesh(vec![peer("a", KEY_A), peer("b", KEY_B)]);

        let outcome = reconciler.full(&spec).await.unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.applied, vec!["a", "b"]);
        assert_eq!(controller.peer_keys("wg0").len(), 2);

        let calls = controller.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.replace_peers);
        assert_eq!(calls[0].1.listen_port, Some(51820));

        // Left configuring until the monitor confirms
        let status = tracker.snapshot();
        assert_eq!(status.peers["a"].state, PeerState::Configuring);
        assert_eq!(status.state, MeshState::Partial);
    }

    #[tokio::test]
    async fn test_full_isolates_invalid_peer() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let spec = mesh(vec![peer("one", KEY_A), peer("two", "bogus"), peer("three", KEY_C)]);

        let outcome = reconciler.full(&spec).await.unwrap();
        assert!(matches!(outcome.first_error(), Some(Error::InvalidKey { .. })));
        assert_eq!(outcome.applied, vec!["one", "three"]);

        assert_eq!(
            controller.peer_keys("wg0"),
            {
                let mut keys = vec![KEY_A.to_string(), KEY_C.to_string()];
                keys.sort();
                keys
            }
        );
        let status = tracker.snapshot();
        assert_eq!(status.peers["two"].state, PeerState::Error);
        assert!(status.peers["two"].last_error.is_some());
        assert_eq!(status.peers["one"].state, PeerState::Configuring);
    }

    #[tokio::test]
    async fn test_full_device_failure_marks_attempted_peers() {
        let controller = Arc::new(MemoryController::new());
        controller.fail_configure(Some("no such device"));
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let spec = mesh(vec![peer("a", KEY_A), peer("bad", "bogus")]);

        let err = reconciler.full(&spec).await.unwrap_err();
        assert!(matches!(err, Error::ControllerApply(_)));

        let status = tracker.snapshot();
        let a = &status.peers["a"];
        assert_eq!(a.state, PeerState::Error);
        assert!(a.last_error.as_deref().unwrap().contains("no such device"));
        // Validation error preserved
        assert!(status.peers["bad"].last_error.as_deref().unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn test_full_rejects_invalid_local_key() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, _tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let mut spec = mesh(vec![peer("a", KEY_A)]);
        spec.local_private_key = "short".to_string();

        assert!(matches!(
            reconciler.full(&spec).await,
            Err(Error::InvalidKey { .. })
        ));
        assert_eq!(controller.configure_calls(), 0);
    }

    #[tokio::test]
    async fn test_incremental_order_and_isolation() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let old = mesh(vec![peer("a", KEY_A), peer("b", KEY_B)]);
        reconciler.full(&old).await.unwrap();

        let mut changed_b = peer("b", KEY_B);
        changed_b.allowed_address_ranges = vec!["10.9.0.0/16".to_string()];
        let new = mesh(vec![changed_b, peer("c", KEY_C), peer("d", "bogus")]);
        let diff = diff_peers(&old.peers, &new.peers);

        let outcome = reconciler.incremental(&new, &diff).await;
        assert_eq!(outcome.applied, vec!["c", "b"]);
        assert_eq!(outcome.removed, vec!["a"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "d");

        let mut expected = vec![KEY_B.to_string(), KEY_C.to_string()];
        expected.sort();
        assert_eq!(controller.peer_keys("wg0"), expected);
        let b = controller.device_peer("wg0", KEY_B).unwrap();
        assert_eq!(b.allowed_ips[0].to_string(), "10.9.0.0/16");

        // Incremental calls never replace the whole table
        assert!(controller.calls()[1..].iter().all(|(_, c)| !c.replace_peers));

        let status = tracker.snapshot();
        assert!(!status.peers.contains_key("a"));
        assert_eq!(status.peers["d"].state, PeerState::Error);
        assert_eq!(status.peers["c"].state, PeerState::Configuring);
    }

    #[tokio::test]
    async fn test_update_with_new_key_removes_old_key() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, _tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let old = mesh(vec![peer("a", KEY_A)]);
        reconciler.full(&old).await.unwrap();

        let new = mesh(vec![peer("a", KEY_D)]);
        let diff = diff_peers(&old.peers, &new.peers);
        let outcome = reconciler.incremental(&new, &diff).await;

        assert!(!outcome.is_degraded());
        assert_eq!(controller.peer_keys("wg0"), vec![KEY_D.to_string()]);
    }

    #[tokio::test]
    async fn test_rename_keeps_shared_key() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let old = mesh(vec![peer("laptop", KEY_A)]);
        reconciler.full(&old).await.unwrap();

        let new = mesh(vec![peer("laptop2", KEY_A)]);
        let outcome = reconciler.incremental(&new, &diff_peers(&old.peers, &new.peers)).await;

        assert!(!outcome.is_degraded());
        assert_eq!(outcome.applied, vec!["laptop2"]);
        assert_eq!(outcome.removed, vec!["laptop"]);
        assert_eq!(controller.peer_keys("wg0"), vec![KEY_A.to_string()]);
        assert!(tracker.peer("laptop").is_none());
        assert_eq!(tracker.peer("laptop2").unwrap().state, PeerState::Configuring);
    }

    #[tokio::test]
    async fn test_key_swap_keeps_both_peers() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let mut a = peer("a", KEY_A);
        a.allowed_address_ranges = vec!["10.0.1.0/24".to_string()];
        let mut b = peer("b", KEY_B);
        b.allowed_address_ranges = vec!["10.0.2.0/24".to_string()];
        let old = mesh(vec![a.clone(), b.clone()]);
        reconciler.full(&old).await.unwrap();

        a.public_key = KEY_B.to_string();
        b.public_key = KEY_A.to_string();
        let new = mesh(vec![a, b]);
        let outcome = reconciler.incremental(&new, &diff_peers(&old.peers, &new.peers)).await;

        assert!(!outcome.is_degraded());
        let mut expected = vec![KEY_A.to_string(), KEY_B.to_string()];
        expected.sort();
        assert_eq!(controller.peer_keys("wg0"), expected);
        // Each key now carries the ranges of the peer that claims it
        let on_b = controller.device_peer("wg0", KEY_B).unwrap();
        assert_eq!(on_b.allowed_ips[0].to_string(), "10.0.1.0/24");
        let on_a = controller.device_peer("wg0", KEY_A).unwrap();
        assert_eq!(on_a.allowed_ips[0].to_string(), "10.0.2.0/24");
        assert_eq!(tracker.snapshot().peers.len(), 2);
    }

    #[tokio::test]
    async fn test_full_teardown_skips_shared_key() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, _tracker) = reconciler(&controller, RemovalMode::FullTeardown);
        let old = mesh(vec![peer("laptop", KEY_A), peer("b", KEY_B)]);
        reconciler.full(&old).await.unwrap();

        let new = mesh(vec![peer("laptop2", KEY_A), peer("b", KEY_B)]);
        reconciler.incremental(&new, &diff_peers(&old.peers, &new.peers)).await;

        assert_eq!(controller.peer_keys("wg0").len(), 2);
    }

    #[tokio::test]
    async fn test_failed_add_continues_batch() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let old = mesh(vec![]);
        reconciler.full(&old).await.unwrap();

        controller.fail_configure(Some("device busy"));
        let new = mesh(vec![peer("a", KEY_A), peer("b", KEY_B)]);
        let outcome = reconciler.incremental(&new, &diff_peers(&old.peers, &new.peers)).await;

        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(tracker.peer("a").unwrap().state, PeerState::Error);
        assert_eq!(tracker.peer("b").unwrap().state, PeerState::Error);
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_status() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let old = mesh(vec![peer("a", KEY_A)]);
        reconciler.full(&old).await.unwrap();

        controller.fail_configure(Some("device busy"));
        let new = mesh(vec![]);
        let outcome = reconciler.incremental(&new, &diff_peers(&old.peers, &new.peers)).await;

        assert!(outcome.removed.is_empty());
        assert_eq!(tracker.peer("a").unwrap().state, PeerState::Error);
    }

    #[tokio::test]
    async fn test_full_teardown_removal() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::FullTeardown);
        let old = mesh(vec![peer("a", KEY_A), peer("b", KEY_B)]);
        reconciler.full(&old).await.unwrap();

        let new = mesh(vec![peer("b", KEY_B)]);
        let outcome = reconciler.incremental(&new, &diff_peers(&old.peers, &new.peers)).await;

        assert_eq!(outcome.removed, vec!["a"]);
        assert!(controller.peer_keys("wg0").is_empty());
        let b = tracker.peer("b").unwrap();
        assert_eq!(b.state, PeerState::Down);
        assert!(tracker.peer("a").is_none());
    }

    #[tokio::test]
    async fn test_restart_and_teardown() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let spec = mesh(vec![peer("a", KEY_A)]);
        reconciler.full(&spec).await.unwrap();

        let smaller = mesh(vec![peer("b", KEY_B)]);
        reconciler.restart("wg0", &smaller).await.unwrap();
        assert_eq!(controller.peer_keys("wg0"), vec![KEY_B.to_string()]);
        assert!(tracker.peer("a").is_none());

        reconciler.teardown("wg0").await.unwrap();
        assert!(controller.peer_keys("wg0").is_empty());
        assert!(tracker.snapshot().peers.is_empty());
    }

    #[tokio::test]
    async fn test_restart_with_invalid_key_leaves_device() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, _tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let spec = mesh(vec![peer("a", KEY_A), peer("b", KEY_B)]);
        reconciler.full(&spec).await.unwrap();
        let calls = controller.configure_calls();

        let mut typo = spec.clone();
        typo.local_private_key = "typo".to_string();
        assert!(matches!(
            reconciler.restart("wg0", &typo).await,
            Err(Error::InvalidKey { .. })
        ));
        assert_eq!(controller.configure_calls(), calls);
        assert_eq!(controller.peer_keys("wg0").len(), 2);
    }

    #[tokio::test]
    async fn test_restart_onto_new_device_clears_old_one() {
        let controller = Arc::new(MemoryController::new());
        let (reconciler, _tracker) = reconciler(&controller, RemovalMode::SinglePeer);
        let spec = mesh(vec![peer("a", KEY_A)]);
        reconciler.full(&spec).await.unwrap();

        let mut moved = spec.clone();
        moved.network_name = "wg1".to_string();
        reconciler.restart("wg0", &moved).await.unwrap();

        assert!(controller.peer_keys("wg0").is_empty());
        assert_eq!(controller.peer_keys("wg1"), vec![KEY_A.to_string()]);
    }
}
