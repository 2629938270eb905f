//! Peer set diffing
//!
//! Peers are keyed by name; position in the config file is irrelevant.
//! Output is sorted by name so equal inputs always produce equal diffs.

use crate::types::PeerSpec;
use std::collections::BTreeMap;

/// A peer present in both snapshots whose declaration changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub previous: PeerSpec,
    pub current: PeerSpec,
}

impl PeerUpdate {
    pub fn name(&self) -> &str {
        &self.current.name
    }
}

/// Difference between two peer sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDiff {
    /// Only in the new set
    pub added: Vec<PeerSpec>,
    /// Only in the old set
    pub removed: Vec<PeerSpec>,
    /// In both, with any field differing
    pub updated: Vec<PeerUpdate>,
}

impl PeerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.updated.len()
    }
}

/// Compute added, removed and updated peers between two snapshots
pub fn diff_peers(old: &[PeerSpec], new: &[PeerSpec]) -> PeerDiff {
    let old_map: BTreeMap<&str, &PeerSpec> = old.iter().map(|p| (p.name.as_str(), p)).collect();
    let new_map: BTreeMap<&str, &PeerSpec> = new.iter().map(|p| (p.name.as_str(), p)).collect();

    let mut diff = PeerDiff::default();

    for (name, old_peer) in &old_map {
        match new_map.get(name) {
            None => diff.removed.push((*old_peer).clone()),
            Some(new_peer) if *new_peer != *old_peer => diff.updated.push(PeerUpdate {
                previous: (*old_peer).clone(),
                current: (*new_peer).clone(),
            }),
            Some(_) => {}
        }
    }

    for (name, new_peer) in &new_map {
        if !old_map.contains_key(name) {
            diff.added.push((*new_peer).clone());
        }
    }

    diff
}
