//! Set difference between two membership observations.

use std::collections::BTreeSet;

use peercache_core::{ChangeEvent, PeerAddress};

/// Members to add and to remove to get from one observation to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDiff {
    pub added: BTreeSet<PeerAddress>,
    pub removed: BTreeSet<PeerAddress>,
}

impl PeerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Apply the diff to `tracked`.
    pub fn apply_to(&self, tracked: &mut BTreeSet<PeerAddress>) {
        tracked.extend(self.added.iter().cloned());
        for address in &self.removed {
            tracked.remove(address);
        }
    }

    /// Events for this diff: every addition first, then every removal.
    pub fn into_events(self) -> Vec<ChangeEvent> {
        self.added
            .into_iter()
            .map(ChangeEvent::Added)
            .chain(self.removed.into_iter().map(ChangeEvent::Removed))
            .collect()
    }
}

/// `added = observed - previous`, `removed = previous - observed`.
pub fn diff_peers(previous: &BTreeSet<PeerAddress>, observed: &BTreeSet<PeerAddress>) -> PeerDiff {
    PeerDiff {
        added: observed.difference(previous).cloned().collect(),
        removed: previous.difference(observed).cloned().collect(),
    }
}
