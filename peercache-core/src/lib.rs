//! peercache Core - Entity Types
//!
//! Data structures, error types and the small concurrency primitives
//! (event streams, shutdown signal) shared by every peercache crate.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod events;
pub mod shutdown;

pub use config::RetryPolicy;
pub use error::{
    ConfigError, DialError, DiscoveryError, PeerCacheError, PeerCacheResult, RpcError,
    RpcErrorKind, WatchError,
};
pub use events::{event_stream, ChangeEvent, EventOutlet, EventReceiver, EventSender};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Key of a cache entry: the file name without its final extension.
pub type EntryKey = String;

/// Network identity of a peer (IP literal or hostname), as produced by
/// service discovery.
pub type PeerAddress = String;

/// Derive the store key for a cache file path.
///
/// Returns `None` for paths without a usable UTF-8 file name.
pub fn entry_key(path: &Path) -> Option<EntryKey> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

// ============================================================================
// CACHE ENTRIES
// ============================================================================

/// One cached object on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: EntryKey,
    pub path: PathBuf,
    pub modified_at: Timestamp,
    /// Reserved for a tombstone protocol. Entries are hard-deleted today,
    /// so live store entries always carry `None`.
    pub removed_at: Option<Timestamp>,
}

impl CacheEntry {
    pub fn new(id: impl Into<EntryKey>, path: impl Into<PathBuf>, modified_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            modified_at,
            removed_at: None,
        }
    }

    /// Build an entry for `path`, keyed by [`entry_key`].
    pub fn from_path(path: &Path, modified_at: Timestamp) -> Option<Self> {
        entry_key(path).map(|id| Self::new(id, path, modified_at))
    }

    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            id: self.id.clone(),
            modified_at: self.modified_at,
        }
    }
}

/// What a peer reports about one of its entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: EntryKey,
    pub modified_at: Timestamp,
}

// ============================================================================
// INVENTORY COMPARISON
// ============================================================================

/// Comparison of the local inventory against a peer's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDiff {
    /// Present on the peer, absent locally.
    pub missing_locally: BTreeSet<EntryKey>,
    /// Present locally, absent on the peer.
    pub missing_remotely: BTreeSet<EntryKey>,
    /// Present on both, but the peer's copy is newer.
    pub newer_remotely: BTreeSet<EntryKey>,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_locally.is_empty()
            && self.missing_remotely.is_empty()
            && self.newer_remotely.is_empty()
    }
}

/// Compare two inventories by id and modification time.
pub fn diff_inventory(local: &[EntrySummary], remote: &[EntrySummary]) -> InventoryDiff {
    let local_by_id: HashMap<&str, &Timestamp> =
        local.iter().map(|e| (e.id.as_str(), &e.modified_at)).collect();
    let remote_by_id: HashMap<&str, &Timestamp> =
        remote.iter().map(|e| (e.id.as_str(), &e.modified_at)).collect();

    let mut diff = InventoryDiff::default();

    for (id, remote_modified) in &remote_by_id {
        match local_by_id.get(id) {
            None => {
                diff.missing_locally.insert((*id).to_string());
            }
            Some(local_modified) if remote_modified > local_modified => {
                diff.newer_remotely.insert((*id).to_string());
            }
            Some(_) => {}
        }
    }

    for id in local_by_id.keys() {
        if !remote_by_id.contains_key(id) {
            diff.missing_remotely.insert((*id).to_string());
        }
    }

    diff
}
