//! peercache Test Utilities
//!
//! Shared test infrastructure for the peercache workspace:
//! - A scripted resolver for driving DNS discovery deterministically
//! - Proptest generators for cache files, peers and inventories
//! - A temporary cache directory fixture
//! - Async assertions for event streams

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

pub use peercache_core::{
    ChangeEvent, DiscoveryError, EntrySummary, EventReceiver, PeerAddress, Timestamp,
};
pub use peercache_discovery::HostResolver;

// ============================================================================
// MOCK RESOLVER
// ============================================================================

/// Resolver that replays a fixed script of answers, one per lookup.
///
/// Once the script runs out the last answer is repeated, so a discovery
/// loop settles on the final membership.
#[derive(Debug)]
pub struct ScriptedResolver {
    script: Mutex<VecDeque<Result<Vec<IpAddr>, DiscoveryError>>>,
    last: Mutex<Result<Vec<IpAddr>, DiscoveryError>>,
    lookups: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(script: Vec<Result<Vec<IpAddr>, DiscoveryError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Ok(Vec::new())),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Script made of successful answers only.
    pub fn from_answers(answers: &[&[&str]]) -> Self {
        Self::new(
            answers
                .iter()
                .map(|answer| Ok(answer.iter().filter_map(|ip| ip.parse().ok()).collect()))
                .collect(),
        )
    }

    /// A resolution failure, as the resolver would report it.
    pub fn failure(domain: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
        Err(DiscoveryError::Resolution {
            domain: domain.to_string(),
            reason: "scripted failure".to_string(),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostResolver for ScriptedResolver {
    async fn lookup(&self, _domain: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(answer) = next {
            *last = answer;
        }
        last.clone()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for peercache inputs.

    use super::*;
    use proptest::prelude::*;

    /// A filesystem operation on a flat cache directory.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FsOp {
        Create(String),
        Rewrite(String),
        Remove(String),
    }

    impl FsOp {
        pub fn name(&self) -> &str {
            match self {
                FsOp::Create(name) | FsOp::Rewrite(name) | FsOp::Remove(name) => name,
            }
        }
    }

    /// Cache file names drawn from a small pool so operations collide.
    pub fn arb_cache_file_name() -> impl Strategy<Value = String> {
        (0u8..6).prop_map(|n| format!("entry{}.cache", n))
    }

    pub fn arb_fs_op() -> impl Strategy<Value = FsOp> {
        prop_oneof![
            3 => arb_cache_file_name().prop_map(FsOp::Create),
            1 => arb_cache_file_name().prop_map(FsOp::Rewrite),
            2 => arb_cache_file_name().prop_map(FsOp::Remove),
        ]
    }

    pub fn arb_fs_ops(max: usize) -> impl Strategy<Value = Vec<FsOp>> {
        prop::collection::vec(arb_fs_op(), 0..max)
    }

    /// An IPv4 literal inside 10.0.0.0/24.
    pub fn arb_peer_address() -> impl Strategy<Value = PeerAddress> {
        (1u8..32).prop_map(|last| format!("10.0.0.{}", last))
    }

    pub fn arb_peer_set() -> impl Strategy<Value = std::collections::BTreeSet<PeerAddress>> {
        prop::collection::btree_set(arb_peer_address(), 0..8)
    }

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    pub fn arb_entry_summary() -> impl Strategy<Value = EntrySummary> {
        ("[a-f0-9]{4}", arb_timestamp()).prop_map(|(id, modified_at)| EntrySummary { id, modified_at })
    }

    pub fn arb_inventory() -> impl Strategy<Value = Vec<EntrySummary>> {
        prop::collection::btree_map("[a-f0-9]{2}", arb_timestamp(), 0..16).prop_map(|entries| {
            entries
                .into_iter()
                .map(|(id, modified_at)| EntrySummary { id, modified_at })
                .collect()
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Filesystem fixtures.

    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    /// A throwaway nginx-style cache directory.
    pub struct TempCacheDir {
        dir: TempDir,
    }

    impl TempCacheDir {
        pub fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        /// Create or overwrite `relative`, creating parent directories.
        pub fn write_file(&self, relative: &str, contents: &[u8]) -> PathBuf {
            let path = self.dir.path().join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, contents).unwrap();
            path
        }

        pub fn remove_file(&self, relative: &str) {
            std::fs::remove_file(self.dir.path().join(relative)).unwrap();
        }

        pub fn create_dir(&self, relative: &str) -> PathBuf {
            let path = self.dir.path().join(relative);
            std::fs::create_dir_all(&path).unwrap();
            path
        }

        pub fn remove_dir(&self, relative: &str) {
            std::fs::remove_dir_all(self.dir.path().join(relative)).unwrap();
        }

        /// Names of the regular files directly under the root.
        pub fn file_names(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.dir.path())
                .unwrap()
                .filter_map(Result::ok)
                .filter(|item| item.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|item| item.file_name().into_string().ok())
                .collect();
            names.sort();
            names
        }
    }

    impl Default for TempCacheDir {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Async helpers for asserting on eventually-consistent state.

    use super::*;

    /// Poll `condition` every 10ms until it holds or `timeout` elapses.
    pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Collect events until none arrives for `quiet`, or the stream ends.
    pub async fn drain_events(events: &mut EventReceiver<ChangeEvent>, quiet: Duration) -> Vec<ChangeEvent> {
        let mut collected = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(quiet, events.recv()).await {
            collected.push(event);
        }
        collected
    }

    /// Next event within `timeout`, panicking otherwise.
    pub async fn expect_event(events: &mut EventReceiver<ChangeEvent>, timeout: Duration) -> ChangeEvent {
        match tokio::time::timeout(timeout, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("event stream closed while waiting for an event"),
            Err(_) => panic!("no event within {:?}", timeout),
        }
    }

    pub fn added(key: &str) -> ChangeEvent {
        ChangeEvent::Added(key.to_string())
    }

    pub fn removed(key: &str) -> ChangeEvent {
        ChangeEvent::Removed(key.to_string())
    }
}
