//! Reconciliation Background Task
//!
//! Periodically asks every connected peer for its cache inventory. Each run:
//!
//! 1. Snapshots the connected peers from the [`PeerConnectionManager`]
//! 2. Calls `List` on all of them concurrently, each under its own deadline
//! 3. Hands every inventory that came back to a [`ReconcileHandler`]
//!
//! A failing peer (unreachable, slow, or a remote that does not implement
//! `List`) is logged and skipped. Nothing is retried at this layer; the next
//! run simply asks again.
//!
//! # Configuration
//!
//! ```rust
//! use peercache_sidecar::jobs::ReconcileConfig;
//! use std::time::Duration;
//!
//! let config = ReconcileConfig {
//!     interval: Duration::from_secs(60),    // Run every minute
//!     rpc_timeout: Duration::from_secs(10), // Per-peer List deadline
//! };
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use peercache_core::{diff_inventory, EntrySummary, RpcError, RpcErrorKind, ShutdownSignal};
use peercache_watch::EntryStore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::constants::{DEFAULT_RECONCILE_INTERVAL_SECS, DEFAULT_RPC_TIMEOUT_MS, LIST_METHOD};
use crate::peers::{PeerClient, PeerConnectionManager, PeerDialer};
use crate::telemetry::SidecarMetrics;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the reconciliation task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Time between runs; the first run happens one interval after start
    /// (default: 60 seconds)
    pub interval: Duration,

    /// Deadline for a single `List` call (default: 10 seconds)
    pub rpc_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
        }
    }
}

// ============================================================================
// HANDLER
// ============================================================================

/// Receives every inventory fetched from a peer.
#[async_trait]
pub trait ReconcileHandler: Send + Sync {
    async fn handle_inventory(&self, peer: &str, inventory: Vec<EntrySummary>);
}

/// Compares each peer inventory against the local store and logs the
/// difference. Does not fetch or evict anything.
pub struct LoggingReconcileHandler {
    store: Arc<EntryStore>,
}

impl LoggingReconcileHandler {
    pub fn new(store: Arc<EntryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReconcileHandler for LoggingReconcileHandler {
    async fn handle_inventory(&self, peer: &str, inventory: Vec<EntrySummary>) {
        let diff = diff_inventory(&self.store.summaries(), &inventory);
        if diff.is_empty() {
            tracing::debug!(peer = %peer, entries = inventory.len(), "Peer inventory matches local cache");
            return;
        }
        tracing::info!(
            peer = %peer,
            missing_locally = diff.missing_locally.len(),
            missing_remotely = diff.missing_remotely.len(),
            newer_remotely = diff.newer_remotely.len(),
            "Peer inventory differs from local cache"
        );
        tracing::debug!(peer = %peer, diff = ?diff, "Inventory difference");
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for one reconciliation task's lifetime.
#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    /// Runs completed
    pub cycles: AtomicU64,

    /// `List` calls that returned an inventory
    pub calls_succeeded: AtomicU64,

    /// `List` calls the remote does not implement
    pub calls_unimplemented: AtomicU64,

    /// `List` calls that failed any other way, timeouts included
    pub calls_failed: AtomicU64,
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ReconcileSnapshot {
        ReconcileSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_unimplemented: self.calls_unimplemented.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reconciliation metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSnapshot {
    pub cycles: u64,
    pub calls_succeeded: u64,
    pub calls_unimplemented: u64,
    pub calls_failed: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run reconciliation every `config.interval` until shutdown.
///
/// Returns the counters collected during the task's lifetime.
pub async fn reconcile_task<D: PeerDialer>(
    manager: Arc<PeerConnectionManager<D>>,
    handler: Arc<dyn ReconcileHandler>,
    config: ReconcileConfig,
    sidecar_metrics: Arc<SidecarMetrics>,
    mut shutdown: ShutdownSignal,
) -> Arc<ReconcileMetrics> {
    let metrics = Arc::new(ReconcileMetrics::new());

    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        rpc_timeout_ms = config.rpc_timeout.as_millis() as u64,
        "Reconciliation task started"
    );

    loop {
        tokio::select! {
            _ = shutdown.triggered() => {
                tracing::info!("Reconciliation task shutting down");
                break;
            }

            _ = ticker.tick() => {
                let peers = manager.connected();
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = reconcile_peers(peers, handler.as_ref(), &config, &metrics, &sidecar_metrics) => {}
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        calls_succeeded = snapshot.calls_succeeded,
        calls_unimplemented = snapshot.calls_unimplemented,
        calls_failed = snapshot.calls_failed,
        "Reconciliation task completed"
    );

    metrics
}

/// Perform one reconciliation run against `peers`.
pub async fn reconcile_peers<C: PeerClient>(
    peers: Vec<(String, C)>,
    handler: &dyn ReconcileHandler,
    config: &ReconcileConfig,
    metrics: &ReconcileMetrics,
    sidecar_metrics: &SidecarMetrics,
) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    if peers.is_empty() {
        tracing::trace!("Reconciliation run with no connected peers");
        return;
    }
    let peer_count = peers.len();

    let calls = peers.into_iter().map(|(peer, client)| async move {
        let result = list_with_timeout(&client, config.rpc_timeout).await;
        (peer, result)
    });

    for (peer, result) in join_all(calls).await {
        match result {
            Ok(inventory) => {
                metrics.calls_succeeded.fetch_add(1, Ordering::Relaxed);
                sidecar_metrics.record_reconcile_call("success");
                handler.handle_inventory(&peer, inventory).await;
            }
            Err(err) if err.is_unimplemented() => {
                metrics.calls_unimplemented.fetch_add(1, Ordering::Relaxed);
                sidecar_metrics.record_reconcile_call(err.kind.as_str());
                tracing::debug!(peer = %peer, error = %err, "Peer does not serve its inventory");
            }
            Err(err) => {
                metrics.calls_failed.fetch_add(1, Ordering::Relaxed);
                sidecar_metrics.record_reconcile_call(err.kind.as_str());
                tracing::warn!(peer = %peer, error = %err, "Failed to list peer inventory");
            }
        }
    }

    tracing::debug!(peers = peer_count, "Reconciliation run completed");
}

async fn list_with_timeout<C: PeerClient>(
    client: &C,
    deadline: Duration,
) -> Result<Vec<EntrySummary>, RpcError> {
    match tokio::time::timeout(deadline, client.list()).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::new(
            LIST_METHOD,
            RpcErrorKind::DeadlineExceeded,
            format!("no response within {}ms", deadline.as_millis()),
        )),
    }
}
