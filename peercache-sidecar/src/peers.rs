//! Peer connections.
//!
//! [`PeerConnectionManager`] keeps exactly one client per discovered peer
//! address. Discovery events are applied in order; every `Added` spawns an
//! independent dial task so a slow or dead peer never holds up the others.
//!
//! # Slots
//!
//! Each known address owns one slot, either `Dialing` (with the handle of its
//! dial task) or `Connected` (with the live client). Slots carry a generation
//! number; a dial task only ever fills the slot of its own generation, so a
//! result arriving after the address was removed (or removed and re-added)
//! is closed instead of stored.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peercache_core::{
    ChangeEvent, DialError, EntrySummary, EventReceiver, PeerAddress, PeerCacheResult, RetryPolicy,
    RpcError, ShutdownSignal,
};
use tokio::task::AbortHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};

use crate::constants::LIST_METHOD;
use crate::grpc::proto::cache_repository_client::CacheRepositoryClient;
use crate::grpc::proto::ListRequest;
use crate::grpc::{rpc_error_from_status, summary_from_proto};
use crate::telemetry::SidecarMetrics;

// ============================================================================
// TRANSPORT SEAM
// ============================================================================

/// A live connection to one peer.
#[async_trait]
pub trait PeerClient: Clone + Send + Sync + 'static {
    /// The peer's cache inventory.
    async fn list(&self) -> Result<Vec<EntrySummary>, RpcError>;

    /// Release the connection.
    async fn close(self);
}

/// Opens connections to peers. One call is one attempt; retrying is the
/// caller's business.
#[async_trait]
pub trait PeerDialer: Send + Sync + 'static {
    type Client: PeerClient;

    async fn dial(&self, address: &str) -> Result<Self::Client, DialError>;
}

// ============================================================================
// GRPC TRANSPORT
// ============================================================================

/// Plaintext gRPC dialer: `http://address:port`.
#[derive(Debug, Clone)]
pub struct GrpcDialer {
    port: u16,
    connect_timeout: Duration,
}

impl GrpcDialer {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }
}

/// URI for a peer address; IPv6 literals are bracketed.
pub fn target_uri(address: &str, port: u16) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("http://[{}]:{}", ip, port),
        _ => format!("http://{}:{}", address, port),
    }
}

#[async_trait]
impl PeerDialer for GrpcDialer {
    type Client = GrpcPeerClient;

    async fn dial(&self, address: &str) -> Result<GrpcPeerClient, DialError> {
        let endpoint = Endpoint::from_shared(target_uri(address, self.port))
            .map_err(|e| DialError::InvalidTarget {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.connect_timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| DialError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        Ok(GrpcPeerClient {
            address: address.to_string(),
            inner: CacheRepositoryClient::new(channel),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GrpcPeerClient {
    address: PeerAddress,
    inner: CacheRepositoryClient<Channel>,
}

#[async_trait]
impl PeerClient for GrpcPeerClient {
    async fn list(&self) -> Result<Vec<EntrySummary>, RpcError> {
        let mut client = self.inner.clone();
        let response = client
            .list(ListRequest {})
            .await
            .map_err(|status| rpc_error_from_status(LIST_METHOD, &status))?;

        Ok(response
            .into_inner()
            .entries
            .into_iter()
            .filter_map(summary_from_proto)
            .collect())
    }

    async fn close(self) {
        // The channel shuts down once its last clone is dropped.
        debug!(peer = %self.address, "Closing peer channel");
    }
}

// ============================================================================
// DIAL WITH RETRY
// ============================================================================

/// Dial `address` until it succeeds, the policy runs out, or shutdown.
///
/// Sleeps `policy.delay(n)` after failed attempt `n`; there is no sleep
/// after the last attempt. An invalid target is not retried.
pub async fn dial_with_retry<D: PeerDialer>(
    dialer: &D,
    address: &str,
    policy: &RetryPolicy,
    shutdown: &mut ShutdownSignal,
    metrics: &SidecarMetrics,
) -> Result<D::Client, DialError> {
    let cancelled = || DialError::Cancelled {
        address: address.to_string(),
    };
    let mut attempts: u32 = 0;

    loop {
        if shutdown.is_triggered() {
            return Err(cancelled());
        }

        let err = match dialer.dial(address).await {
            Ok(client) => {
                metrics.record_dial(true);
                return Ok(client);
            }
            Err(err) => err,
        };
        metrics.record_dial(false);
        attempts += 1;

        if matches!(err, DialError::InvalidTarget { .. }) {
            return Err(err);
        }
        if !policy.should_retry(attempts) {
            return Err(DialError::Exhausted {
                address: address.to_string(),
                attempts,
                last_error: err.to_string(),
            });
        }

        let delay = policy.delay(attempts - 1);
        warn!(
            peer = %address,
            attempt = attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "Failed to connect to peer, retrying"
        );

        tokio::select! {
            _ = shutdown.triggered() => return Err(cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

enum PeerSlot<C> {
    Dialing { generation: u64, task: AbortHandle },
    Connected { generation: u64, client: C },
}

impl<C> PeerSlot<C> {
    fn generation(&self) -> u64 {
        match self {
            PeerSlot::Dialing { generation, .. } | PeerSlot::Connected { generation, .. } => {
                *generation
            }
        }
    }
}

type Slots<C> = Arc<DashMap<PeerAddress, PeerSlot<C>>>;

/// Read-only view used by the health endpoint.
pub trait PeerStatus: Send + Sync {
    fn connected_count(&self) -> usize;
}

pub struct PeerConnectionManager<D: PeerDialer> {
    dialer: Arc<D>,
    policy: RetryPolicy,
    slots: Slots<D::Client>,
    next_generation: AtomicU64,
    metrics: Arc<SidecarMetrics>,
}

impl<D: PeerDialer> PeerConnectionManager<D> {
    pub fn new(dialer: D, policy: RetryPolicy, metrics: Arc<SidecarMetrics>) -> Self {
        Self {
            dialer: Arc::new(dialer),
            policy,
            slots: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            metrics,
        }
    }

    /// Apply discovery events until shutdown, then close every connection.
    pub async fn run(
        &self,
        mut events: EventReceiver<ChangeEvent>,
        mut shutdown: ShutdownSignal,
    ) -> PeerCacheResult<()> {
        info!("Starting peer connection manager");

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.metrics.record_discovery_event(&event);
                        match event {
                            ChangeEvent::Added(address) => self.handle_added(address, &shutdown),
                            ChangeEvent::Removed(address) => self.handle_removed(&address).await,
                        }
                    }
                    None => {
                        debug!("Discovery stream closed, waiting for shutdown");
                        shutdown.triggered().await;
                        break;
                    }
                }
            }
        }

        self.close_all().await;
        info!("Peer connection manager stopped");
        Ok(())
    }

    fn handle_added(&self, address: PeerAddress, shutdown: &ShutdownSignal) {
        match self.slots.entry(address.clone()) {
            Entry::Occupied(_) => {
                debug!(peer = %address, "Peer already known, ignoring add");
            }
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let dial = DialTask {
                    dialer: Arc::clone(&self.dialer),
                    policy: self.policy.clone(),
                    slots: Arc::clone(&self.slots),
                    metrics: Arc::clone(&self.metrics),
                    shutdown: shutdown.clone(),
                    address: address.clone(),
                    generation,
                };
                // The task cannot touch this shard before the slot below is
                // inserted and the entry guard released.
                let task = tokio::spawn(dial.run());
                vacant.insert(PeerSlot::Dialing {
                    generation,
                    task: task.abort_handle(),
                });
                debug!(peer = %address, generation, "Dialing new peer");
            }
        }
    }

    async fn handle_removed(&self, address: &str) {
        match self.slots.remove(address) {
            Some((_, PeerSlot::Dialing { task, .. })) => {
                task.abort();
                info!(peer = %address, "Cancelled dial to removed peer");
            }
            Some((_, PeerSlot::Connected { client, .. })) => {
                client.close().await;
                info!(peer = %address, "Disconnected from removed peer");
            }
            None => {
                debug!(peer = %address, "Removed peer was not tracked");
            }
        }
        self.metrics.set_peers_connected(self.len());
    }

    async fn close_all(&self) {
        let addresses: Vec<PeerAddress> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        for address in addresses {
            self.handle_removed(&address).await;
        }
    }

    /// Snapshot of every connected peer and its client.
    pub fn connected(&self) -> Vec<(PeerAddress, D::Client)> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                PeerSlot::Connected { client, .. } => Some((slot.key().clone(), client.clone())),
                PeerSlot::Dialing { .. } => None,
            })
            .collect()
    }

    /// Sorted addresses of every connected peer.
    pub fn addresses(&self) -> Vec<PeerAddress> {
        let mut addresses: Vec<PeerAddress> =
            self.connected().into_iter().map(|(address, _)| address).collect();
        addresses.sort();
        addresses
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        connected_count(&self.slots)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `address` is connected.
    pub fn contains(&self, address: &str) -> bool {
        matches!(
            self.slots.get(address).as_deref(),
            Some(PeerSlot::Connected { .. })
        )
    }

    /// Whether `address` is connected or being dialed.
    pub fn is_known(&self, address: &str) -> bool {
        self.slots.contains_key(address)
    }
}

impl<D: PeerDialer> PeerStatus for PeerConnectionManager<D> {
    fn connected_count(&self) -> usize {
        self.len()
    }
}

fn connected_count<C>(slots: &DashMap<PeerAddress, PeerSlot<C>>) -> usize {
    slots
        .iter()
        .filter(|slot| matches!(slot.value(), PeerSlot::Connected { .. }))
        .count()
}

/// Everything one dial task needs, moved into the task.
struct DialTask<D: PeerDialer> {
    dialer: Arc<D>,
    policy: RetryPolicy,
    slots: Slots<D::Client>,
    metrics: Arc<SidecarMetrics>,
    shutdown: ShutdownSignal,
    address: PeerAddress,
    generation: u64,
}

impl<D: PeerDialer> DialTask<D> {
    async fn run(mut self) {
        let result = dial_with_retry(
            self.dialer.as_ref(),
            &self.address,
            &self.policy,
            &mut self.shutdown,
            &self.metrics,
        )
        .await;

        match result {
            Ok(client) => {
                if let Some(stale) = self.store(client) {
                    debug!(peer = %self.address, "Peer removed while dialing, closing connection");
                    stale.close().await;
                } else {
                    info!(peer = %self.address, "Connected to peer");
                }
            }
            Err(err) => {
                self.slots
                    .remove_if(&self.address, |_, slot| slot.generation() == self.generation);
                match err {
                    DialError::Cancelled { .. } => {
                        debug!(peer = %self.address, "Dial cancelled by shutdown")
                    }
                    err => error!(peer = %self.address, error = %err, "Giving up on peer"),
                }
            }
        }
        self.metrics.set_peers_connected(connected_count(&self.slots));
    }

    /// Fill this task's slot. Hands the client back if the slot is gone.
    fn store(&self, client: D::Client) -> Option<D::Client> {
        match self.slots.entry(self.address.clone()) {
            Entry::Occupied(mut occupied) => {
                let ours = matches!(occupied.get(), PeerSlot::Dialing { .. })
                    && occupied.get().generation() == self.generation;
                if !ours {
                    return Some(client);
                }
                occupied.insert(PeerSlot::Connected {
                    generation: self.generation,
                    client,
                });
                None
            }
            Entry::Vacant(_) => Some(client),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_target_uri_brackets_ipv6() {
        assert_eq!(target_uri("10.0.0.1", 8000), "http://10.0.0.1:8000");
        assert_eq!(target_uri("::1", 8000), "http://[::1]:8000");
        assert_eq!(target_uri("fe80::1", 9000), "http://[fe80::1]:9000");
        assert_eq!(target_uri("peer-0.cache", 8000), "http://peer-0.cache:8000");
    }

    #[tokio::test]
    async fn test_grpc_dialer_rejects_garbage_target() {
        let dialer = GrpcDialer::new(8000, Duration::from_millis(100));
        let err = dialer.dial("not a host").await.unwrap_err();
        assert!(matches!(err, DialError::InvalidTarget { .. }));
    }

    proptest! {
        #[test]
        fn prop_ip_targets_are_valid_endpoints(v4 in any::<u32>(), v6 in any::<u128>(), port in 1u16..) {
            for ip in [IpAddr::V4(Ipv4Addr::from(v4)), IpAddr::V6(Ipv6Addr::from(v6))] {
                let uri = target_uri(&ip.to_string(), port);
                prop_assert!(Endpoint::from_shared(uri.clone()).is_ok(), "rejected {}", uri);
            }
        }
    }
}
