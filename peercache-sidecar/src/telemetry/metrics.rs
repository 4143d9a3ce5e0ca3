//! Prometheus Metrics Definitions
//!
//! Every sidecar metric lives in a registry owned by [`SidecarMetrics`], so
//! each sidecar (and each test) gets an independent set.

use peercache_core::{ChangeEvent, PeerCacheError, PeerCacheResult};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Container for all sidecar metrics.
#[derive(Clone)]
pub struct SidecarMetrics {
    registry: Registry,

    /// Peers with a live client
    pub peers_connected: IntGauge,

    /// Entries in the local cache store
    pub cache_entries: IntGauge,

    /// Dial attempts - labels: outcome (success/failure)
    pub dial_attempts_total: IntCounterVec,

    /// Discovery events - labels: kind (added/removed)
    pub discovery_events_total: IntCounterVec,

    /// Cache watcher events - labels: kind (added/removed)
    pub cache_events_total: IntCounterVec,

    /// Reconciliation `List` calls - labels: outcome
    pub reconcile_calls_total: IntCounterVec,

    /// `List` requests served to peers
    pub list_requests_total: IntCounter,
}

impl SidecarMetrics {
    /// Create all metrics and register them with a fresh registry.
    pub fn new() -> PeerCacheResult<Self> {
        let registry = Registry::new();

        let peers_connected = IntGauge::new(
            "peercache_peers_connected",
            "Current number of peers with a live connection",
        )
        .map_err(|e| metric_error("peers_connected", e))?;

        let cache_entries = IntGauge::new(
            "peercache_cache_entries",
            "Current number of entries in the local cache store",
        )
        .map_err(|e| metric_error("cache_entries", e))?;

        let dial_attempts_total = IntCounterVec::new(
            Opts::new("peercache_dial_attempts_total", "Total peer dial attempts"),
            &["outcome"],
        )
        .map_err(|e| metric_error("dial_attempts_total", e))?;

        let discovery_events_total = IntCounterVec::new(
            Opts::new(
                "peercache_discovery_events_total",
                "Total peer membership events from service discovery",
            ),
            &["kind"],
        )
        .map_err(|e| metric_error("discovery_events_total", e))?;

        let cache_events_total = IntCounterVec::new(
            Opts::new("peercache_cache_events_total", "Total cache entry events"),
            &["kind"],
        )
        .map_err(|e| metric_error("cache_events_total", e))?;

        let reconcile_calls_total = IntCounterVec::new(
            Opts::new(
                "peercache_reconcile_calls_total",
                "Total List calls made during reconciliation",
            ),
            &["outcome"],
        )
        .map_err(|e| metric_error("reconcile_calls_total", e))?;

        let list_requests_total = IntCounter::new(
            "peercache_list_requests_total",
            "Total List requests received from peers",
        )
        .map_err(|e| metric_error("list_requests_total", e))?;

        let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
            ("peers_connected", Box::new(peers_connected.clone())),
            ("cache_entries", Box::new(cache_entries.clone())),
            ("dial_attempts_total", Box::new(dial_attempts_total.clone())),
            ("discovery_events_total", Box::new(discovery_events_total.clone())),
            ("cache_events_total", Box::new(cache_events_total.clone())),
            ("reconcile_calls_total", Box::new(reconcile_calls_total.clone())),
            ("list_requests_total", Box::new(list_requests_total.clone())),
        ];
        for (name, collector) in collectors {
            registry
                .register(collector)
                .map_err(|e| metric_error(name, e))?;
        }

        Ok(Self {
            registry,
            peers_connected,
            cache_entries,
            dial_attempts_total,
            discovery_events_total,
            cache_events_total,
            reconcile_calls_total,
            list_requests_total,
        })
    }

    /// Record one dial attempt.
    pub fn record_dial(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.dial_attempts_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_discovery_event(&self, event: &ChangeEvent) {
        self.discovery_events_total
            .with_label_values(&[event.kind()])
            .inc();
    }

    pub fn record_cache_event(&self, event: &ChangeEvent) {
        self.cache_events_total.with_label_values(&[event.kind()]).inc();
    }

    /// Record one reconciliation call; `outcome` is `success` or an RPC
    /// error kind label.
    pub fn record_reconcile_call(&self, outcome: &str) {
        self.reconcile_calls_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_list_request(&self) {
        self.list_requests_total.inc();
    }

    pub fn set_peers_connected(&self, count: usize) {
        self.peers_connected.set(count as i64);
    }

    pub fn set_cache_entries(&self, count: usize) {
        self.cache_entries.set(count as i64);
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> PeerCacheResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PeerCacheError::server(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| PeerCacheError::server(format!("Metrics are not UTF-8: {}", e)))
    }
}

fn metric_error(name: &str, err: prometheus::Error) -> PeerCacheError {
    PeerCacheError::server(format!("Failed to register {}: {}", name, err))
}
