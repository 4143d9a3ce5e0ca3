//! DNS-based discovery.
//!
//! Resolves the cluster domain once at startup, then again on a fixed
//! interval. Each observation is diffed against the tracked set; new
//! addresses are announced before vanished ones.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peercache_core::{
    ChangeEvent, DiscoveryError, EventOutlet, EventReceiver, PeerAddress, PeerCacheResult,
    ShutdownSignal,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, Instrument};

use crate::diff::diff_peers;
use crate::resolver::{HickoryResolver, HostResolver};
use crate::ServiceDiscoverer;

/// Default delay between two resolutions.
pub const DEFAULT_DNS_INTERVAL: Duration = Duration::from_secs(1);

pub struct DnsServiceDiscovery {
    domain: String,
    interval: Duration,
    disable_ipv6: bool,
    resolver: Arc<dyn HostResolver>,
    events: EventOutlet<ChangeEvent>,
}

impl DnsServiceDiscovery {
    pub fn new(domain: impl Into<String>, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            domain: domain.into(),
            interval: DEFAULT_DNS_INTERVAL,
            disable_ipv6: false,
            resolver,
            events: EventOutlet::new(),
        }
    }

    /// Discovery backed by the system resolver configuration.
    pub fn from_system(domain: impl Into<String>, interval: Duration, disable_ipv6: bool) -> Self {
        let resolver = Arc::new(HickoryResolver::from_system_conf(disable_ipv6));
        Self::new(domain, resolver)
            .with_interval(interval)
            .with_disable_ipv6(disable_ipv6)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        // interval_at panics on a zero period
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_disable_ipv6(mut self, disable_ipv6: bool) -> Self {
        self.disable_ipv6 = disable_ipv6;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn resolve(&self) -> Result<BTreeSet<PeerAddress>, DiscoveryError> {
        let addresses = self.resolver.lookup(&self.domain).await?;
        Ok(addresses
            .into_iter()
            .filter(|ip| !(self.disable_ipv6 && matches!(ip, IpAddr::V6(_))))
            .map(|ip| ip.to_string())
            .collect())
    }

    /// Diff `observed` against `tracked`, publish the changes and update
    /// `tracked`.
    fn publish(&self, tracked: &mut BTreeSet<PeerAddress>, observed: BTreeSet<PeerAddress>) {
        let diff = diff_peers(tracked, &observed);
        if diff.is_empty() {
            return;
        }
        diff.apply_to(tracked);

        for event in diff.into_events() {
            match &event {
                ChangeEvent::Added(address) => info!(peer = %address, "Discovered new peer"),
                ChangeEvent::Removed(address) => info!(peer = %address, "Removing stale peer"),
            }
            self.events.send(event);
        }
    }

    async fn run(&self, mut shutdown: ShutdownSignal) -> PeerCacheResult<()> {
        if shutdown.is_triggered() {
            return Ok(());
        }

        debug!("Starting service discovery");

        let mut tracked = BTreeSet::new();
        let observed = self.resolve().await?;
        self.publish(&mut tracked, observed);

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    let resolved = tokio::select! {
                        _ = shutdown.triggered() => break,
                        resolved = self.resolve() => resolved,
                    };
                    match resolved {
                        Ok(observed) => self.publish(&mut tracked, observed),
                        Err(err) => error!(error = %err, "Failed to discover peers"),
                    }
                }
            }
        }

        debug!(peers = tracked.len(), "Service discovery stopped");
        Ok(())
    }
}

#[async_trait]
impl ServiceDiscoverer for DnsServiceDiscovery {
    fn method(&self) -> &'static str {
        "dns"
    }

    fn take_events(&self) -> Option<EventReceiver<ChangeEvent>> {
        self.events.take_receiver()
    }

    async fn discover(&self, shutdown: ShutdownSignal) -> PeerCacheResult<()> {
        let span = info_span!(
            "discovery",
            method = "dns",
            domain = %self.domain,
            disable_ipv6 = self.disable_ipv6
        );
        let result = self.run(shutdown).instrument(span).await;
        self.events.close();
        result
    }
}
