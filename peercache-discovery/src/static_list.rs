//! Discovery from a fixed address list.

use std::collections::BTreeSet;

use async_trait::async_trait;
use peercache_core::{
    ChangeEvent, EventOutlet, EventReceiver, PeerAddress, PeerCacheResult, ShutdownSignal,
};
use tracing::info;

use crate::ServiceDiscoverer;

/// Announces each configured peer once, then idles until shutdown.
pub struct StaticServiceDiscovery {
    peers: BTreeSet<PeerAddress>,
    events: EventOutlet<ChangeEvent>,
}

impl StaticServiceDiscovery {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PeerAddress>,
    {
        Self {
            peers: peers
                .into_iter()
                .map(Into::into)
                .map(|peer: PeerAddress| peer.trim().to_string())
                .filter(|peer| !peer.is_empty())
                .collect(),
            events: EventOutlet::new(),
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peers.iter()
    }
}

#[async_trait]
impl ServiceDiscoverer for StaticServiceDiscovery {
    fn method(&self) -> &'static str {
        "static"
    }

    fn take_events(&self) -> Option<EventReceiver<ChangeEvent>> {
        self.events.take_receiver()
    }

    async fn discover(&self, mut shutdown: ShutdownSignal) -> PeerCacheResult<()> {
        if !shutdown.is_triggered() {
            for peer in &self.peers {
                info!(peer = %peer, "Discovered new peer");
                self.events.send(ChangeEvent::Added(peer.clone()));
            }
            shutdown.triggered().await;
        }
        self.events.close();
        Ok(())
    }
}
