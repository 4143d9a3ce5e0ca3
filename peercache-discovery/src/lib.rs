//! peercache Discovery - Peer Membership
//!
//! A [`ServiceDiscoverer`] tracks the set of peer addresses for the cluster
//! and publishes membership changes as an ordered stream of
//! [`ChangeEvent`]s. Two backends ship here: [`DnsServiceDiscovery`] polls a
//! domain name, [`StaticServiceDiscovery`] announces a fixed list.

use async_trait::async_trait;
use peercache_core::{ChangeEvent, EventReceiver, PeerCacheResult, ShutdownSignal};

pub mod diff;
pub mod dns;
pub mod resolver;
pub mod static_list;

pub use diff::{diff_peers, PeerDiff};
pub use dns::{DnsServiceDiscovery, DEFAULT_DNS_INTERVAL};
pub use resolver::{HickoryResolver, HostResolver};
pub use static_list::StaticServiceDiscovery;

/// A source of peer membership changes.
#[async_trait]
pub trait ServiceDiscoverer: Send + Sync {
    /// Name of the discovery method, as used in configuration.
    fn method(&self) -> &'static str;

    /// Hand out the change stream. Only the first call gets it.
    fn take_events(&self) -> Option<EventReceiver<ChangeEvent>>;

    /// Run until `shutdown` fires. Startup failures are returned before any
    /// event is published; the change stream is closed on every exit path.
    async fn discover(&self, shutdown: ShutdownSignal) -> PeerCacheResult<()>;
}
