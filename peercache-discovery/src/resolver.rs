//! Host name resolution.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use peercache_core::DiscoveryError;
use tracing::warn;

/// Resolves a domain to its current address records.
///
/// A domain with no records (or no such domain) resolves to an empty list.
/// Every other failure is an error.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>, DiscoveryError>;
}

/// [`HostResolver`] backed by `hickory-resolver`.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Resolver configured from the system resolv.conf, or from defaults if
    /// that cannot be read. With `ipv4_only`, only A records are queried.
    pub fn from_system_conf(ipv4_only: bool) -> Self {
        let (config, opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(system) => system,
            Err(err) => {
                warn!(error = %err, "Failed to read system resolver configuration, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self::with_config(config, opts, ipv4_only)
    }

    pub fn with_config(config: ResolverConfig, mut opts: ResolverOpts, ipv4_only: bool) -> Self {
        opts.ip_strategy = if ipv4_only {
            LookupIpStrategy::Ipv4Only
        } else {
            LookupIpStrategy::Ipv4AndIpv6
        };
        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl HostResolver for HickoryResolver {
    async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
        match self.inner.lookup_ip(domain).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(DiscoveryError::Resolution {
                    domain: domain.to_string(),
                    reason: err.to_string(),
                }),
            },
        }
    }
}
