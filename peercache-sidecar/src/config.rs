//! Sidecar Configuration Module
//!
//! All settings come from `PEERCACHE_*` environment variables. Parsing goes
//! through a lookup function so tests can feed a map instead of mutating the
//! process environment. Unlike background job tuning, a malformed value here
//! is an error: the sidecar refuses to start on a configuration it cannot
//! read.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use peercache_core::config::{DEFAULT_DIAL_INITIAL_BACKOFF, DEFAULT_DIAL_MAX_ATTEMPTS};
use peercache_core::{ConfigError, RetryPolicy};
use peercache_watch::DEFAULT_WATCH_WORKERS;

use crate::constants::{
    DEFAULT_BIND, DEFAULT_DIAL_CONNECT_TIMEOUT_MS, DEFAULT_DNS_QUERY_INTERVAL_MS, DEFAULT_PORT,
    DEFAULT_RECONCILE_INTERVAL_SECS, DEFAULT_RPC_TIMEOUT_MS, DEFAULT_SD_METHOD,
};
use crate::jobs::ReconcileConfig;

// ============================================================================
// DISCOVERY CONFIGURATION
// ============================================================================

/// Which discovery backend to run, with its settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryConfig {
    Dns {
        domain: String,
        interval: Duration,
        disable_ipv6: bool,
    },
    Static {
        peers: Vec<String>,
    },
}

impl DiscoveryConfig {
    pub fn method(&self) -> &'static str {
        match self {
            DiscoveryConfig::Dns { .. } => "dns",
            DiscoveryConfig::Static { .. } => "static",
        }
    }
}

// ============================================================================
// SIDECAR CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// nginx cache directory to watch.
    pub cache_dir: PathBuf,

    pub discovery: DiscoveryConfig,

    /// gRPC listen port; peers are dialed on the same port.
    pub port: u16,

    /// gRPC bind host.
    pub bind: IpAddr,

    pub reconcile: ReconcileConfig,

    /// Dial retry policy.
    pub retry: RetryPolicy,

    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,

    pub watch_workers: usize,

    /// Serve the local inventory from `List` instead of `unimplemented`.
    pub serve_inventory: bool,

    /// Port of the health/metrics HTTP server; disabled when unset.
    pub health_port: Option<u16>,

    /// Debug logging with human-readable output.
    pub debug: bool,
}

impl SidecarConfig {
    /// Create SidecarConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `PEERCACHE_CACHE_DIR`: nginx cache directory (required)
    /// - `PEERCACHE_SD_METHOD`: `dns` or `static` (default: dns)
    /// - `PEERCACHE_SD_DNS`: domain resolved for peers (required for dns)
    /// - `PEERCACHE_SD_DNS_QUERY_INTERVAL_MS`: DNS poll interval (default: 1000)
    /// - `PEERCACHE_SD_DNS_DISABLE_IPV6`: query A records only (default: false)
    /// - `PEERCACHE_SD_STATIC_PEERS`: comma-separated peers (required for static)
    /// - `PEERCACHE_PORT`: gRPC port (default: 8000)
    /// - `PEERCACHE_BIND`: gRPC bind host (default: 0.0.0.0)
    /// - `PEERCACHE_RECONCILE_INTERVAL_SECS`: reconciliation period (default: 60)
    /// - `PEERCACHE_RPC_TIMEOUT_MS`: per-call `List` timeout (default: 10000)
    /// - `PEERCACHE_DIAL_MAX_ATTEMPTS`: dial attempts per peer (default: 20)
    /// - `PEERCACHE_DIAL_INITIAL_BACKOFF_MS`: first backoff delay (default: 1000)
    /// - `PEERCACHE_DIAL_MAX_BACKOFF_SECS`: backoff cap (default: none)
    /// - `PEERCACHE_DIAL_CONNECT_TIMEOUT_MS`: connect timeout (default: 5000)
    /// - `PEERCACHE_WATCH_WORKERS`: watcher workers (default: 4)
    /// - `PEERCACHE_SERVE_INVENTORY`: serve `List` (default: false)
    /// - `PEERCACHE_HEALTH_PORT`: health/metrics port (default: disabled)
    /// - `PEERCACHE_DEBUG`: debug logging (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let cache_dir = PathBuf::from(env.required("PEERCACHE_CACHE_DIR")?);

        let method = env
            .get("PEERCACHE_SD_METHOD")
            .unwrap_or_else(|| DEFAULT_SD_METHOD.to_string())
            .to_lowercase();
        let discovery = match method.as_str() {
            "dns" => DiscoveryConfig::Dns {
                domain: env.required("PEERCACHE_SD_DNS")?,
                interval: Duration::from_millis(
                    env.parse("PEERCACHE_SD_DNS_QUERY_INTERVAL_MS", DEFAULT_DNS_QUERY_INTERVAL_MS)?,
                ),
                disable_ipv6: env.flag("PEERCACHE_SD_DNS_DISABLE_IPV6", false)?,
            },
            "static" => DiscoveryConfig::Static {
                peers: env
                    .required("PEERCACHE_SD_STATIC_PEERS")?
                    .split(',')
                    .map(str::trim)
                    .filter(|peer| !peer.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            _ => return Err(ConfigError::UnknownDiscoveryMethod { method }),
        };

        let mut retry = RetryPolicy::new(
            env.parse("PEERCACHE_DIAL_MAX_ATTEMPTS", DEFAULT_DIAL_MAX_ATTEMPTS)?,
            Duration::from_millis(env.parse(
                "PEERCACHE_DIAL_INITIAL_BACKOFF_MS",
                DEFAULT_DIAL_INITIAL_BACKOFF.as_millis() as u64,
            )?),
        );
        if let Some(secs) = env.parse_optional::<u64>("PEERCACHE_DIAL_MAX_BACKOFF_SECS")? {
            retry = retry.with_max_backoff(Duration::from_secs(secs));
        }

        let config = Self {
            cache_dir,
            discovery,
            port: env.parse("PEERCACHE_PORT", DEFAULT_PORT)?,
            bind: env.parse("PEERCACHE_BIND", DEFAULT_BIND)?,
            reconcile: ReconcileConfig {
                interval: Duration::from_secs(
                    env.parse("PEERCACHE_RECONCILE_INTERVAL_SECS", DEFAULT_RECONCILE_INTERVAL_SECS)?,
                ),
                rpc_timeout: Duration::from_millis(
                    env.parse("PEERCACHE_RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS)?,
                ),
            },
            retry,
            connect_timeout: Duration::from_millis(
                env.parse("PEERCACHE_DIAL_CONNECT_TIMEOUT_MS", DEFAULT_DIAL_CONNECT_TIMEOUT_MS)?,
            ),
            watch_workers: env.parse("PEERCACHE_WATCH_WORKERS", DEFAULT_WATCH_WORKERS)?,
            serve_inventory: env.flag("PEERCACHE_SERVE_INVENTORY", false)?,
            health_port: env.parse_optional("PEERCACHE_HEALTH_PORT")?,
            debug: env.flag("PEERCACHE_DEBUG", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(missing("PEERCACHE_CACHE_DIR"));
        }

        match &self.discovery {
            DiscoveryConfig::Dns {
                domain, interval, ..
            } => {
                if domain.trim().is_empty() {
                    return Err(missing("PEERCACHE_SD_DNS"));
                }
                if interval.is_zero() {
                    return Err(invalid("PEERCACHE_SD_DNS_QUERY_INTERVAL_MS", "0", "must be positive"));
                }
            }
            DiscoveryConfig::Static { peers } => {
                if peers.is_empty() {
                    return Err(missing("PEERCACHE_SD_STATIC_PEERS"));
                }
            }
        }

        if self.reconcile.interval.is_zero() {
            return Err(invalid("PEERCACHE_RECONCILE_INTERVAL_SECS", "0", "must be positive"));
        }
        if self.reconcile.rpc_timeout.is_zero() {
            return Err(invalid("PEERCACHE_RPC_TIMEOUT_MS", "0", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("PEERCACHE_DIAL_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.watch_workers == 0 {
            return Err(invalid("PEERCACHE_WATCH_WORKERS", "0", "must be at least 1"));
        }
        if self.health_port.is_some_and(|port| port == self.port) {
            return Err(invalid(
                "PEERCACHE_HEALTH_PORT",
                &self.port.to_string(),
                "must differ from PEERCACHE_PORT",
            ));
        }

        Ok(())
    }

    /// Address the gRPC server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Address of the health/metrics server, if enabled.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_port.map(|port| SocketAddr::new(self.bind, port))
    }
}

// ============================================================================
// PARSING HELPERS
// ============================================================================

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| missing(key))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse_optional(key)?.unwrap_or(default))
    }

    fn parse_optional<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|e: T::Err| invalid(key, &value, &e.to_string()))
            })
            .transpose()
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => match value.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, &value, "expected true or false")),
            },
        }
    }
}

fn missing(field: &str) -> ConfigError {
    ConfigError::MissingRequired {
        field: field.to_string(),
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
