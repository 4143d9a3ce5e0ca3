//! Tracing subscriber initialization.
//!
//! Production output is one JSON object per line at `info`; debug mode
//! switches to human-readable output at `debug` for the peercache crates.
//! `RUST_LOG`, when set, overrides either default.

use peercache_core::{PeerCacheError, PeerCacheResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PRODUCTION_FILTER: &str = "info";

const DEBUG_FILTER: &str = "peercache=debug,peercache_sidecar=debug,peercache_watch=debug,\
                            peercache_discovery=debug,peercache_core=debug,info";

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_filter(debug: bool) -> &'static str {
    if debug {
        DEBUG_FILTER
    } else {
        PRODUCTION_FILTER
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_tracing(debug: bool) -> PeerCacheResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if debug {
        registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    };

    result.map_err(|e| PeerCacheError::server(format!("Failed to init subscriber: {}", e)))?;

    tracing::debug!(debug, "Logging initialized");
    Ok(())
}
