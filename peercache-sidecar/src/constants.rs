//! Constants for the peercache sidecar
//!
//! Defaults for every configurable value, in one place.

use std::net::{IpAddr, Ipv4Addr};

// ============================================================================
// NETWORK
// ============================================================================

/// gRPC port this node listens on, and dials on its peers.
pub const DEFAULT_PORT: u16 = 8000;

/// Default gRPC bind host.
pub const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Per-attempt connect timeout when dialing a peer (5 seconds)
pub const DEFAULT_DIAL_CONNECT_TIMEOUT_MS: u64 = 5000;

// ============================================================================
// SERVICE DISCOVERY
// ============================================================================

/// Discovery method used when none is configured.
pub const DEFAULT_SD_METHOD: &str = "dns";

/// DNS poll interval (1 second)
pub const DEFAULT_DNS_QUERY_INTERVAL_MS: u64 = 1000;

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Time between two reconciliation runs (1 minute)
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Deadline for one `List` call against one peer (10 seconds)
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;

/// RPC method name, as used in errors and logs.
pub const LIST_METHOD: &str = "List";
