//! peercache Sidecar - Peer-to-Peer Cache Node
//!
//! Runs next to an nginx instance: watches its cache directory, discovers
//! the other sidecars of the cluster, keeps one gRPC connection per peer and
//! periodically compares cache inventories with them. Also serves the
//! `CacheRepository` gRPC service peers call into.

pub mod config;
pub mod constants;
pub mod grpc;
pub mod jobs;
pub mod peers;
pub mod routes;
pub mod supervisor;
pub mod telemetry;

// Re-export commonly used types
pub use config::{DiscoveryConfig, SidecarConfig};
pub use grpc::{proto, CacheRepositoryService, ListMode};
pub use jobs::{LoggingReconcileHandler, ReconcileConfig, ReconcileHandler};
pub use peers::{
    dial_with_retry, GrpcDialer, GrpcPeerClient, PeerClient, PeerConnectionManager, PeerDialer,
    PeerStatus,
};
pub use supervisor::{build_discoverer, run, run_until};
pub use telemetry::{init_tracing, SidecarMetrics};
