//! peercache Telemetry - Observability Infrastructure
//!
//! Structured logging through `tracing` and Prometheus metrics for the
//! sidecar components.

pub mod metrics;
pub mod tracer;

pub use metrics::SidecarMetrics;
pub use tracer::{default_filter, init_tracing};
