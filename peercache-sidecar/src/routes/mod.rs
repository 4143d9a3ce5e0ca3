//! HTTP routes served next to the gRPC endpoint.

pub mod health;

pub use health::{create_router as health_router, HealthDetails, HealthResponse, HealthState, HealthStatus};
