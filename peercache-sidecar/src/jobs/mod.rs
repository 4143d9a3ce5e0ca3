//! Background Jobs for the peercache sidecar
//!
//! - `reconcile`: periodically lists every connected peer's inventory
//!
//! # Usage
//!
//! ```ignore
//! use peercache_sidecar::jobs::{reconcile_task, LoggingReconcileHandler, ReconcileConfig};
//!
//! let handler = Arc::new(LoggingReconcileHandler::new(store));
//! tokio::spawn(reconcile_task(manager, handler, ReconcileConfig::default(), metrics, shutdown));
//! ```

pub mod reconcile;

pub use reconcile::{
    reconcile_peers, reconcile_task, LoggingReconcileHandler, ReconcileConfig, ReconcileHandler,
    ReconcileMetrics, ReconcileSnapshot,
};
