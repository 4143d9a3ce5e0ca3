//! gRPC Service Implementation
//!
//! Serves `cache_repository.v1.CacheRepository` to peers and converts
//! between wire messages, domain types and transport-independent errors.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use peercache_core::{EntrySummary, RpcError, RpcErrorKind};
use peercache_watch::EntryStore;
use tonic::{Code, Request, Response, Status};

use crate::telemetry::SidecarMetrics;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("cache_repository.v1");
}

use proto::cache_repository_server::{CacheRepository, CacheRepositoryServer};
use proto::{ListRequest, ListResponse};

// ============================================================================
// CONVERSIONS
// ============================================================================

pub fn summary_to_proto(summary: &EntrySummary) -> proto::CacheEntry {
    proto::CacheEntry {
        id: summary.id.clone(),
        modified_at_ms: summary.modified_at.timestamp_millis(),
    }
}

/// `None` for timestamps outside the representable range.
pub fn summary_from_proto(entry: proto::CacheEntry) -> Option<EntrySummary> {
    let modified_at = Utc.timestamp_millis_opt(entry.modified_at_ms).single()?;
    Some(EntrySummary {
        id: entry.id,
        modified_at,
    })
}

/// Classify a failed call independently of tonic.
pub fn rpc_error_from_status(method: &str, status: &Status) -> RpcError {
    let kind = match status.code() {
        Code::Unimplemented => RpcErrorKind::Unimplemented,
        Code::Unavailable | Code::Cancelled => RpcErrorKind::Unavailable,
        Code::DeadlineExceeded => RpcErrorKind::DeadlineExceeded,
        _ => RpcErrorKind::Other,
    };
    RpcError::new(method, kind, status.message())
}

// ============================================================================
// SERVICE
// ============================================================================

/// What `List` answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    /// Every call fails with `unimplemented`.
    Unimplemented,
    /// Calls return the local store, sorted by id.
    Inventory,
}

impl ListMode {
    pub fn from_flag(serve_inventory: bool) -> Self {
        if serve_inventory {
            ListMode::Inventory
        } else {
            ListMode::Unimplemented
        }
    }
}

#[derive(Clone)]
pub struct CacheRepositoryService {
    store: Arc<EntryStore>,
    mode: ListMode,
    metrics: Arc<SidecarMetrics>,
}

impl CacheRepositoryService {
    pub fn new(store: Arc<EntryStore>, mode: ListMode, metrics: Arc<SidecarMetrics>) -> Self {
        Self {
            store,
            mode,
            metrics,
        }
    }

    pub fn into_server(self) -> CacheRepositoryServer<Self> {
        CacheRepositoryServer::new(self)
    }
}

#[tonic::async_trait]
impl CacheRepository for CacheRepositoryService {
    async fn list(&self, _request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        self.metrics.record_list_request();

        match self.mode {
            ListMode::Unimplemented => Err(Status::unimplemented("method List not implemented")),
            ListMode::Inventory => {
                let entries = self
                    .store
                    .summaries()
                    .iter()
                    .map(summary_to_proto)
                    .collect();
                Ok(Response::new(ListResponse { entries }))
            }
        }
    }
}
