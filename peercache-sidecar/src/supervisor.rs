//! Process supervisor.
//!
//! Wires the cache watcher, service discovery, peer connection manager,
//! reconciliation job and servers together, runs each as its own task and
//! tears everything down once a termination signal arrives or any task
//! ends. The first task error becomes the process result.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use peercache_core::{
    shutdown_channel, ChangeEvent, EventReceiver, PeerCacheError, PeerCacheResult,
};
use peercache_discovery::{DnsServiceDiscovery, ServiceDiscoverer, StaticServiceDiscovery};
use peercache_watch::{CacheWatcher, EntryStore};
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use crate::config::{DiscoveryConfig, SidecarConfig};
use crate::grpc::{CacheRepositoryService, ListMode};
use crate::jobs::{reconcile_task, LoggingReconcileHandler};
use crate::peers::{GrpcDialer, PeerConnectionManager};
use crate::routes::{health_router, HealthState};
use crate::telemetry::SidecarMetrics;

type TaskOutcome = (&'static str, PeerCacheResult<()>);

/// Build the discovery backend selected by `config`.
pub fn build_discoverer(config: &DiscoveryConfig) -> Arc<dyn ServiceDiscoverer> {
    match config {
        DiscoveryConfig::Dns {
            domain,
            interval,
            disable_ipv6,
        } => Arc::new(DnsServiceDiscovery::from_system(
            domain.clone(),
            *interval,
            *disable_ipv6,
        )),
        DiscoveryConfig::Static { peers } => Arc::new(StaticServiceDiscovery::new(peers.clone())),
    }
}

/// Run the sidecar until SIGINT or SIGTERM.
pub async fn run(config: SidecarConfig) -> PeerCacheResult<()> {
    run_until(config, termination_signal()).await
}

/// Run the sidecar until `stop` resolves or one of its tasks ends.
pub async fn run_until<F>(config: SidecarConfig, stop: F) -> PeerCacheResult<()>
where
    F: Future<Output = ()>,
{
    let metrics = Arc::new(SidecarMetrics::new()?);
    let (trigger, shutdown) = shutdown_channel();

    let watcher = Arc::new(CacheWatcher::new(&config.cache_dir).with_workers(config.watch_workers));
    let store = watcher.store();
    let cache_events = watcher
        .take_events()
        .ok_or_else(|| PeerCacheError::server("Cache event stream already taken"))?;

    let discoverer = build_discoverer(&config.discovery);
    let peer_events = discoverer
        .take_events()
        .ok_or_else(|| PeerCacheError::server("Discovery event stream already taken"))?;

    let manager = Arc::new(PeerConnectionManager::new(
        GrpcDialer::new(config.port, config.connect_timeout),
        config.retry.clone(),
        Arc::clone(&metrics),
    ));

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| PeerCacheError::server(format!("Failed to bind {}: {}", listen_addr, e)))?;
    let health_listener = match config.health_addr() {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .map_err(|e| PeerCacheError::server(format!("Failed to bind {}: {}", addr, e)))?,
        ),
        None => None,
    };

    let health = HealthState::new(
        Arc::clone(&store),
        manager.clone(),
        Arc::clone(&metrics),
    );
    let ready = health.ready_flag();

    let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

    {
        let watcher = Arc::clone(&watcher);
        let shutdown = shutdown.clone();
        tasks.spawn(async move { ("watcher", watcher.watch(shutdown).await) });
    }

    tasks.spawn(track_cache_events(
        cache_events,
        Arc::clone(&store),
        Arc::clone(&metrics),
    ));

    {
        let discoverer = Arc::clone(&discoverer);
        let shutdown = shutdown.clone();
        tasks.spawn(async move { ("discovery", discoverer.discover(shutdown).await) });
    }

    {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        tasks.spawn(async move { ("peers", manager.run(peer_events, shutdown).await) });
    }

    {
        let handler = Arc::new(LoggingReconcileHandler::new(Arc::clone(&store)));
        let job = reconcile_task(
            Arc::clone(&manager),
            handler,
            config.reconcile.clone(),
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        tasks.spawn(async move {
            job.await;
            ("reconcile", Ok(()))
        });
    }

    {
        let service = CacheRepositoryService::new(
            Arc::clone(&store),
            ListMode::from_flag(config.serve_inventory),
            Arc::clone(&metrics),
        );
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = Server::builder()
                .add_service(service.into_server())
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    shutdown.triggered().await
                })
                .await
                .map_err(|e| PeerCacheError::server(format!("gRPC server failed: {}", e)));
            ("grpc", result)
        });
    }

    if let Some(listener) = health_listener {
        let router = health_router(health);
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.triggered().await })
                .await
                .map_err(|e| PeerCacheError::server(format!("Health server failed: {}", e)));
            ("health", result)
        });
    }

    ready.store(true, Ordering::Release);
    info!(
        %listen_addr,
        cache_dir = ?config.cache_dir,
        discovery = config.discovery.method(),
        "Sidecar started"
    );

    let mut first_error: Option<PeerCacheError> = None;
    tokio::select! {
        _ = stop => info!("Shutdown signal received"),
        Some(joined) = tasks.join_next() => {
            warn!("A sidecar task ended, shutting down");
            record_outcome(joined, &mut first_error);
        }
    }

    trigger.trigger();
    while let Some(joined) = tasks.join_next().await {
        record_outcome(joined, &mut first_error);
    }

    info!("Sidecar stopped");
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn record_outcome(joined: Result<TaskOutcome, JoinError>, first_error: &mut Option<PeerCacheError>) {
    let err = match joined {
        Ok((name, Ok(()))) => {
            debug!(task = name, "Task finished");
            return;
        }
        Ok((name, Err(err))) => {
            error!(task = name, error = %err, "Task failed");
            err
        }
        Err(join_err) => {
            error!(error = %join_err, "Task panicked or was cancelled");
            PeerCacheError::server(format!("Task failed to complete: {}", join_err))
        }
    };
    first_error.get_or_insert(err);
}

/// Keep metrics in step with the cache watcher's events.
async fn track_cache_events(
    mut events: EventReceiver<ChangeEvent>,
    store: Arc<EntryStore>,
    metrics: Arc<SidecarMetrics>,
) -> TaskOutcome {
    while let Some(event) = events.recv().await {
        debug!(key = %event.key(), kind = event.kind(), "Cache entry changed");
        metrics.record_cache_event(&event);
        metrics.set_cache_entries(store.len());
    }
    ("cache-events", Ok(()))
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
