//! zonegate server: the durable write pipeline between a hosting control
//! panel and one or more authoritative DNS backends.
//!
//! Startup order: datastore (with additive migration), disk queues, backend
//! registry, workers, then the HTTP listener. Shutdown reverses it: stop
//! accepting ingress, signal every worker through one watch channel, join
//! them all, then drop the datastore and queues.

use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

pub mod api;
pub mod auth;
pub mod backends;
pub mod config;
pub mod dispatch;
pub mod peer_sync;
pub mod queue;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod test_helpers;
pub mod upstream;
pub mod workers;

use crate::backends::BackendRegistry;
use crate::config::{Config, DatastoreType};
use crate::peer_sync::{Peer, PeerSyncWorker, SharedPeerHealth, SharedPeers};
use crate::queue::DiskQueue;
use crate::reconciler::{Reconciler, SharedLastRun};
use crate::store::{MysqlStore, SqliteStore, ZoneStore};
use crate::workers::{WorkerContext, WorkerManager};
use zonegate_common::{DeleteItem, RetryItem, SaveItem};

/// Application state shared with every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ZoneStore>,
    pub registry: Arc<BackendRegistry>,
    pub save_queue: Arc<DiskQueue<SaveItem>>,
    pub delete_queue: Arc<DiskQueue<DeleteItem>>,
    pub retry_queue: Arc<DiskQueue<RetryItem>>,
    pub peers: SharedPeers,
    pub peer_health: SharedPeerHealth,
    pub reconciler_last_run: SharedLastRun,
    pub workers: Arc<WorkerManager>,
}

/// Run the daemon until a shutdown signal. Returns an error (and a non-zero
/// exit) only for unrecoverable startup failures: datastore open, port bind.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let store: Arc<dyn ZoneStore> = match config.datastore.store_type {
        DatastoreType::Sqlite => Arc::new(
            SqliteStore::open(&config.datastore.db_location)
                .await
                .context("Failed to open SQLite datastore")?,
        ),
        DatastoreType::Mysql => Arc::new(
            MysqlStore::open(&config.datastore.mysql_url())
                .await
                .context("Failed to open MySQL datastore")?,
        ),
    };

    let save_queue = Arc::new(
        DiskQueue::open(config.queue_location.join("save"))
            .context("Failed to initialize save queue")?,
    );
    let delete_queue = Arc::new(
        DiskQueue::open(config.queue_location.join("delete"))
            .context("Failed to initialize delete queue")?,
    );
    let retry_queue = Arc::new(
        DiskQueue::open(config.queue_location.join("retry"))
            .context("Failed to initialize retry queue")?,
    );
    info!(path = %config.queue_location.display(), "Initialized queues");

    let registry = Arc::new(BackendRegistry::from_config(&config.dns).await);
    info!(backends = ?registry.names(), "Available backend instances");

    let ctx = Arc::new(WorkerContext {
        config: config.clone(),
        store: store.clone(),
        registry: registry.clone(),
        save_queue: save_queue.clone(),
        delete_queue: delete_queue.clone(),
        retry_queue: retry_queue.clone(),
    });

    let mut workers = WorkerManager::spawn_drainers(ctx.clone(), &shutdown_rx);

    let reconciler_last_run: SharedLastRun = Arc::new(RwLock::new(None));
    if config.reconciliation.enabled {
        if config.reconciliation.upstream_servers.is_empty() {
            warn!("Reconciliation enabled but no upstream servers configured");
        } else {
            let worker = Reconciler::new(ctx.clone(), reconciler_last_run.clone());
            workers.register_reconciler(tokio::spawn(worker.run(shutdown_rx.clone())));
        }
    } else {
        info!("Reconciliation poller disabled — skipping");
    }

    let peers: SharedPeers = Arc::new(RwLock::new(
        config
            .peer_sync
            .peers
            .iter()
            .filter(|p| !p.url.trim().is_empty())
            .map(|p| Peer {
                url: p.url.trim_end_matches('/').to_string(),
                username: p.username.clone(),
                password: p.password.clone(),
            })
            .collect::<Vec<_>>(),
    ));
    let peer_health: SharedPeerHealth = Arc::new(RwLock::new(HashMap::new()));
    if config.peer_sync.enabled {
        if peers.read().await.is_empty() {
            warn!("Peer sync enabled but no peers configured");
        } else {
            let worker = PeerSyncWorker::new(ctx.clone(), peers.clone(), peer_health.clone())
                .context("Failed to build peer sync client")?;
            workers.register_peer_sync(tokio::spawn(worker.run(shutdown_rx.clone())));
        }
    } else {
        info!("Peer sync disabled — skipping");
    }

    let workers = Arc::new(workers);
    let app_state = AppState {
        config: config.clone(),
        store,
        registry,
        save_queue,
        delete_queue,
        retry_queue,
        peers,
        peer_health,
        reconciler_last_run,
        workers: workers.clone(),
    };

    let app = api::router(app_state).layer(
        TraceLayer::new_for_http()
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind port {}", config.app.listen_port))?;
    info!(
        addr = %listener.local_addr().context("Failed to get local address")?,
        "zonegate listening"
    );

    let signal_tx = shutdown_tx.clone();
    let shutdown_signal = async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received Ctrl+C");
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                    info!("Received SIGTERM");
                }
                Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        info!("Sending shutdown signal to all components");
        let _ = signal_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    // In case serve exited without the signal path having fired.
    let _ = shutdown_tx.send(());
    workers.join_all().await;
    info!("Shutdown complete");

    Ok(())
}
