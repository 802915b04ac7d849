//! Long-lived queue drainers and the manager that tracks them.
//!
//! Save, delete, and retry drainers run as one tokio task each. All of
//! them observe the process-wide shutdown signal and exit cleanly; the
//! manager keeps their join handles for liveness reporting (`/status`) and
//! for join-all on shutdown.

pub mod delete;
pub mod retry;
pub mod save;

use crate::backends::BackendRegistry;
use crate::config::Config;
use crate::queue::DiskQueue;
use crate::store::ZoneStore;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use zonegate_common::{DeleteItem, RetryItem, SaveItem, WorkerLiveness};

/// Everything a drainer needs, shared by reference.
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn ZoneStore>,
    pub registry: Arc<BackendRegistry>,
    pub save_queue: Arc<DiskQueue<SaveItem>>,
    pub delete_queue: Arc<DiskQueue<DeleteItem>>,
    pub retry_queue: Arc<DiskQueue<RetryItem>>,
}

enum WorkerSlot {
    Save,
    Delete,
    RetryDrain,
    Reconciler,
    PeerSync,
}

struct TrackedWorker {
    slot: WorkerSlot,
    handle: JoinHandle<()>,
}

/// Spawns the drainers and keeps their handles.
pub struct WorkerManager {
    workers: Mutex<Vec<TrackedWorker>>,
}

impl WorkerManager {
    /// Spawn the three queue drainers. The reconciler and peer-sync workers
    /// are registered separately because they own extra state.
    pub fn spawn_drainers(ctx: Arc<WorkerContext>, shutdown: &watch::Receiver<()>) -> Self {
        let workers = vec![
            TrackedWorker {
                slot: WorkerSlot::Save,
                handle: tokio::spawn(save::run(ctx.clone(), shutdown.clone())),
            },
            TrackedWorker {
                slot: WorkerSlot::Delete,
                handle: tokio::spawn(delete::run(ctx.clone(), shutdown.clone())),
            },
            TrackedWorker {
                slot: WorkerSlot::RetryDrain,
                handle: tokio::spawn(retry::run(ctx, shutdown.clone())),
            },
        ];
        info!("Started worker tasks: save, delete, retry_drain");
        Self {
            workers: Mutex::new(workers),
        }
    }

    pub fn register_reconciler(&mut self, handle: JoinHandle<()>) {
        self.workers.lock().expect("worker lock poisoned").push(TrackedWorker {
            slot: WorkerSlot::Reconciler,
            handle,
        });
    }

    pub fn register_peer_sync(&mut self, handle: JoinHandle<()>) {
        self.workers.lock().expect("worker lock poisoned").push(TrackedWorker {
            slot: WorkerSlot::PeerSync,
            handle,
        });
    }

    /// Current liveness flags for `/status`. A worker that was never
    /// spawned reports as not alive.
    pub fn liveness(&self) -> WorkerLiveness {
        let mut flags = WorkerLiveness::default();
        for worker in self.workers.lock().expect("worker lock poisoned").iter() {
            let alive = !worker.handle.is_finished();
            match worker.slot {
                WorkerSlot::Save => flags.save = alive,
                WorkerSlot::Delete => flags.delete = alive,
                WorkerSlot::RetryDrain => flags.retry_drain = alive,
                WorkerSlot::Reconciler => flags.reconciler = alive,
                WorkerSlot::PeerSync => flags.peer_sync = alive,
            }
        }
        flags
    }

    /// Wait for every worker to observe shutdown and exit. Called after the
    /// shutdown signal fired, before the datastore and queues close.
    pub async fn join_all(&self) {
        let workers: Vec<TrackedWorker> = {
            let mut guard = self.workers.lock().expect("worker lock poisoned");
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.handle.await {
                error!(error = %e, "Worker task join failed");
            }
        }
        info!("Workers stopped");
    }
}
