//! The `/status` composite document.
//!
//! Aggregates queue depths, worker liveness, the reconciler's last run, and
//! peer health into one JSON response a UI or monitoring system can poll.
//!
//! Overall `status`:
//! - `ok`:       drainers alive, no retries pending, no dead letters,
//!               all peers healthy
//! - `degraded`: retry backlog, dead letters present, or a degraded peer
//! - `error`:    a core drainer task has died

use crate::AppState;
use tracing::warn;
use zonegate_common::{
    OverallState, PeerStatusEntry, PeerSyncStatus, QueueDepths, ReconcilerStatus, StatusDocument,
    WorkerLiveness, ZoneCount,
};

pub async fn build_status(state: &AppState) -> StatusDocument {
    let dead_letters = match state.store.count_dead_letters().await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "Could not count dead letters for status");
            0
        }
    };
    let queues = QueueDepths {
        save: state.save_queue.len(),
        delete: state.delete_queue.len(),
        retry: state.retry_queue.len(),
        dead_letters,
    };

    let workers = state.workers.liveness();

    let zone_total = match state.store.count_domains().await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "Could not count zones for status");
            0
        }
    };

    let reconciler = ReconcilerStatus {
        enabled: state.config.reconciliation.enabled,
        alive: workers.reconciler,
        dry_run: state.config.reconciliation.dry_run,
        interval_minutes: state.config.reconciliation.interval_minutes,
        last_run: state.reconciler_last_run.read().await.clone(),
    };

    let peer_sync = peer_sync_status(state, &workers).await;
    let status = compute_overall(&workers, &queues, peer_sync.degraded);

    StatusDocument {
        status,
        queues,
        workers,
        reconciler,
        peer_sync,
        zones: ZoneCount { total: zone_total },
    }
}

async fn peer_sync_status(state: &AppState, workers: &WorkerLiveness) -> PeerSyncStatus {
    let peers = state.peers.read().await;
    let health = state.peer_health.read().await;

    let entries: Vec<PeerStatusEntry> = peers
        .iter()
        .map(|peer| {
            let h = health.get(&peer.url).cloned().unwrap_or_default();
            PeerStatusEntry {
                url: peer.url.clone(),
                healthy: h.healthy(),
                consecutive_failures: h.consecutive_failures,
                last_seen: h.last_seen,
            }
        })
        .collect();
    let healthy = entries.iter().filter(|p| p.healthy).count();

    PeerSyncStatus {
        enabled: state.config.peer_sync.enabled,
        alive: workers.peer_sync,
        interval_minutes: state.config.peer_sync.interval_minutes,
        total: entries.len(),
        healthy,
        degraded: entries.len() - healthy,
        peers: entries,
    }
}

/// Derive the overall state. Drainer death is an error; anything queued for
/// repair degrades; otherwise ok.
pub(crate) fn compute_overall(
    workers: &WorkerLiveness,
    queues: &QueueDepths,
    degraded_peers: usize,
) -> OverallState {
    if !workers.save || !workers.delete || !workers.retry_drain {
        return OverallState::Error;
    }
    if queues.retry > 0 || queues.dead_letters > 0 || degraded_peers > 0 {
        return OverallState::Degraded;
    }
    OverallState::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_workers() -> WorkerLiveness {
        WorkerLiveness {
            save: true,
            delete: true,
            retry_drain: true,
            reconciler: true,
            peer_sync: true,
        }
    }

    #[test]
    fn test_overall_ok() {
        let state = compute_overall(&healthy_workers(), &QueueDepths::default(), 0);
        assert_eq!(state, OverallState::Ok);
    }

    #[test]
    fn test_overall_degraded_on_retry_backlog() {
        let queues = QueueDepths {
            retry: 2,
            ..Default::default()
        };
        assert_eq!(
            compute_overall(&healthy_workers(), &queues, 0),
            OverallState::Degraded
        );
    }

    #[test]
    fn test_overall_degraded_on_dead_letters() {
        let queues = QueueDepths {
            dead_letters: 1,
            ..Default::default()
        };
        assert_eq!(
            compute_overall(&healthy_workers(), &queues, 0),
            OverallState::Degraded
        );
    }

    #[test]
    fn test_overall_degraded_on_unhealthy_peer() {
        assert_eq!(
            compute_overall(&healthy_workers(), &QueueDepths::default(), 1),
            OverallState::Degraded
        );
    }

    #[test]
    fn test_overall_error_when_drainer_dead() {
        let mut workers = healthy_workers();
        workers.delete = false;
        assert_eq!(
            compute_overall(&workers, &QueueDepths::default(), 0),
            OverallState::Error
        );
    }

    #[test]
    fn test_dead_reconciler_is_not_an_error() {
        let mut workers = healthy_workers();
        workers.reconciler = false;
        workers.peer_sync = false;
        assert_eq!(
            compute_overall(&workers, &QueueDepths::default(), 0),
            OverallState::Ok
        );
    }
}
