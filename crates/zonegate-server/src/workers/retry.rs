//! Retry-queue drainer.
//!
//! Wakes on a short tick, re-attempts every eligible item against just the
//! backends still pending, and re-schedules or dead-letters the rest.
//! Eligibility is wall-clock (`not_before`), so retries are not FIFO-strict.

use super::WorkerContext;
use crate::dispatch;
use chrono::{Duration as TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use zonegate_common::{DeadLetter, DomainRecord, RetryItem, RetryOp};

/// Maximum attempts before an item is dead-lettered.
pub const MAX_RETRIES: u32 = 5;

/// Delay before each attempt: 30s, 2m, 5m, 15m, 30m.
const BACKOFF_SECONDS: [i64; 5] = [30, 120, 300, 900, 1800];

/// How often the drainer scans for eligible items.
const RETRY_TICK: Duration = Duration::from_secs(5);

/// Delay to apply before the given 1-based attempt number.
pub fn backoff_delay(attempt: u32) -> TimeDelta {
    let index = (attempt.max(1) as usize - 1).min(BACKOFF_SECONDS.len() - 1);
    TimeDelta::seconds(BACKOFF_SECONDS[index])
}

pub async fn run(ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<()>) {
    info!("Retry drain worker started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(RETRY_TICK) => {}
            _ = shutdown.changed() => break,
        }
        drain_once(&ctx).await;
    }

    info!("Retry drain worker stopped");
}

/// One drain pass: claim everything, re-queue the not-yet-due items, and
/// attempt the eligible ones.
pub async fn drain_once(ctx: &WorkerContext) {
    let mut pending = Vec::new();
    loop {
        match ctx.retry_queue.try_claim() {
            Ok(Some(claimed)) => pending.push(claimed),
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Retry queue claim failed");
                break;
            }
        }
    }
    if pending.is_empty() {
        return;
    }

    let now = Utc::now();
    let mut ready = 0u32;
    let mut deferred = 0u32;

    for claimed in pending {
        let item = claimed.item.clone();
        if item.not_before > now {
            // Not due yet: push a fresh copy before committing the claim so
            // a crash in between duplicates rather than loses the item.
            if let Err(e) = ctx.retry_queue.push(&item) {
                error!(error = %e, "Could not re-enqueue deferred retry item");
                continue;
            }
            if let Err(e) = ctx.retry_queue.commit(claimed) {
                error!(error = %e, "Retry queue commit failed");
            }
            deferred += 1;
            continue;
        }

        ready += 1;
        info!(
            zone = %item.op.zone_name(),
            backends = ?item.pending_backends,
            attempt = item.attempt,
            "Re-attempting failed backends"
        );
        attempt(ctx, item).await;
        if let Err(e) = ctx.retry_queue.commit(claimed) {
            error!(error = %e, "Retry queue commit failed");
        }
    }

    if ready > 0 {
        debug!(ready, deferred, "Retry drain pass complete");
    }
}

/// Run one attempt for an item: dispatch to the pending backends, drop the
/// ones that succeed, and either finish, re-schedule, or dead-letter.
async fn attempt(ctx: &WorkerContext, item: RetryItem) {
    let zone_name = item.op.zone_name().to_string();
    let targets = ctx.registry.subset(&item.pending_backends);

    // Backends removed from configuration since the failure have nothing
    // left to retry against.
    if targets.is_empty() {
        warn!(
            zone = %zone_name,
            backends = ?item.pending_backends,
            "Pending backends no longer registered — dropping retry item"
        );
        return;
    }

    let report = match &item.op {
        RetryOp::Write { zone_data, .. } => {
            dispatch::write_fanout(&zone_name, zone_data, &targets).await
        }
        RetryOp::Delete { .. } => dispatch::delete_fanout(&zone_name, &targets).await,
    };

    // A write that reached at least one backend must be reflected in the
    // store, even when the original attempt reached none.
    if !report.succeeded.is_empty() {
        if let RetryOp::Write {
            zone_data,
            upstream_hostname,
            upstream_username,
            ..
        } = &item.op
        {
            let record = DomainRecord {
                zone_name: zone_name.clone(),
                upstream_server_hostname: filter_empty(upstream_hostname),
                upstream_username: filter_empty(upstream_username),
                managed_by: ctx.config.app.managed_by.clone(),
                zone_data: Some(zone_data.clone()),
                zone_updated_at: Some(Utc::now()),
            };
            if let Err(e) = ctx.store.upsert_zone(&record).await {
                warn!(zone = %zone_name, error = %e, "Could not store zone_data on retry");
            }
        }
    }

    let remaining = report.failed;
    if remaining.is_empty() {
        if matches!(item.op, RetryOp::Delete { .. }) {
            if let Err(e) = ctx.store.delete_domain(&zone_name).await {
                warn!(zone = %zone_name, error = %e, "Could not delete domain row on retry");
            }
        }
        info!(
            zone = %zone_name,
            attempt = item.attempt,
            "Retry succeeded — all pending backends recovered"
        );
        return;
    }

    if item.attempt >= MAX_RETRIES {
        dead_letter(ctx, &item, remaining).await;
        return;
    }

    let next_attempt = item.attempt + 1;
    let delay = backoff_delay(next_attempt);
    let rescheduled = RetryItem {
        op: item.op,
        pending_backends: remaining.clone(),
        attempt: next_attempt,
        not_before: Utc::now() + delay,
        first_failure: item.first_failure,
    };
    match ctx.retry_queue.push(&rescheduled) {
        Ok(()) => warn!(
            zone = %zone_name,
            backends = ?remaining,
            attempt = next_attempt,
            delay_secs = delay.num_seconds(),
            "Retry re-scheduled"
        ),
        Err(e) => error!(zone = %zone_name, error = %e, "Could not re-enqueue retry item"),
    }
}

/// Attempt 5 failed: record the item for operator inspection and stop.
async fn dead_letter(ctx: &WorkerContext, item: &RetryItem, remaining: Vec<String>) {
    let zone_name = item.op.zone_name().to_string();
    let payload = match &item.op {
        RetryOp::Write { zone_data, .. } => Some(zone_data.clone()),
        RetryOp::Delete { .. } => None,
    };
    let letter = DeadLetter {
        id: 0,
        kind: item.op.kind(),
        zone_name: zone_name.clone(),
        payload,
        backends: remaining.clone(),
        cause: format!(
            "{} failed on {:?} after {} attempts",
            item.op.kind(),
            remaining,
            MAX_RETRIES
        ),
        first_failure: item.first_failure,
        last_failure: Utc::now(),
        attempts: MAX_RETRIES,
    };
    match ctx.store.insert_dead_letter(&letter).await {
        Ok(id) => error!(
            zone = %zone_name,
            backends = ?remaining,
            dead_letter_id = id,
            "Dead-letter: giving up after {MAX_RETRIES} attempts"
        ),
        Err(e) => error!(
            zone = %zone_name,
            error = %e,
            "Could not record dead letter"
        ),
    }
}

fn filter_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Backend, BackendRegistry};
    use crate::config::Config;
    use crate::queue::DiskQueue;
    use crate::store::{MemoryStore, ZoneStore};
    use crate::test_helpers::{sample_zone, MockBackend};

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1).num_seconds(), 30);
        assert_eq!(backoff_delay(2).num_seconds(), 120);
        assert_eq!(backoff_delay(3).num_seconds(), 300);
        assert_eq!(backoff_delay(4).num_seconds(), 900);
        assert_eq!(backoff_delay(5).num_seconds(), 1800);
        // Clamped past the table end.
        assert_eq!(backoff_delay(9).num_seconds(), 1800);
    }

    fn context(backends: Vec<Arc<MockBackend>>, dir: &std::path::Path) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            config: Arc::new(Config::default()),
            store: Arc::new(MemoryStore::new()),
            registry: Arc::new(BackendRegistry::from_backends(
                backends.into_iter().map(|b| b as Arc<dyn Backend>).collect(),
            )),
            save_queue: Arc::new(DiskQueue::open(dir.join("save")).unwrap()),
            delete_queue: Arc::new(DiskQueue::open(dir.join("delete")).unwrap()),
            retry_queue: Arc::new(DiskQueue::open(dir.join("retry")).unwrap()),
        })
    }

    fn write_item(attempt: u32, pending: &[&str], due: bool) -> RetryItem {
        let offset = if due {
            TimeDelta::seconds(-1)
        } else {
            TimeDelta::seconds(3600)
        };
        RetryItem {
            op: RetryOp::Write {
                zone_name: "example.com".to_string(),
                zone_data: sample_zone(),
                upstream_hostname: "da1.example.net".to_string(),
                upstream_username: "admin".to_string(),
            },
            pending_backends: pending.iter().map(|s| s.to_string()).collect(),
            attempt,
            not_before: Utc::now() + offset,
            first_failure: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_not_due_items_are_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new("a"));
        let ctx = context(vec![backend.clone()], dir.path());

        ctx.retry_queue.push(&write_item(1, &["a"], false)).unwrap();
        drain_once(&ctx).await;

        assert_eq!(ctx.retry_queue.len(), 1);
        assert_eq!(backend.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_successful_retry_drains_and_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new("a"));
        let ctx = context(vec![backend.clone()], dir.path());

        ctx.retry_queue.push(&write_item(2, &["a"], true)).unwrap();
        drain_once(&ctx).await;

        assert!(ctx.retry_queue.is_empty());
        assert!(backend.has_zone("example.com"));
        let row = ctx.store.get_domain("example.com").await.unwrap().unwrap();
        assert_eq!(row.zone_data, Some(sample_zone()));
    }

    #[tokio::test]
    async fn test_failed_retry_reschedules_with_next_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new("a"));
        backend.fail_writes(true);
        let ctx = context(vec![backend.clone()], dir.path());

        ctx.retry_queue.push(&write_item(1, &["a"], true)).unwrap();
        drain_once(&ctx).await;

        assert_eq!(ctx.retry_queue.len(), 1);
        let rescheduled = ctx.retry_queue.try_claim().unwrap().unwrap();
        assert_eq!(rescheduled.item.attempt, 2);
        assert!(rescheduled.item.not_before > Utc::now() + TimeDelta::seconds(100));
    }

    #[tokio::test]
    async fn test_fifth_failure_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new("a"));
        backend.fail_writes(true);
        let ctx = context(vec![backend.clone()], dir.path());

        ctx.retry_queue.push(&write_item(5, &["a"], true)).unwrap();
        drain_once(&ctx).await;

        assert!(ctx.retry_queue.is_empty());
        assert_eq!(ctx.store.count_dead_letters().await.unwrap(), 1);
        let letters = ctx.store.list_dead_letters().await.unwrap();
        assert_eq!(letters[0].attempts, 5);
        assert_eq!(letters[0].backends, vec!["a".to_string()]);
        assert_eq!(letters[0].zone_name, "example.com");
    }

    #[tokio::test]
    async fn test_partial_recovery_shrinks_pending_set() {
        let dir = tempfile::tempdir().unwrap();
        let good = Arc::new(MockBackend::new("good"));
        let bad = Arc::new(MockBackend::new("bad"));
        bad.fail_writes(true);
        let ctx = context(vec![good.clone(), bad.clone()], dir.path());

        ctx.retry_queue
            .push(&write_item(1, &["good", "bad"], true))
            .unwrap();
        drain_once(&ctx).await;

        let rescheduled = ctx.retry_queue.try_claim().unwrap().unwrap();
        assert_eq!(rescheduled.item.pending_backends, vec!["bad".to_string()]);
        assert!(good.has_zone("example.com"));
    }

    #[tokio::test]
    async fn test_delete_retry_removes_row_when_drained() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new("a"));
        let ctx = context(vec![backend.clone()], dir.path());

        ctx.store
            .upsert_zone(&DomainRecord {
                zone_name: "example.com".to_string(),
                upstream_server_hostname: Some("da1.example.net".to_string()),
                upstream_username: None,
                managed_by: "directadmin".to_string(),
                zone_data: Some(sample_zone()),
                zone_updated_at: Some(Utc::now()),
            })
            .await
            .unwrap();

        ctx.retry_queue
            .push(&RetryItem {
                op: RetryOp::Delete {
                    zone_name: "example.com".to_string(),
                    upstream_hostname: "da1.example.net".to_string(),
                },
                pending_backends: vec!["a".to_string()],
                attempt: 1,
                not_before: Utc::now() - TimeDelta::seconds(1),
                first_failure: Utc::now(),
            })
            .unwrap();
        drain_once(&ctx).await;

        assert!(ctx.retry_queue.is_empty());
        assert!(ctx.store.get_domain("example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_backend_drops_item() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(vec![], dir.path());

        ctx.retry_queue.push(&write_item(1, &["gone"], true)).unwrap();
        drain_once(&ctx).await;
        assert!(ctx.retry_queue.is_empty());
    }
}
