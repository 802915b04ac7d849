//! Save-queue drainer.
//!
//! Consumes the save queue in strict FIFO order. Per item: parse the zone
//! once for the reference record count, fan out to the target backends,
//! upsert the store row for any success, and schedule a retry scoped to the
//! backends that failed. The queue item is only committed after those
//! side-effects are durable.
//!
//! Consecutive items with no idle gap form a "batch" for telemetry; a batch
//! closes when the queue is observed empty.

use super::retry::backoff_delay;
use super::WorkerContext;
use crate::dispatch;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use zonegate_common::{DomainRecord, RetryItem, RetryOp, SaveItem};

pub async fn run(ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<()>) {
    info!("Save queue worker started");

    loop {
        let first = match ctx.save_queue.claim(&mut shutdown).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Save queue claim failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // Batch open: keep draining until the queue is empty, then log one
        // summary line for the whole run.
        let batch_start = Instant::now();
        let mut batch_processed = 0u64;
        let mut batch_failed = 0u64;
        debug!("Batch started");

        let mut claimed = Some(first);
        while let Some(current) = claimed.take() {
            if process_item(&ctx, &current.item).await {
                batch_processed += 1;
            } else {
                batch_failed += 1;
            }
            if let Err(e) = ctx.save_queue.commit(current) {
                error!(error = %e, "Save queue commit failed");
            }

            claimed = match ctx.save_queue.try_claim() {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "Save queue claim failed");
                    None
                }
            };
        }

        let elapsed = batch_start.elapsed().as_secs_f64();
        let total = batch_processed + batch_failed;
        let rate = if elapsed > 0.0 {
            batch_processed as f64 / elapsed
        } else {
            0.0
        };
        info!(
            processed = batch_processed,
            total,
            failed = batch_failed,
            elapsed_secs = format!("{elapsed:.1}"),
            zones_per_sec = format!("{rate:.1}"),
            "Batch complete"
        );
    }

    info!("Save queue worker stopped");
}

/// Process one save item. Returns true when every target backend succeeded.
async fn process_item(ctx: &WorkerContext, item: &SaveItem) -> bool {
    let zone_name = zonegate_common::zone::canonical_zone_name(&item.zone_name);
    debug!(
        zone = %zone_name,
        source = ?item.source,
        targets = ?item.target_backends,
        "Processing zone update"
    );

    // An item carrying its own timestamp (peer sync, healing) was decided
    // against a snapshot of the store. Re-check at drain time: if a newer
    // write landed in between, this item is stale and must not roll the
    // zone back.
    if let Some(item_ts) = item.zone_updated_at {
        match ctx.store.get_domain(&zone_name).await {
            Ok(Some(row)) => {
                if row.zone_updated_at.is_some_and(|row_ts| item_ts < row_ts) {
                    info!(
                        zone = %zone_name,
                        source = ?item.source,
                        "Skipping stale queued update — store already has a newer version"
                    );
                    return true;
                }
            }
            Ok(None) => {}
            Err(e) => {
                // The store-level upsert guard still protects the row.
                warn!(zone = %zone_name, error = %e, "Staleness check failed — proceeding");
            }
        }
    }

    let targets = match &item.target_backends {
        Some(set) => ctx.registry.subset(set),
        None => ctx.registry.enabled().clone(),
    };
    if targets.is_empty() {
        warn!(zone = %zone_name, "No target backends available for this item");
        return false;
    }

    let report = dispatch::write_fanout(&zone_name, &item.zone_data, &targets).await;

    if !report.succeeded.is_empty() {
        let record = DomainRecord {
            zone_name: zone_name.clone(),
            upstream_server_hostname: non_empty(&item.upstream_hostname),
            upstream_username: non_empty(&item.upstream_username),
            managed_by: ctx.config.app.managed_by.clone(),
            zone_data: Some(item.zone_data.clone()),
            zone_updated_at: Some(item.zone_updated_at.unwrap_or_else(Utc::now)),
        };
        if let Err(e) = ctx.store.upsert_zone(&record).await {
            warn!(zone = %zone_name, error = %e, "Could not store zone_data");
        }
    }

    if report.failed.is_empty() {
        debug!(zone = %zone_name, "Completed processing");
        return true;
    }

    schedule_retry(ctx, item, &zone_name, report.failed);
    false
}

/// Push a retry item scoped to the backends that failed, first attempt due
/// in 30 seconds.
fn schedule_retry(ctx: &WorkerContext, item: &SaveItem, zone_name: &str, failed: Vec<String>) {
    let now = Utc::now();
    let retry = RetryItem {
        op: RetryOp::Write {
            zone_name: zone_name.to_string(),
            zone_data: item.zone_data.clone(),
            upstream_hostname: item.upstream_hostname.clone(),
            upstream_username: item.upstream_username.clone(),
        },
        pending_backends: failed.clone(),
        attempt: 1,
        not_before: now + backoff_delay(1),
        first_failure: now,
    };
    match ctx.retry_queue.push(&retry) {
        Ok(()) => warn!(
            zone = %zone_name,
            backends = ?failed,
            "Scheduled retry #1 in 30s"
        ),
        Err(e) => error!(
            zone = %zone_name,
            error = %e,
            "Could not enqueue retry item — update will heal via reconciler"
        ),
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
