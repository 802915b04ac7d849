//! Delete-queue drainer.
//!
//! Mirrors the save drainer: fan out the delete to every target backend,
//! verify absence, and remove the domain row only when every backend
//! reported success. Ownership was already checked at the ingress.

use super::retry::backoff_delay;
use super::WorkerContext;
use crate::dispatch;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use zonegate_common::{DeleteItem, RetryItem, RetryOp};

pub async fn run(ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<()>) {
    info!("Delete queue worker started");

    loop {
        let claimed = match ctx.delete_queue.claim(&mut shutdown).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Delete queue claim failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        process_item(&ctx, &claimed.item).await;
        if let Err(e) = ctx.delete_queue.commit(claimed) {
            error!(error = %e, "Delete queue commit failed");
        }
    }

    info!("Delete queue worker stopped");
}

async fn process_item(ctx: &WorkerContext, item: &DeleteItem) {
    let zone_name = zonegate_common::zone::canonical_zone_name(&item.zone_name);
    debug!(zone = %zone_name, "Processing delete");

    match ctx.store.get_domain(&zone_name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(zone = %zone_name, "Domain not found in store — skipping delete");
            return;
        }
        Err(e) => {
            error!(zone = %zone_name, error = %e, "Store lookup failed — skipping delete");
            return;
        }
    }

    let targets = match &item.target_backends {
        Some(set) => ctx.registry.subset(set),
        None => ctx.registry.enabled().clone(),
    };
    if targets.is_empty() {
        warn!(zone = %zone_name, "No active backends — zone will be removed from store only");
        if let Err(e) = ctx.store.delete_domain(&zone_name).await {
            error!(zone = %zone_name, error = %e, "Could not delete domain row");
        }
        return;
    }

    let report = dispatch::delete_fanout(&zone_name, &targets).await;

    if report.all_succeeded() {
        match ctx.store.delete_domain(&zone_name).await {
            Ok(()) => info!(zone = %zone_name, "Delete completed"),
            Err(e) => error!(zone = %zone_name, error = %e, "Could not delete domain row"),
        }
        return;
    }

    error!(
        zone = %zone_name,
        failed = ?report.failed,
        "Delete failed on one or more backends — store row retained"
    );
    let now = Utc::now();
    let retry = RetryItem {
        op: RetryOp::Delete {
            zone_name: zone_name.clone(),
            upstream_hostname: item.upstream_hostname.clone(),
        },
        pending_backends: report.failed.clone(),
        attempt: 1,
        not_before: now + backoff_delay(1),
        first_failure: now,
    };
    match ctx.retry_queue.push(&retry) {
        Ok(()) => warn!(
            zone = %zone_name,
            backends = ?report.failed,
            "Scheduled delete retry #1 in 30s"
        ),
        Err(e) => error!(zone = %zone_name, error = %e, "Could not enqueue delete retry"),
    }
}
