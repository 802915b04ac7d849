//! Reconciliation worker.
//!
//! Two passes per cycle, on a configurable interval:
//!
//! 1. Orphan detection and backfill: poll every configured upstream for
//!    the authoritative zone list, backfill or migrate recorded owners, and
//!    queue deletes for zones the owning upstream no longer lists.
//! 2. Backend healing: re-push any stored zone that a backend is missing,
//!    scoped to just the missing backends.
//!
//! Safety rules:
//! - An unreachable upstream is skipped entirely; no deletes are queued
//!   from a partial listing.
//! - Only zones in our own store are touched; foreign zones in a backend
//!   are left alone.
//! - Deletes go through the delete queue so the full delete path runs.
//! - Dry-run mode logs orphans and healing candidates without queueing.

use crate::upstream::UpstreamClient;
use crate::workers::WorkerContext;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use zonegate_common::{DeleteItem, DomainRecord, ReconcilerRun, SaveItem, UpdateSource};

pub type SharedLastRun = Arc<RwLock<Option<ReconcilerRun>>>;

pub struct Reconciler {
    ctx: Arc<WorkerContext>,
    last_run: SharedLastRun,
}

/// What pass 1 decided, computed separately from the side-effects so the
/// decision logic is testable on its own.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ReconcilePlan {
    /// (zone, new owner) for rows with no recorded owner.
    pub backfills: Vec<(String, String)>,
    /// (zone, old owner, new owner) for rows whose owner moved.
    pub migrations: Vec<(String, String, String)>,
    /// (zone, recorded owner) for rows the owning upstream stopped listing.
    pub orphans: Vec<(String, String)>,
}

/// Compare the local rows against the merged upstream listing.
///
/// A row counts as an orphan only when its recorded owner is a configured
/// upstream that was successfully polled this cycle; an unreachable
/// upstream must never cause deletes.
pub(crate) fn plan_reconciliation(
    rows: &[DomainRecord],
    upstream_zones: &HashMap<String, String>,
    reachable: &HashSet<String>,
    configured: &HashSet<String>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    for row in rows {
        let recorded = row.upstream_server_hostname.as_deref().unwrap_or("");
        match upstream_zones.get(&row.zone_name) {
            Some(actual) => {
                if recorded.is_empty() {
                    plan.backfills.push((row.zone_name.clone(), actual.clone()));
                } else if recorded != actual {
                    plan.migrations.push((
                        row.zone_name.clone(),
                        recorded.to_string(),
                        actual.clone(),
                    ));
                }
            }
            None => {
                if configured.contains(recorded) && reachable.contains(recorded) {
                    plan.orphans.push((row.zone_name.clone(), recorded.to_string()));
                }
            }
        }
    }
    plan
}

impl Reconciler {
    pub fn new(ctx: Arc<WorkerContext>, last_run: SharedLastRun) -> Self {
        Self { ctx, last_run }
    }

    /// Worker loop. Sleeps are interruptible by the shutdown signal.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let config = &self.ctx.config.reconciliation;
        let interval = Duration::from_secs(config.interval_minutes * 60);
        let initial_delay = Duration::from_secs(config.initial_delay_minutes * 60);
        let mode = if config.dry_run { "DRY-RUN" } else { "LIVE" };
        info!(
            mode,
            interval_minutes = config.interval_minutes,
            initial_delay_minutes = config.initial_delay_minutes,
            servers = ?config.upstream_servers.iter().map(|s| s.hostname.as_str()).collect::<Vec<_>>(),
            "Reconciliation worker started"
        );
        if config.dry_run {
            warn!("Reconciler dry-run active — orphans will be logged but NOT queued for deletion");
        }

        if !initial_delay.is_zero() {
            info!(
                delay_minutes = config.initial_delay_minutes,
                "Initial delay — first reconciliation pass deferred"
            );
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = shutdown.changed() => {
                    info!("Reconciliation worker stopped");
                    return;
                }
            }
        }

        loop {
            self.reconcile_all().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Reconciliation worker stopped");
    }

    pub async fn reconcile_all(&self) {
        let config = &self.ctx.config.reconciliation;
        let started_at = Utc::now();
        let timer = Instant::now();

        let mut run = ReconcilerRun {
            status: "running".to_string(),
            started_at,
            completed_at: None,
            duration_seconds: 0.0,
            upstreams_polled: 0,
            upstreams_unreachable: 0,
            zones_in_upstream: 0,
            zones_in_store: 0,
            orphans_found: 0,
            orphans_queued: 0,
            hostnames_backfilled: 0,
            hostnames_migrated: 0,
            zones_healed: 0,
            dry_run: config.dry_run,
        };
        *self.last_run.write().await = Some(run.clone());
        info!(
            servers = config.upstream_servers.len(),
            "Starting reconciliation pass"
        );

        // Pass 1: merge zone listings from every reachable upstream.
        let mut upstream_zones: HashMap<String, String> = HashMap::new();
        let mut reachable: HashSet<String> = HashSet::new();

        for server in &config.upstream_servers {
            if server.hostname.is_empty() {
                warn!("Upstream server config missing hostname — skipping");
                continue;
            }
            run.upstreams_polled += 1;
            let client = match UpstreamClient::from_server_config(server, config.verify_ssl) {
                Ok(client) => client,
                Err(e) => {
                    run.upstreams_unreachable += 1;
                    error!(upstream = %server.hostname, error = %e, "Upstream client build failed");
                    continue;
                }
            };
            match client.list_domains(config.ipp).await {
                Ok(domains) => {
                    debug!(
                        upstream = %server.hostname,
                        domains = domains.len(),
                        "Upstream listing fetched"
                    );
                    reachable.insert(server.hostname.clone());
                    for domain in domains {
                        upstream_zones.insert(domain, server.hostname.clone());
                    }
                }
                Err(e) => {
                    run.upstreams_unreachable += 1;
                    error!(upstream = %server.hostname, error = %e, "Upstream poll failed — skipping");
                }
            }
        }
        run.zones_in_upstream = upstream_zones.len() as u64;

        let rows = match self.ctx.store.list_domains().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Could not list local domains — aborting pass");
                run.status = "error".to_string();
                run.completed_at = Some(Utc::now());
                run.duration_seconds = timer.elapsed().as_secs_f64();
                *self.last_run.write().await = Some(run);
                return;
            }
        };
        run.zones_in_store = rows.len() as u64;

        let configured: HashSet<String> = config
            .upstream_servers
            .iter()
            .map(|s| s.hostname.clone())
            .collect();
        let plan = plan_reconciliation(&rows, &upstream_zones, &reachable, &configured);
        let usernames: HashMap<&str, &str> = rows
            .iter()
            .map(|r| {
                (
                    r.zone_name.as_str(),
                    r.upstream_username.as_deref().unwrap_or(""),
                )
            })
            .collect();

        for (zone, owner) in &plan.backfills {
            info!(zone = %zone, owner = %owner, "Owner hostname backfilled");
            let username = usernames.get(zone.as_str()).copied().unwrap_or("");
            if let Err(e) = self.ctx.store.update_ownership(zone, owner, username).await {
                error!(zone = %zone, error = %e, "Backfill failed");
            } else {
                run.hostnames_backfilled += 1;
            }
        }
        for (zone, from, to) in &plan.migrations {
            warn!(zone = %zone, from = %from, to = %to, "[migration] Zone moved to new upstream — updating store");
            let username = usernames.get(zone.as_str()).copied().unwrap_or("");
            if let Err(e) = self.ctx.store.update_ownership(zone, to, username).await {
                error!(zone = %zone, error = %e, "Migration update failed");
            } else {
                run.hostnames_migrated += 1;
            }
        }

        run.orphans_found = plan.orphans.len() as u64;
        for (zone, owner) in &plan.orphans {
            if config.dry_run {
                warn!(zone = %zone, owner = %owner, "[DRY-RUN] Would delete orphan");
                continue;
            }
            match self.ctx.delete_queue.push(&DeleteItem {
                zone_name: zone.clone(),
                upstream_hostname: owner.clone(),
                target_backends: None,
            }) {
                Ok(()) => {
                    debug!(zone = %zone, owner = %owner, "Queued delete for orphan");
                    run.orphans_queued += 1;
                }
                Err(e) => error!(zone = %zone, error = %e, "Could not queue orphan delete"),
            }
        }

        if config.dry_run {
            info!(
                orphans = run.orphans_found,
                "Reconciliation pass complete [DRY-RUN] — nothing queued"
            );
        } else {
            info!(
                orphans_queued = run.orphans_queued,
                backfilled = run.hostnames_backfilled,
                migrated = run.hostnames_migrated,
                "Reconciliation pass complete"
            );
        }

        // Pass 2: heal backends that are missing stored zones.
        run.zones_healed = self.heal_backends(&rows).await;

        run.status = "ok".to_string();
        run.completed_at = Some(Utc::now());
        run.duration_seconds = timer.elapsed().as_secs_f64();
        *self.last_run.write().await = Some(run);
    }

    /// Check every enabled backend for presence of every stored zone and
    /// re-queue saves scoped to the backends that are missing one. The
    /// stored `zone_data` is the authoritative source; backends that
    /// already have the zone are not rewritten.
    async fn heal_backends(&self, rows: &[DomainRecord]) -> u64 {
        let backends = self.ctx.registry.enabled();
        if backends.is_empty() {
            return 0;
        }
        let dry_run = self.ctx.config.reconciliation.dry_run;
        let mut healed = 0u64;
        let mut any_with_data = false;

        for row in rows {
            let Some(zone_data) = row.zone_data.as_deref().filter(|d| !d.is_empty()) else {
                continue;
            };
            any_with_data = true;

            let mut missing = Vec::new();
            for (name, backend) in backends {
                match backend.zone_exists(&row.zone_name).await {
                    Ok(true) => {}
                    Ok(false) => missing.push(name.clone()),
                    Err(e) => {
                        // Driver errors are logged and skipped, never fatal.
                        warn!(
                            zone = %row.zone_name,
                            backend = %name,
                            error = %e,
                            "Healing existence check failed — skipping backend"
                        );
                    }
                }
            }
            if missing.is_empty() {
                continue;
            }

            if dry_run {
                warn!(
                    zone = %row.zone_name,
                    missing = ?missing,
                    "[DRY-RUN] Would heal — zone missing from backends"
                );
                continue;
            }
            warn!(
                zone = %row.zone_name,
                missing = ?missing,
                "Healing — re-queuing with stored zone_data"
            );
            match self.ctx.save_queue.push(&SaveItem {
                zone_name: row.zone_name.clone(),
                zone_data: zone_data.to_string(),
                upstream_hostname: row.upstream_server_hostname.clone().unwrap_or_default(),
                upstream_username: row.upstream_username.clone().unwrap_or_default(),
                target_backends: Some(missing),
                source: UpdateSource::ReconcilerHeal,
                // Keep the stored timestamp: healing restores content, it
                // does not make the zone newer.
                zone_updated_at: row.zone_updated_at,
            }) {
                Ok(()) => healed += 1,
                Err(e) => error!(zone = %row.zone_name, error = %e, "Could not queue healing save"),
            }
        }

        if !any_with_data {
            debug!("Healing pass: no zone_data stored yet — skipping");
        } else if healed > 0 {
            info!(healed, "Healing pass complete — zones re-queued for backend recovery");
        } else {
            debug!("Healing pass complete — all backends consistent");
        }
        healed
    }
}
