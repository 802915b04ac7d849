//! Peer-sync worker: pulls zone data from sibling zonegate instances.
//!
//! Each node stores zone text after every successful backend write. When
//! the upstream pushes a zone while a node is offline, that node's copy
//! goes stale; this worker compares zone lists with every known peer and
//! re-applies anything the peer has newer, through the normal save queue,
//! with this node recorded as the owner of the re-application.
//!
//! Conflict resolution is last-writer-wins on `zone_updated_at`; equal
//! timestamps are a no-op, so two converged nodes exchange nothing.
//!
//! Mesh behaviour: every pass also asks each reachable peer for its peer
//! list (`/internal/peers`) and adopts unknown URLs, inheriting the
//! introducing peer's credentials (cluster nodes share the peer-realm
//! credential). A node never adds its own advertise URL. Discovered peers
//! are not persisted; the mesh is cheap to rediscover.

use crate::workers::WorkerContext;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use zonegate_common::{
    DomainRecord, PeerHealth, PeerZoneEntry, SaveItem, UpdateSource, PEER_FAILURE_THRESHOLD,
};

/// Per-call timeout for peer HTTP requests.
const PEER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Peer {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub type SharedPeers = Arc<RwLock<Vec<Peer>>>;
pub type SharedPeerHealth = Arc<RwLock<HashMap<String, PeerHealth>>>;

pub struct PeerSyncWorker {
    ctx: Arc<WorkerContext>,
    peers: SharedPeers,
    health: SharedPeerHealth,
    client: reqwest::Client,
    own_url: String,
}

/// Does the local row need the peer's version? Missing local data always
/// syncs; otherwise only a strictly newer peer timestamp does.
pub(crate) fn needs_sync(
    local: Option<&DomainRecord>,
    peer_ts: Option<DateTime<Utc>>,
) -> bool {
    let Some(local) = local else {
        return true;
    };
    if local.zone_data.is_none() {
        return true;
    }
    let Some(peer_ts) = peer_ts else {
        return false;
    };
    match local.zone_updated_at {
        None => true,
        Some(local_ts) => peer_ts > local_ts,
    }
}

/// Merge a peer's advertised URL list into ours. Returns the URLs actually
/// added. The node's own URL is never added to its own peer set.
pub(crate) fn merge_discovered(
    peers: &mut Vec<Peer>,
    own_url: &str,
    discovered: Vec<String>,
    username: Option<String>,
    password: Option<String>,
) -> Vec<String> {
    let mut added = Vec::new();
    for url in discovered {
        let url = url.trim().trim_end_matches('/').to_string();
        if url.is_empty() || url == own_url.trim_end_matches('/') {
            continue;
        }
        if peers.iter().any(|p| p.url.trim_end_matches('/') == url) {
            continue;
        }
        peers.push(Peer {
            url: url.clone(),
            username: username.clone(),
            password: password.clone(),
        });
        added.push(url);
    }
    added
}

/// Reset a peer's failure count; returns true when the peer had been
/// degraded and is now recovered.
pub(crate) fn record_success(health: &mut HashMap<String, PeerHealth>, url: &str) -> bool {
    let entry = health.entry(url.to_string()).or_default();
    let recovered = !entry.healthy();
    entry.consecutive_failures = 0;
    entry.last_seen = Some(Utc::now());
    recovered
}

/// Bump a peer's failure count; returns true when this failure crossed the
/// degraded threshold.
pub(crate) fn record_failure(health: &mut HashMap<String, PeerHealth>, url: &str) -> bool {
    let entry = health.entry(url.to_string()).or_default();
    entry.consecutive_failures += 1;
    entry.consecutive_failures == PEER_FAILURE_THRESHOLD
}

impl PeerSyncWorker {
    pub fn new(
        ctx: Arc<WorkerContext>,
        peers: SharedPeers,
        health: SharedPeerHealth,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PEER_HTTP_TIMEOUT)
            .build()?;
        let own_url = ctx.config.app.advertise_url.trim_end_matches('/').to_string();
        Ok(Self {
            ctx,
            peers,
            health,
            client,
            own_url,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let interval =
            Duration::from_secs(self.ctx.config.peer_sync.interval_minutes * 60);
        let peer_urls: Vec<String> = self
            .peers
            .read()
            .await
            .iter()
            .map(|p| p.url.clone())
            .collect();
        info!(
            interval_minutes = self.ctx.config.peer_sync.interval_minutes,
            peers = ?peer_urls,
            "Peer sync worker started — running initial sync now"
        );

        loop {
            self.sync_all().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Peer sync worker stopped");
    }

    pub async fn sync_all(&self) {
        // Snapshot: discovery may grow the peer set mid-pass.
        let snapshot: Vec<Peer> = self.peers.read().await.clone();
        debug!(peers = snapshot.len(), "Starting sync pass");

        for peer in snapshot {
            if peer.url.is_empty() {
                warn!("Peer config missing url — skipping");
                continue;
            }
            match self.sync_from_peer(&peer).await {
                Ok(()) => {
                    self.discover_peers_from(&peer).await;
                    let recovered =
                        record_success(&mut *self.health.write().await, &peer.url);
                    if recovered {
                        info!(peer = %peer.url, "Peer recovered");
                    }
                }
                Err(e) => {
                    let degraded = record_failure(&mut *self.health.write().await, &peer.url);
                    if degraded {
                        warn!(
                            peer = %peer.url,
                            threshold = PEER_FAILURE_THRESHOLD,
                            error = %e,
                            "Peer marked degraded after consecutive failures"
                        );
                    } else {
                        debug!(peer = %peer.url, error = %e, "Peer unreachable");
                    }
                }
            }
        }
    }

    fn peer_credentials<'a>(&'a self, peer: &'a Peer) -> (&'a str, &'a str) {
        (
            peer.username
                .as_deref()
                .unwrap_or(&self.ctx.config.peer_sync.auth_username),
            peer.password
                .as_deref()
                .unwrap_or(&self.ctx.config.peer_sync.auth_password),
        )
    }

    /// Fetch the peer's zone list and enqueue saves for everything newer
    /// than our local copy. The list response carries the full zone text, so
    /// no per-zone round-trip is needed.
    async fn sync_from_peer(&self, peer: &Peer) -> anyhow::Result<()> {
        let base = peer.url.trim_end_matches('/');
        let (username, password) = self.peer_credentials(peer);

        let response = self
            .client
            .get(format!("{base}/internal/zones"))
            .basic_auth(username, Some(password))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("/internal/zones returned {}", response.status());
        }
        let entries: Vec<PeerZoneEntry> = response.json().await?;
        if entries.is_empty() {
            debug!(peer = %base, "No zone data on peer yet");
            return Ok(());
        }

        let own_hostname = host_of(&self.own_url);
        let mut synced = 0usize;
        for entry in entries {
            let zone_name = zonegate_common::zone::canonical_zone_name(&entry.zone_name);
            if zone_name.is_empty() {
                continue;
            }
            let local = match self.ctx.store.get_domain(&zone_name).await {
                Ok(local) => local,
                Err(e) => {
                    warn!(zone = %zone_name, error = %e, "Store lookup failed during sync");
                    continue;
                }
            };
            if !needs_sync(local.as_ref(), entry.zone_updated_at) {
                continue;
            }
            let Some(zone_data) = entry.zone_data.filter(|d| !d.is_empty()) else {
                continue;
            };

            // Re-apply locally through the normal pipeline: this node is the
            // owner of the re-application, not the peer's upstream.
            match self.ctx.save_queue.push(&SaveItem {
                zone_name: zone_name.clone(),
                zone_data,
                upstream_hostname: own_hostname.clone(),
                upstream_username: entry.upstream_username.clone().unwrap_or_default(),
                target_backends: None,
                source: UpdateSource::PeerSync,
                zone_updated_at: entry.zone_updated_at,
            }) {
                Ok(()) => {
                    debug!(peer = %base, zone = %zone_name, "Queued newer zone from peer");
                    synced += 1;
                }
                Err(e) => warn!(zone = %zone_name, error = %e, "Could not queue peer zone"),
            }
        }

        if synced > 0 {
            info!(peer = %base, synced, "Synced zones from peer");
        } else {
            debug!(peer = %base, "Already up to date");
        }
        Ok(())
    }

    /// Gossip-lite mesh discovery. Best-effort: failures are swallowed so
    /// they never interrupt the main sync pass.
    async fn discover_peers_from(&self, peer: &Peer) {
        let base = peer.url.trim_end_matches('/');
        let (username, password) = self.peer_credentials(peer);

        let response = match self
            .client
            .get(format!("{base}/internal/peers"))
            .basic_auth(username, Some(password))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            _ => return,
        };
        let discovered: Vec<String> = match response.json().await {
            Ok(urls) => urls,
            Err(_) => return,
        };

        let added = merge_discovered(
            &mut *self.peers.write().await,
            &self.own_url,
            discovered,
            peer.username.clone(),
            peer.password.clone(),
        );
        for url in added {
            info!(discovered = %url, via = %base, "Discovered new peer");
        }
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default()
}
