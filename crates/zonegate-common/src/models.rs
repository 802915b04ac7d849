use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default lifecycle tag for zones pushed by the upstream control panel.
pub const DEFAULT_MANAGED_BY: &str = "directadmin";

/// A zone tracked in the local datastore.
///
/// A row exists only after at least one backend write succeeded; `zone_data`
/// is the exact text the backends were most recently asked to serve.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DomainRecord {
    pub zone_name: String,
    /// The upstream server that currently owns this zone.
    pub upstream_server_hostname: Option<String>,
    /// Last-seen owning user on the upstream.
    pub upstream_username: Option<String>,
    pub managed_by: String,
    pub zone_data: Option<String>,
    pub zone_updated_at: Option<DateTime<Utc>>,
}

/// Operation kind recorded on retry items and dead letters.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Write,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Write => write!(f, "write"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A retry item that exhausted all attempts. Retained for operator
/// inspection, never auto-retried.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub kind: OperationKind,
    pub zone_name: String,
    /// The zone text for write operations; empty for deletes.
    pub payload: Option<String>,
    /// Backends that never succeeded.
    pub backends: Vec<String>,
    pub cause: String,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
    pub attempts: u32,
}

/// Where a save item came from. Healing and retry items carry an explicit
/// backend set and skip ownership bookkeeping at the ingress.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Push,
    ReconcilerHeal,
    PeerSync,
}

/// One entry on the save queue.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SaveItem {
    pub zone_name: String,
    pub zone_data: String,
    pub upstream_hostname: String,
    pub upstream_username: String,
    /// Explicit target set used by reconciler healing; `None` means all
    /// enabled backends.
    #[serde(default)]
    pub target_backends: Option<Vec<String>>,
    pub source: UpdateSource,
    /// Timestamp to record instead of "now". Set by peer sync so the local
    /// row adopts the peer's `zone_updated_at` and equal timestamps become
    /// a no-op on the next pass.
    #[serde(default)]
    pub zone_updated_at: Option<DateTime<Utc>>,
}

/// One entry on the delete queue. Ownership was already checked at the
/// ingress; the drainer does not re-check.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeleteItem {
    pub zone_name: String,
    /// The owner recorded at delete-issue time.
    pub upstream_hostname: String,
    #[serde(default)]
    pub target_backends: Option<Vec<String>>,
}

/// The operation a retry item re-attempts.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryOp {
    Write {
        zone_name: String,
        zone_data: String,
        upstream_hostname: String,
        upstream_username: String,
    },
    Delete {
        zone_name: String,
        upstream_hostname: String,
    },
}

impl RetryOp {
    pub fn zone_name(&self) -> &str {
        match self {
            RetryOp::Write { zone_name, .. } => zone_name,
            RetryOp::Delete { zone_name, .. } => zone_name,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            RetryOp::Write { .. } => OperationKind::Write,
            RetryOp::Delete { .. } => OperationKind::Delete,
        }
    }
}

/// One entry on the retry queue.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryItem {
    pub op: RetryOp,
    /// Backends still to retry. Shrinks as backends recover.
    pub pending_backends: Vec<String>,
    /// 1-based attempt number of the next attempt.
    pub attempt: u32,
    /// Earliest wall-clock time this item is eligible.
    pub not_before: DateTime<Utc>,
    pub first_failure: DateTime<Utc>,
}

/// Zone entry exchanged between peers over `/internal/zones`.
///
/// The list response carries the full `zone_data` so a sync pass needs no
/// second round-trip per zone.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeerZoneEntry {
    pub zone_name: String,
    pub zone_data: Option<String>,
    pub zone_updated_at: Option<DateTime<Utc>>,
    pub upstream_hostname: Option<String>,
    pub upstream_username: Option<String>,
}

/// Per-peer health, tracked in memory only.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PeerHealth {
    pub consecutive_failures: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Consecutive failures before a peer is reported degraded.
pub const PEER_FAILURE_THRESHOLD: u32 = 3;

impl PeerHealth {
    pub fn healthy(&self) -> bool {
        self.consecutive_failures < PEER_FAILURE_THRESHOLD
    }
}

/// Counters from the most recent reconciliation pass, surfaced via `/status`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconcilerRun {
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub upstreams_polled: u32,
    pub upstreams_unreachable: u32,
    pub zones_in_upstream: u64,
    pub zones_in_store: u64,
    pub orphans_found: u64,
    pub orphans_queued: u64,
    pub hostnames_backfilled: u64,
    pub hostnames_migrated: u64,
    pub zones_healed: u64,
    pub dry_run: bool,
}

/// Queue depths in the `/status` document.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct QueueDepths {
    pub save: u64,
    pub delete: u64,
    pub retry: u64,
    pub dead_letters: u64,
}

/// Worker liveness flags in the `/status` document.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct WorkerLiveness {
    pub save: bool,
    pub delete: bool,
    pub retry_drain: bool,
    pub reconciler: bool,
    pub peer_sync: bool,
}

/// One peer's health entry in the `/status` document.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeerStatusEntry {
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Peer-sync summary in the `/status` document.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PeerSyncStatus {
    pub enabled: bool,
    pub alive: bool,
    pub interval_minutes: u64,
    pub peers: Vec<PeerStatusEntry>,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
}

/// Reconciler summary in the `/status` document.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ReconcilerStatus {
    pub enabled: bool,
    pub alive: bool,
    pub dry_run: bool,
    pub interval_minutes: u64,
    pub last_run: Option<ReconcilerRun>,
}

/// Overall state reported by `/status`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    Ok,
    Degraded,
    Error,
}

/// The composite health/telemetry document served at `/status`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatusDocument {
    pub status: OverallState,
    pub queues: QueueDepths,
    pub workers: WorkerLiveness,
    pub reconciler: ReconcilerStatus,
    pub peer_sync: PeerSyncStatus,
    pub zones: ZoneCount,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ZoneCount {
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_health_threshold() {
        let mut health = PeerHealth::default();
        assert!(health.healthy());

        health.consecutive_failures = 2;
        assert!(health.healthy());

        health.consecutive_failures = 3;
        assert!(!health.healthy());
    }

    #[test]
    fn test_retry_op_accessors() {
        let op = RetryOp::Write {
            zone_name: "example.com".to_string(),
            zone_data: String::new(),
            upstream_hostname: "da1.example.net".to_string(),
            upstream_username: "admin".to_string(),
        };
        assert_eq!(op.zone_name(), "example.com");
        assert_eq!(op.kind(), OperationKind::Write);

        let op = RetryOp::Delete {
            zone_name: "example.org".to_string(),
            upstream_hostname: "da1.example.net".to_string(),
        };
        assert_eq!(op.kind(), OperationKind::Delete);
    }

    #[test]
    fn test_retry_item_round_trips_through_json() {
        let item = RetryItem {
            op: RetryOp::Delete {
                zone_name: "example.com".to_string(),
                upstream_hostname: "da1.example.net".to_string(),
            },
            pending_backends: vec!["nsd".to_string()],
            attempt: 3,
            not_before: Utc::now(),
            first_failure: Utc::now(),
        };
        let json = serde_json::to_string(&item).unwrap();
        let back: RetryItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempt, 3);
        assert_eq!(back.pending_backends, vec!["nsd".to_string()]);
        assert!(matches!(back.op, RetryOp::Delete { .. }));
    }

    #[test]
    fn test_save_item_defaults_optional_fields() {
        let json = r#"{
            "zone_name": "example.com",
            "zone_data": "",
            "upstream_hostname": "da1",
            "upstream_username": "admin",
            "source": "push"
        }"#;
        let item: SaveItem = serde_json::from_str(json).unwrap();
        assert!(item.target_backends.is_none());
        assert!(item.zone_updated_at.is_none());
    }
}
