//! Internal datastore for zonegate.
//!
//! This module provides the `ZoneStore` trait and its implementations:
//! - `SqliteStore` - single-file embedded database (the default)
//! - `MysqlStore` - shared remote database for multi-process deployments
//! - `MemoryStore` - in-memory storage for testing
//!
//! The store holds the `domains` table (one row per zone that has been
//! successfully written to at least one backend) and the `dead_letters`
//! table. It is the only state mutated by more than one worker; every
//! operation is a single transaction.

mod memory;
mod mysql;
mod sqlite;

pub use memory::MemoryStore;
pub use mysql::MysqlStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use zonegate_common::{DeadLetter, DomainRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Datastore trait backing the write pipeline, the reconciler, and peer
/// sync. Object-safe; used as `Arc<dyn ZoneStore>`.
#[async_trait]
pub trait ZoneStore: Send + Sync {
    /// Fetch one zone row by canonical zone name.
    async fn get_domain(&self, zone_name: &str) -> Result<Option<DomainRecord>>;

    /// All zone rows.
    async fn list_domains(&self) -> Result<Vec<DomainRecord>>;

    /// Zone rows that have stored zone text (the healing pass input and the
    /// peer exchange payload).
    async fn list_domains_with_zone_data(&self) -> Result<Vec<DomainRecord>>;

    /// Create or replace a zone row after a successful backend write.
    ///
    /// `zone_updated_at` is monotonic per zone: a record whose timestamp is
    /// older than the stored one is dropped whole, so the row's text and
    /// ownership never drift apart from its timestamp.
    async fn upsert_zone(&self, record: &DomainRecord) -> Result<()>;

    /// Rewrite the ownership columns of an existing row, leaving zone data
    /// untouched. No-op when the row is absent.
    async fn update_ownership(
        &self,
        zone_name: &str,
        hostname: &str,
        username: &str,
    ) -> Result<()>;

    /// Remove a zone row after a successful delete from every backend.
    async fn delete_domain(&self, zone_name: &str) -> Result<()>;

    async fn count_domains(&self) -> Result<u64>;

    /// Record an exhausted retry item. Returns the assigned id.
    async fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> Result<i64>;

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;

    async fn count_dead_letters(&self) -> Result<u64>;
}

/// Render a timestamp the way both SQL stores persist it.
///
/// Fixed-width RFC 3339 with nanoseconds and a `Z` suffix, so that
/// lexicographic order over the stored text is chronological order. The
/// SQLite upsert guard compares these strings directly.
pub(crate) fn format_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
}

/// Monotonicity guard for `upsert_zone`: a row carrying a timestamp older
/// than the stored one must not be applied, or `zone_updated_at` would
/// regress when a stale queued item drains after a newer write.
pub(crate) fn should_apply(
    incoming: Option<DateTime<Utc>>,
    current: Option<DateTime<Utc>>,
) -> bool {
    match (incoming, current) {
        (Some(new), Some(old)) => new >= old,
        _ => true,
    }
}

/// Parse a stored timestamp; unparseable legacy values read back as `None`.
pub(crate) fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    })
}

/// Serialize the dead-letter backend list for storage.
pub(crate) fn encode_backends(backends: &[String]) -> String {
    serde_json::to_string(backends).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn decode_backends(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ts_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let encoded = format_ts(Some(ts)).unwrap();
        assert_eq!(parse_ts(Some(encoded)), Some(ts));
    }

    #[test]
    fn test_parse_ts_tolerates_garbage() {
        assert_eq!(parse_ts(Some("not a timestamp".to_string())), None);
        assert_eq!(parse_ts(None), None);
    }

    #[test]
    fn test_backend_list_round_trip() {
        let backends = vec!["nsd".to_string(), "coredns".to_string()];
        assert_eq!(decode_backends(&encode_backends(&backends)), backends);
        assert!(decode_backends("garbage").is_empty());
    }

    #[test]
    fn test_format_ts_is_fixed_width_and_text_ordered() {
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let later = earlier + chrono::Duration::nanoseconds(1);
        let a = format_ts(Some(earlier)).unwrap();
        let b = format_ts(Some(later)).unwrap();
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert!(a.ends_with('Z'));
    }

    #[test]
    fn test_should_apply_guards_regressions() {
        let now = Utc::now();
        let older = now - chrono::Duration::seconds(60);

        assert!(should_apply(Some(now), Some(older)));
        assert!(should_apply(Some(now), Some(now)));
        assert!(!should_apply(Some(older), Some(now)));

        // Missing timestamps never block a write.
        assert!(should_apply(None, Some(now)));
        assert!(should_apply(Some(now), None));
        assert!(should_apply(None, None));
    }
}
