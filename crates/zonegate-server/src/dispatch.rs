//! Backend fan-out.
//!
//! The save, delete, and retry drainers all dispatch through here. One
//! enabled backend is called inline; two or more run concurrently, one task
//! per backend, and results are collected as they complete so a slow or
//! failing backend never blocks the others.

use crate::backends::Backend;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use zonegate_common::zone;

/// Per-backend outcome of one fan-out.
#[derive(Debug, Default, Clone)]
pub struct FanoutReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub elapsed_ms: u128,
}

impl FanoutReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Write a zone to every target backend and verify each one by record count
/// against the parsed reference text.
pub async fn write_fanout(
    zone_name: &str,
    zone_data: &str,
    targets: &BTreeMap<String, Arc<dyn Backend>>,
) -> FanoutReport {
    // The parsed count is the verification reference; the text was validated
    // at the ingress, so a parse failure here only disables verification for
    // this item.
    let expected = match zone::count_records(zone_data, zone_name) {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(
                zone = %zone_name,
                error = %e,
                "Could not parse source zone — skipping record count verification"
            );
            None
        }
    };

    let start = Instant::now();
    let mut report = FanoutReport::default();

    if targets.len() == 1 {
        // Single backend: call inline, no task overhead.
        for (name, backend) in targets {
            if write_one(backend.as_ref(), zone_name, zone_data, expected).await {
                report.succeeded.push(name.clone());
            } else {
                report.failed.push(name.clone());
            }
        }
    } else {
        let mut set = JoinSet::new();
        for (name, backend) in targets {
            let name = name.clone();
            let backend = backend.clone();
            let zone_name = zone_name.to_string();
            let zone_data = zone_data.to_string();
            set.spawn(async move {
                let ok = write_one(backend.as_ref(), &zone_name, &zone_data, expected).await;
                (name, ok)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, true)) => report.succeeded.push(name),
                Ok((name, false)) => report.failed.push(name),
                Err(e) => error!(zone = %zone_name, error = %e, "Backend write task panicked"),
            }
        }
    }

    report.elapsed_ms = start.elapsed().as_millis();
    debug!(
        zone = %zone_name,
        backends = targets.len(),
        elapsed_ms = report.elapsed_ms,
        failed = report.failed.len(),
        "Fan-out complete"
    );
    report.succeeded.sort();
    report.failed.sort();
    report
}

/// Delete a zone from every target backend and verify absence.
pub async fn delete_fanout(
    zone_name: &str,
    targets: &BTreeMap<String, Arc<dyn Backend>>,
) -> FanoutReport {
    let start = Instant::now();
    let mut report = FanoutReport::default();

    if targets.len() == 1 {
        for (name, backend) in targets {
            if delete_one(backend.as_ref(), zone_name).await {
                report.succeeded.push(name.clone());
            } else {
                report.failed.push(name.clone());
            }
        }
    } else {
        let mut set = JoinSet::new();
        for (name, backend) in targets {
            let name = name.clone();
            let backend = backend.clone();
            let zone_name = zone_name.to_string();
            set.spawn(async move {
                let ok = delete_one(backend.as_ref(), &zone_name).await;
                (name, ok)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, true)) => report.succeeded.push(name),
                Ok((name, false)) => report.failed.push(name),
                Err(e) => error!(zone = %zone_name, error = %e, "Backend delete task panicked"),
            }
        }
    }

    report.elapsed_ms = start.elapsed().as_millis();
    report.succeeded.sort();
    report.failed.sort();
    report
}

/// Write one backend and verify. A count mismatch triggers the driver's
/// reconcile; a mismatch that survives reconciliation is a backend failure.
async fn write_one(
    backend: &dyn Backend,
    zone_name: &str,
    zone_data: &str,
    expected: Option<usize>,
) -> bool {
    if let Err(e) = backend.write_zone(zone_name, zone_data).await {
        error!(backend = %backend.name(), zone = %zone_name, error = %e, "Zone write failed");
        return false;
    }
    debug!(backend = %backend.name(), zone = %zone_name, "Zone written");

    let Some(expected) = expected else {
        return true;
    };

    let actual = match backend.count_records(zone_name).await {
        Ok(count) => count,
        Err(e) => {
            error!(
                backend = %backend.name(),
                zone = %zone_name,
                error = %e,
                "Record count verification failed"
            );
            return false;
        }
    };
    if actual == expected {
        return true;
    }

    warn!(
        backend = %backend.name(),
        zone = %zone_name,
        expected,
        actual,
        "Record count mismatch — reconciling"
    );
    let removed = match backend.reconcile(zone_name, zone_data).await {
        Ok(removed) => removed,
        Err(e) => {
            error!(
                backend = %backend.name(),
                zone = %zone_name,
                error = %e,
                "Reconciliation failed"
            );
            return false;
        }
    };

    match backend.count_records(zone_name).await {
        Ok(count) if count == expected => {
            debug!(
                backend = %backend.name(),
                zone = %zone_name,
                removed,
                "Reconciliation restored record count"
            );
            true
        }
        Ok(count) => {
            error!(
                backend = %backend.name(),
                zone = %zone_name,
                expected,
                actual = count,
                removed,
                "Count still mismatched after reconciliation"
            );
            false
        }
        Err(e) => {
            error!(
                backend = %backend.name(),
                zone = %zone_name,
                error = %e,
                "Re-count after reconciliation failed"
            );
            false
        }
    }
}

/// Delete from one backend and verify the zone is gone.
async fn delete_one(backend: &dyn Backend, zone_name: &str) -> bool {
    if let Err(e) = backend.delete_zone(zone_name).await {
        error!(backend = %backend.name(), zone = %zone_name, error = %e, "Zone delete failed");
        return false;
    }
    match backend.zone_exists(zone_name).await {
        Ok(false) => {
            debug!(backend = %backend.name(), zone = %zone_name, "Zone deleted");
            true
        }
        Ok(true) => {
            error!(
                backend = %backend.name(),
                zone = %zone_name,
                "Zone still present after delete"
            );
            false
        }
        Err(e) => {
            error!(
                backend = %backend.name(),
                zone = %zone_name,
                error = %e,
                "Existence check after delete failed"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{sample_zone, MockBackend};

    fn targets(backends: Vec<Arc<MockBackend>>) -> BTreeMap<String, Arc<dyn Backend>> {
        backends
            .into_iter()
            .map(|b| (b.name().to_string(), b as Arc<dyn Backend>))
            .collect()
    }

    #[tokio::test]
    async fn test_single_backend_success() {
        let backend = Arc::new(MockBackend::new("a"));
        let report =
            write_fanout("example.com", &sample_zone(), &targets(vec![backend.clone()])).await;
        assert_eq!(report.succeeded, vec!["a".to_string()]);
        assert!(report.failed.is_empty());
        assert!(backend.has_zone("example.com"));
    }

    #[tokio::test]
    async fn test_parallel_partial_failure() {
        let good = Arc::new(MockBackend::new("good"));
        let bad = Arc::new(MockBackend::new("bad"));
        bad.fail_writes(true);

        let report = write_fanout(
            "example.com",
            &sample_zone(),
            &targets(vec![good.clone(), bad.clone()]),
        )
        .await;
        assert_eq!(report.succeeded, vec!["good".to_string()]);
        assert_eq!(report.failed, vec!["bad".to_string()]);
        assert!(good.has_zone("example.com"));
        assert!(!bad.has_zone("example.com"));
    }

    #[tokio::test]
    async fn test_count_mismatch_triggers_reconcile() {
        let backend = Arc::new(MockBackend::new("a"));
        backend.inject_extra_record("example.com");

        let report =
            write_fanout("example.com", &sample_zone(), &targets(vec![backend.clone()])).await;
        assert_eq!(report.succeeded, vec!["a".to_string()]);
        assert_eq!(backend.reconcile_calls(), 1);
    }

    #[tokio::test]
    async fn test_mismatch_after_reconcile_is_failure() {
        let backend = Arc::new(MockBackend::new("a"));
        backend.inject_extra_record("example.com");
        backend.fail_reconcile(true);

        let report = write_fanout("example.com", &sample_zone(), &targets(vec![backend])).await;
        assert_eq!(report.failed, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_fanout_verifies_absence() {
        let backend = Arc::new(MockBackend::new("a"));
        backend.put_zone("example.com", &sample_zone());

        let report = delete_fanout("example.com", &targets(vec![backend.clone()])).await;
        assert_eq!(report.succeeded, vec!["a".to_string()]);
        assert!(!backend.has_zone("example.com"));
    }

    #[tokio::test]
    async fn test_delete_failure_reported() {
        let backend = Arc::new(MockBackend::new("a"));
        backend.put_zone("example.com", &sample_zone());
        backend.fail_deletes(true);

        let report = delete_fanout("example.com", &targets(vec![backend])).await;
        assert_eq!(report.failed, vec!["a".to_string()]);
    }
}
