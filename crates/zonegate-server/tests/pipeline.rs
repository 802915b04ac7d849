//! End-to-end pipeline tests: ingress → queues → drainers → backends →
//! store, over the in-memory store and mock backends.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::{Duration as TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tower::util::ServiceExt;

use zonegate_server::auth::basic_auth_header;
use zonegate_server::backends::{Backend, BackendRegistry};
use zonegate_server::config::Config;
use zonegate_server::queue::DiskQueue;
use zonegate_server::store::{MemoryStore, ZoneStore};
use zonegate_server::test_helpers::{sample_zone, MockBackend};
use zonegate_server::workers::{retry, WorkerContext, WorkerManager};
use zonegate_server::{api, AppState};
use zonegate_common::{DomainRecord, SaveItem, UpdateSource};

struct Harness {
    state: AppState,
    ctx: Arc<WorkerContext>,
    shutdown_tx: watch::Sender<()>,
    _queue_dir: tempfile::TempDir,
}

impl Harness {
    /// Build a full AppState with running drainers over the given backends.
    fn new(backends: Vec<Arc<MockBackend>>) -> Self {
        let queue_dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::default());
        let store: Arc<dyn ZoneStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(BackendRegistry::from_backends(
            backends.into_iter().map(|b| b as Arc<dyn Backend>).collect(),
        ));
        let save_queue = Arc::new(DiskQueue::open(queue_dir.path().join("save")).unwrap());
        let delete_queue = Arc::new(DiskQueue::open(queue_dir.path().join("delete")).unwrap());
        let retry_queue = Arc::new(DiskQueue::open(queue_dir.path().join("retry")).unwrap());

        let ctx = Arc::new(WorkerContext {
            config: config.clone(),
            store: store.clone(),
            registry: registry.clone(),
            save_queue: save_queue.clone(),
            delete_queue: delete_queue.clone(),
            retry_queue: retry_queue.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let workers = Arc::new(WorkerManager::spawn_drainers(ctx.clone(), &shutdown_rx));

        let state = AppState {
            config,
            store,
            registry,
            save_queue,
            delete_queue,
            retry_queue,
            peers: Arc::new(RwLock::new(Vec::new())),
            peer_health: Arc::new(RwLock::new(HashMap::new())),
            reconciler_last_run: Arc::new(RwLock::new(None)),
            workers,
        };

        Self {
            state,
            ctx,
            shutdown_tx,
            _queue_dir: queue_dir,
        }
    }

    fn router(&self) -> axum::Router {
        api::router(self.state.clone())
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        self.state.workers.join_all().await;
    }
}

fn app_auth() -> String {
    let config = Config::default();
    basic_auth_header(&config.app.auth_username, &config.app.auth_password)
}

fn peer_auth() -> String {
    let config = Config::default();
    basic_auth_header(&config.peer_sync.auth_username, &config.peer_sync.auth_password)
}

fn push_request(domain: &str, hostname: &str) -> Request<Body> {
    let body = format!(
        "action=rawsave&domain={domain}&hostname={hostname}&username=admin&zone_file={}",
        urlencode(&sample_zone())
    );
    Request::builder()
        .method("POST")
        .uri("/CMD_API_DNS_ADMIN")
        .header(header::AUTHORIZATION, app_auth())
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

fn delete_request(domain: &str, hostname: &str) -> Request<Body> {
    let body = format!("action=delete&domain={domain}&hostname={hostname}");
    Request::builder()
        .method("POST")
        .uri("/CMD_API_DNS_ADMIN")
        .header(header::AUTHORIZATION, app_auth())
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Poll until the condition holds or a few seconds pass.
async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn test_push_reaches_every_backend_and_store() {
    let a = Arc::new(MockBackend::new("a"));
    let b = Arc::new(MockBackend::new("b"));
    let harness = Harness::new(vec![a.clone(), b.clone()]);

    let response = harness
        .router()
        .oneshot(push_request("Example.COM", "da1.example.net"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    wait_for(|| {
        let a = a.clone();
        let b = b.clone();
        async move { a.has_zone("example.com") && b.has_zone("example.com") }
    })
    .await;

    let row = harness
        .state
        .store
        .get_domain("example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        row.upstream_server_hostname.as_deref(),
        Some("da1.example.net")
    );
    assert!(row.zone_data.unwrap().contains("ns1.example.com"));
    assert!(row.zone_updated_at.is_some());
    assert!(harness.state.retry_queue.is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_partial_failure_upserts_row_and_schedules_retry() {
    let good = Arc::new(MockBackend::new("good"));
    let bad = Arc::new(MockBackend::new("bad"));
    bad.fail_writes(true);
    let harness = Harness::new(vec![good.clone(), bad.clone()]);

    let response = harness
        .router()
        .oneshot(push_request("example.com", "da1.example.net"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    wait_for(|| {
        let retry_queue = harness.state.retry_queue.clone();
        async move { !retry_queue.is_empty() }
    })
    .await;

    // Row upserted from the successful backend even though one failed.
    let row = harness
        .state
        .store
        .get_domain("example.com")
        .await
        .unwrap();
    assert!(row.is_some());
    assert!(good.has_zone("example.com"));

    // The retry item is scoped to the failed backend only, attempt 1,
    // not due for ~30 seconds.
    let claimed = harness.state.retry_queue.try_claim().unwrap().unwrap();
    assert_eq!(claimed.item.pending_backends, vec!["bad".to_string()]);
    assert_eq!(claimed.item.attempt, 1);
    assert!(claimed.item.not_before > Utc::now() + TimeDelta::seconds(20));

    // Recover the backend, force the item due, and drain.
    bad.fail_writes(false);
    let mut due = claimed.item.clone();
    due.not_before = Utc::now() - TimeDelta::seconds(1);
    harness.state.retry_queue.push(&due).unwrap();
    harness.state.retry_queue.commit(claimed).unwrap();

    retry::drain_once(&harness.ctx).await;
    assert!(harness.state.retry_queue.is_empty());
    assert!(bad.has_zone("example.com"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_ownership_transfer_and_delete_guard() {
    let backend = Arc::new(MockBackend::new("a"));
    let harness = Harness::new(vec![backend.clone()]);

    // Zone initially owned by da1.
    let response = harness
        .router()
        .oneshot(push_request("example.com", "da1.example.net"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    wait_for(|| {
        let store = harness.state.store.clone();
        async move { store.get_domain("example.com").await.unwrap().is_some() }
    })
    .await;

    // A push from da2 transfers ownership.
    let response = harness
        .router()
        .oneshot(push_request("example.com", "da2.example.net"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let row = harness
        .state
        .store
        .get_domain("example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        row.upstream_server_hostname.as_deref(),
        Some("da2.example.net")
    );

    // A later delete from the old owner is rejected and removes nothing.
    let response = harness
        .router()
        .oneshot(delete_request("example.com", "da1.example.net"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(backend.has_zone("example.com"));

    // The rightful owner can delete.
    let response = harness
        .router()
        .oneshot(delete_request("example.com", "da2.example.net"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    wait_for(|| {
        let backend = backend.clone();
        let store = harness.state.store.clone();
        async move {
            !backend.has_zone("example.com")
                && store.get_domain("example.com").await.unwrap().is_none()
        }
    })
    .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_auth_realms_are_distinct() {
    let harness = Harness::new(vec![Arc::new(MockBackend::new("a"))]);
    let router = harness.router();

    // No credentials at all.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Peer credentials do not open app-realm routes.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/status")
                .header(header::AUTHORIZATION, peer_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // App credentials do not open peer-realm routes.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/internal/zones")
                .header(header::AUTHORIZATION, app_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The right realm works.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/internal/zones")
                .header(header::AUTHORIZATION, peer_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_zone_is_rejected_not_queued() {
    let harness = Harness::new(vec![Arc::new(MockBackend::new("a"))]);

    let body = "action=rawsave&domain=example.com&hostname=da1&zone_file=%25%25garbage%25%25";
    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/CMD_API_DNS_ADMIN")
                .header(header::AUTHORIZATION, app_auth())
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(harness.state.save_queue.is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_internal_zones_carries_full_zone_data() {
    let harness = Harness::new(vec![Arc::new(MockBackend::new("a"))]);
    harness
        .state
        .store
        .upsert_zone(&DomainRecord {
            zone_name: "example.com".to_string(),
            upstream_server_hostname: Some("da1.example.net".to_string()),
            upstream_username: Some("admin".to_string()),
            managed_by: "directadmin".to_string(),
            zone_data: Some(sample_zone()),
            zone_updated_at: Some(Utc::now()),
        })
        .await
        .unwrap();

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri("/internal/zones")
                .header(header::AUTHORIZATION, peer_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["zone_name"], "example.com");
    assert!(entries[0]["zone_data"]
        .as_str()
        .unwrap()
        .contains("ns1.example.com"));

    // Detail endpoint returns the same zone; unknown zones 404.
    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri("/internal/zone?domain=example.com")
                .header(header::AUTHORIZATION, peer_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri("/internal/zone?domain=missing.example.com")
                .header(header::AUTHORIZATION, peer_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_status_degrades_on_dead_letters() {
    let harness = Harness::new(vec![Arc::new(MockBackend::new("a"))]);

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri("/status")
                .header(header::AUTHORIZATION, app_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(doc["status"], "ok");
    assert_eq!(doc["workers"]["save"], true);

    harness
        .state
        .store
        .insert_dead_letter(&zonegate_common::DeadLetter {
            id: 0,
            kind: zonegate_common::OperationKind::Write,
            zone_name: "example.com".to_string(),
            payload: None,
            backends: vec!["a".to_string()],
            cause: "write failed after 5 attempts".to_string(),
            first_failure: Utc::now(),
            last_failure: Utc::now(),
            attempts: 5,
        })
        .await
        .unwrap();

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri("/status")
                .header(header::AUTHORIZATION, app_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(doc["status"], "degraded");
    assert_eq!(doc["queues"]["dead_letters"], 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stale_peer_item_does_not_regress_newer_row() {
    // A peer item enqueued against an old snapshot drains after a newer
    // push has landed: it must neither rewrite the backends nor roll
    // zone_updated_at back (spec property P2).
    let backend = Arc::new(MockBackend::new("a"));
    let harness = Harness::new(vec![backend.clone()]);

    let fresh_ts = Utc::now();
    harness
        .state
        .store
        .upsert_zone(&DomainRecord {
            zone_name: "example.com".to_string(),
            upstream_server_hostname: Some("da1.example.net".to_string()),
            upstream_username: Some("admin".to_string()),
            managed_by: "directadmin".to_string(),
            zone_data: Some(sample_zone()),
            zone_updated_at: Some(fresh_ts),
        })
        .await
        .unwrap();

    harness
        .state
        .save_queue
        .push(&SaveItem {
            zone_name: "example.com".to_string(),
            zone_data: "$ORIGIN example.com.\n$TTL 300\n@ IN SOA ns1.example.com. hostmaster.example.com. 1 3600 900 604800 300\n".to_string(),
            upstream_hostname: "ns2.example.net".to_string(),
            upstream_username: String::new(),
            target_backends: None,
            source: UpdateSource::PeerSync,
            zone_updated_at: Some(fresh_ts - TimeDelta::seconds(60)),
        })
        .unwrap();

    wait_for(|| {
        let save_queue = harness.state.save_queue.clone();
        async move { save_queue.is_empty() }
    })
    .await;

    // The stale item was dropped before dispatch.
    assert!(!backend.has_zone("example.com"));
    let row = harness
        .state
        .store
        .get_domain("example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.zone_updated_at, Some(fresh_ts));
    assert_eq!(
        row.upstream_server_hostname.as_deref(),
        Some("da1.example.net")
    );
    assert_eq!(row.zone_data, Some(sample_zone()));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_peer_sync_item_applies_with_peer_timestamp() {
    // A save item carrying a peer's newer timestamp lands in the store with
    // that timestamp, so the next comparison is a no-op.
    let backend = Arc::new(MockBackend::new("a"));
    let harness = Harness::new(vec![backend.clone()]);

    let peer_ts = Utc::now() + TimeDelta::seconds(60);
    harness
        .state
        .save_queue
        .push(&SaveItem {
            zone_name: "example.com".to_string(),
            zone_data: sample_zone(),
            upstream_hostname: "ns1.example.net".to_string(),
            upstream_username: String::new(),
            target_backends: None,
            source: UpdateSource::PeerSync,
            zone_updated_at: Some(peer_ts),
        })
        .unwrap();

    wait_for(|| {
        let backend = backend.clone();
        async move { backend.has_zone("example.com") }
    })
    .await;
    let row = harness
        .state
        .store
        .get_domain("example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.zone_updated_at, Some(peer_ts));
    assert_eq!(
        row.upstream_server_hostname.as_deref(),
        Some("ns1.example.net")
    );

    harness.shutdown().await;
}
