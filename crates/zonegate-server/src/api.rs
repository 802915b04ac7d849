//! HTTP surface.
//!
//! Two route groups behind distinct basic-auth realms:
//! - app realm: the upstream-facing `CMD_API_DNS_ADMIN` endpoint (push,
//!   delete, existence checks, connectivity probe), `CMD_API_LOGIN_TEST`,
//!   `/status`, and `/health`
//! - peer realm: `/internal/zones`, `/internal/zone`, `/internal/peers`
//!
//! The admin endpoint speaks the upstream's own wire format: form-encoded
//! request parameters (zone text in `zone_file`, or the raw body as a
//! fallback) and URL-encoded `error=<n>&text=...` responses.
//!
//! Ingress policy is "durable-accept, repair-later": only auth, malformed
//! bodies, and ownership violations are rejected; everything else is queued
//! and healed by the workers.

use crate::auth;
use crate::status::build_status;
use crate::AppState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use zonegate_common::zone::{canonical_zone_name, normalize_zone};
use zonegate_common::{DeleteItem, PeerZoneEntry, SaveItem, UpdateSource};

pub fn router(state: AppState) -> Router {
    let app_routes = Router::new()
        .route("/CMD_API_DNS_ADMIN", get(dns_admin_get).post(dns_admin_post))
        .route("/CMD_API_LOGIN_TEST", get(login_test).post(login_test))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_app_auth,
        ));

    let peer_routes = Router::new()
        .route("/internal/zones", get(internal_zones))
        .route("/internal/zone", get(internal_zone))
        .route("/internal/peers", get(internal_peers))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_peer_auth,
        ));

    Router::new()
        .merge(app_routes)
        .merge(peer_routes)
        .with_state(state)
}

/// URL-encoded response in the upstream's own format.
fn da_response(status: StatusCode, pairs: &[(&str, &str)]) -> Response {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    (status, serializer.finish()).into_response()
}

fn da_ok() -> Response {
    da_response(StatusCode::OK, &[("error", "0")])
}

fn da_ok_text(text: &str) -> Response {
    da_response(StatusCode::OK, &[("error", "0"), ("text", text)])
}

fn da_error(status: StatusCode, text: &str) -> Response {
    da_response(status, &[("error", "1"), ("text", text)])
}

async fn login_test() -> Response {
    da_ok_text("Login OK")
}

/// POST: zone push or delete, discriminated by the `action` parameter.
async fn dns_admin_post(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Parameters arrive in the query string and/or the body; body wins.
    let mut params = query;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.contains("application/x-www-form-urlencoded") {
        for (key, value) in url::form_urlencoded::parse(&body) {
            params.insert(key.into_owned(), value.into_owned());
        }
    } else if content_type.contains("text/plain") && !body.is_empty() {
        params.insert(
            "zone_file".to_string(),
            String::from_utf8_lossy(&body).into_owned(),
        );
    }
    // The upstream sometimes ships the zone text as the bare body.
    if !params.contains_key("zone_file") && !body.is_empty() {
        params.insert(
            "zone_file".to_string(),
            String::from_utf8_lossy(&body).into_owned(),
        );
    }

    let Some(action) = params.get("action").cloned() else {
        // An initial request without an action parameter is the upstream's
        // connectivity check.
        debug!("Received request with no action — connectivity check");
        return da_ok_text("OK");
    };
    let Some(domain) = params.get("domain").cloned() else {
        return da_error(StatusCode::BAD_REQUEST, "Missing 'domain' parameter");
    };

    match action.as_str() {
        "rawsave" => handle_rawsave(&state, &domain, &params).await,
        "delete" => handle_delete(&state, &domain, &params).await,
        other => da_error(
            StatusCode::BAD_REQUEST,
            &format!("Unsupported action: {other}"),
        ),
    }
}

async fn handle_rawsave(
    state: &AppState,
    domain: &str,
    params: &HashMap<String, String>,
) -> Response {
    let zone_name = canonical_zone_name(domain);
    let Some(zone_data) = params.get("zone_file").filter(|z| !z.trim().is_empty()) else {
        return da_error(StatusCode::BAD_REQUEST, "Missing zone file content");
    };

    let normalized = match normalize_zone(zone_data, &zone_name) {
        Ok(normalized) => normalized,
        Err(e) => {
            error!(zone = %zone_name, error = %e, "Zone validation failed");
            return da_error(StatusCode::BAD_REQUEST, &format!("Invalid zone data: {e}"));
        }
    };
    info!(zone = %zone_name, "Validated zone");

    let hostname = params.get("hostname").cloned().unwrap_or_default();
    let username = params.get("username").cloned().unwrap_or_default();

    // Ownership transfer: a push from a different upstream rewrites the
    // recorded owner in place.
    match state.store.get_domain(&zone_name).await {
        Ok(Some(row)) => {
            let recorded = row.upstream_server_hostname.as_deref().unwrap_or("");
            if !hostname.is_empty() && recorded != hostname {
                warn!(
                    zone = %zone_name,
                    from = %recorded,
                    to = %hostname,
                    "[migration] Push from new upstream — transferring ownership"
                );
                if let Err(e) = state
                    .store
                    .update_ownership(&zone_name, &hostname, &username)
                    .await
                {
                    error!(zone = %zone_name, error = %e, "Ownership transfer failed");
                    return da_error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!(zone = %zone_name, error = %e, "Store lookup failed");
            return da_error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
        }
    }

    let item = SaveItem {
        zone_name: zone_name.clone(),
        zone_data: normalized,
        upstream_hostname: hostname,
        upstream_username: username,
        target_backends: None,
        source: UpdateSource::Push,
        zone_updated_at: None,
    };
    if let Err(e) = state.save_queue.push(&item) {
        error!(zone = %zone_name, error = %e, "Could not enqueue zone update");
        return da_error(StatusCode::INTERNAL_SERVER_ERROR, "queue failure");
    }

    info!(zone = %zone_name, "Queued zone update");
    da_ok()
}

async fn handle_delete(
    state: &AppState,
    domain: &str,
    params: &HashMap<String, String>,
) -> Response {
    let zone_name = canonical_zone_name(domain);
    let hostname = params.get("hostname").cloned().unwrap_or_default();

    // Delete guard: only the recorded owner may delete. A removal on the
    // old server without "Keep DNS" unchecked must not tear down a zone
    // that has since moved.
    match state.store.get_domain(&zone_name).await {
        Ok(Some(row)) => match row.upstream_server_hostname.as_deref() {
            Some(owner) if !owner.is_empty() && owner != hostname => {
                warn!(
                    zone = %zone_name,
                    owner = %owner,
                    requester = %hostname,
                    "Delete rejected: zone is owned by another upstream — did the old server remove the domain without checking 'Keep DNS'?"
                );
                return da_error(
                    StatusCode::FORBIDDEN,
                    "non-owner delete rejected (Keep-DNS scenario)",
                );
            }
            Some(_) => {}
            None => {
                warn!(
                    zone = %zone_name,
                    "No origin hostname stored — skipping ownership check, proceeding with delete"
                );
            }
        },
        Ok(None) => {
            debug!(zone = %zone_name, "Delete for unknown zone — queueing anyway");
        }
        Err(e) => {
            error!(zone = %zone_name, error = %e, "Store lookup failed");
            return da_error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
        }
    }

    let item = DeleteItem {
        zone_name: zone_name.clone(),
        upstream_hostname: hostname,
        target_backends: None,
    };
    if let Err(e) = state.delete_queue.push(&item) {
        error!(zone = %zone_name, error = %e, "Could not enqueue deletion");
        return da_error(StatusCode::INTERNAL_SERVER_ERROR, "queue failure");
    }

    info!(zone = %zone_name, "Queued deletion");
    da_ok()
}

/// GET `action=exists`: domain and optional parent-domain lookup, used by
/// the upstream before it creates an account.
async fn dns_admin_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let action = params.get("action").map(String::as_str);
    if action != Some("exists") {
        return da_error(
            StatusCode::BAD_REQUEST,
            &format!("Unsupported GET action: {}", action.unwrap_or("")),
        );
    }
    let Some(domain) = params.get("domain") else {
        return da_error(StatusCode::BAD_REQUEST, "Missing 'domain' parameter");
    };
    let zone_name = canonical_zone_name(domain);
    let check_parent = params
        .get("check_for_parent_domain")
        .map(|v| !v.is_empty())
        .unwrap_or(false);

    match state.store.get_domain(&zone_name).await {
        Ok(Some(row)) => {
            let hostname = row.upstream_server_hostname.unwrap_or_default();
            return da_response(
                StatusCode::OK,
                &[
                    ("error", "0"),
                    ("exists", "1"),
                    ("details", &format!("Domain exists on {hostname}")),
                ],
            );
        }
        Ok(None) => {}
        Err(e) => {
            error!(zone = %zone_name, error = %e, "Store lookup failed");
            return da_error(StatusCode::INTERNAL_SERVER_ERROR, "storage failure");
        }
    }

    if check_parent {
        if let Some(parent) = parent_domain_record(&state, &zone_name).await {
            // exists=2: basic parent check. exists=3: cluster check, where
            // the upstream validates that the requesting user owns the parent.
            if state.config.app.check_subdomain_owner_in_cluster_domainowners {
                return da_response(
                    StatusCode::OK,
                    &[
                        ("error", "0"),
                        ("exists", "3"),
                        (
                            "hostname",
                            parent.upstream_server_hostname.as_deref().unwrap_or(""),
                        ),
                        ("username", parent.upstream_username.as_deref().unwrap_or("")),
                    ],
                );
            }
            return da_response(
                StatusCode::OK,
                &[
                    ("error", "0"),
                    ("exists", "2"),
                    (
                        "details",
                        &format!(
                            "Parent Domain exists on {}",
                            parent.upstream_server_hostname.unwrap_or_default()
                        ),
                    ),
                ],
            );
        }
    }

    da_response(StatusCode::OK, &[("error", "0"), ("exists", "0")])
}

/// Walk the ancestor chain (`a.b.example.com` → `b.example.com` →
/// `example.com`) and return the first zone we hold.
async fn parent_domain_record(
    state: &AppState,
    zone_name: &str,
) -> Option<zonegate_common::DomainRecord> {
    let mut candidate = zone_name;
    while let Some((_, parent)) = candidate.split_once('.') {
        if !parent.contains('.') {
            break;
        }
        if let Ok(Some(row)) = state.store.get_domain(parent).await {
            return Some(row);
        }
        candidate = parent;
    }
    None
}

async fn status_handler(State(state): State<AppState>) -> Response {
    Json(build_status(&state).await).into_response()
}

/// Cheap per-backend availability summary for load balancers.
async fn health_handler(State(state): State<AppState>) -> Response {
    let mut backends = Vec::new();
    for (name, backend) in state.registry.enabled() {
        let status = match backend.zone_exists("zonegate-probe.invalid").await {
            Ok(_) => "active",
            Err(_) => "unavailable",
        };
        backends.push(serde_json::json!({"name": name, "status": status}));
    }
    Json(serde_json::json!({"status": "OK", "backends": backends})).into_response()
}

/// All zones with stored zone text, full text included; the peer-sync list
/// response needs no per-zone follow-up.
async fn internal_zones(State(state): State<AppState>) -> Response {
    match state.store.list_domains_with_zone_data().await {
        Ok(rows) => {
            let entries: Vec<PeerZoneEntry> = rows.into_iter().map(to_peer_entry).collect();
            Json(entries).into_response()
        }
        Err(e) => {
            error!(error = %e, "Could not list zones for peer");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}

/// One zone's metadata and text, or 404.
async fn internal_zone(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(domain) = params.get("domain") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "missing domain parameter"})),
        )
            .into_response();
    };
    let zone_name = canonical_zone_name(domain);
    match state.store.get_domain(&zone_name).await {
        Ok(Some(row)) if row.zone_data.is_some() => Json(to_peer_entry(row)).into_response(),
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "not found"})),
        )
            .into_response(),
        Err(e) => {
            error!(zone = %zone_name, error = %e, "Could not fetch zone for peer");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}

/// The current known-peer URL list (gossip).
async fn internal_peers(State(state): State<AppState>) -> Response {
    let urls: Vec<String> = state
        .peers
        .read()
        .await
        .iter()
        .map(|p| p.url.clone())
        .collect();
    Json(urls).into_response()
}

fn to_peer_entry(row: zonegate_common::DomainRecord) -> PeerZoneEntry {
    PeerZoneEntry {
        zone_name: row.zone_name,
        zone_data: row.zone_data,
        zone_updated_at: row.zone_updated_at,
        upstream_hostname: row.upstream_server_hostname,
        upstream_username: row.upstream_username,
    }
}
