//! Basic-auth middleware for the two HTTP realms.
//!
//! The "app" realm guards the upstream-facing endpoints and `/status`; the
//! "peer" realm guards the `/internal/*` endpoints used by peer sync. The
//! realms have independent credentials, and any mismatch is a plain 401.

use crate::AppState;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

pub const APP_REALM: &str = "zonegate";
pub const PEER_REALM: &str = "zonegate-peer";

pub async fn require_app_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if check_basic(
        request.headers(),
        &state.config.app.auth_username,
        &state.config.app.auth_password,
    ) {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "App-realm auth failed");
        unauthorized(APP_REALM)
    }
}

pub async fn require_peer_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if check_basic(
        request.headers(),
        &state.config.peer_sync.auth_username,
        &state.config.peer_sync.auth_password,
    ) {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "Peer-realm auth failed");
        unauthorized(PEER_REALM)
    }
}

fn unauthorized(realm: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{realm}\""),
        )],
        "Unauthorized",
    )
        .into_response()
}

/// Validate an `Authorization: Basic` header against one credential pair.
pub(crate) fn check_basic(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    user == username && pass == password
}

/// Build the header value a client sends for the given credentials.
pub fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn test_valid_credentials() {
        let headers = headers_with(&basic_auth_header("admin", "secret"));
        assert!(check_basic(&headers, "admin", "secret"));
    }

    #[test]
    fn test_wrong_password() {
        let headers = headers_with(&basic_auth_header("admin", "wrong"));
        assert!(!check_basic(&headers, "admin", "secret"));
    }

    #[test]
    fn test_wrong_user() {
        let headers = headers_with(&basic_auth_header("other", "secret"));
        assert!(!check_basic(&headers, "admin", "secret"));
    }

    #[test]
    fn test_missing_header() {
        assert!(!check_basic(&HeaderMap::new(), "admin", "secret"));
    }

    #[test]
    fn test_not_basic_scheme() {
        let headers = headers_with("Bearer tok");
        assert!(!check_basic(&headers, "admin", "secret"));
    }

    #[test]
    fn test_malformed_base64() {
        let headers = headers_with("Basic %%%%");
        assert!(!check_basic(&headers, "admin", "secret"));
    }

    #[test]
    fn test_password_containing_colon() {
        let headers = headers_with(&basic_auth_header("admin", "se:cret"));
        assert!(check_basic(&headers, "admin", "se:cret"));
    }
}
