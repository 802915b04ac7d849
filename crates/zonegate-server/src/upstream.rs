//! Upstream control-panel HTTP client.
//!
//! Encapsulates all outbound communication with a single upstream server:
//! authenticated requests, the Basic-Auth to session-cookie fallback newer
//! panel versions require, paginated domain listing with a legacy
//! URL-encoded fallback parser, and idempotent registration of this node
//! as an extra DNS server.

use anyhow::{bail, Context};
use reqwest::{redirect, Response, StatusCode};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::UpstreamServerConfig;

/// Default timeout for upstream calls.
const UPSTREAM_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for list endpoints, which can page through thousands of zones.
const UPSTREAM_LIST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UpstreamClient {
    hostname: String,
    port: u16,
    username: String,
    password: String,
    scheme: &'static str,
    client: reqwest::Client,
    /// Session cookies captured from CMD_LOGIN, joined for the Cookie
    /// header. Empty until the Basic-Auth redirect forces a login.
    cookies: Mutex<Option<String>>,
}

impl UpstreamClient {
    pub fn new(
        hostname: String,
        port: u16,
        username: String,
        password: String,
        ssl: bool,
        verify_ssl: bool,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_HTTP_TIMEOUT)
            // Redirects are detected, not followed: a redirect from the API
            // means Basic Auth was rejected and a session login is needed.
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self {
            hostname,
            port,
            username,
            password,
            scheme: if ssl { "https" } else { "http" },
            client,
            cookies: Mutex::new(None),
        })
    }

    pub fn from_server_config(
        server: &UpstreamServerConfig,
        verify_ssl: bool,
    ) -> anyhow::Result<Self> {
        Self::new(
            server.hostname.clone(),
            server.port,
            server.username.clone(),
            server.password.clone(),
            server.ssl,
            verify_ssl,
        )
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn command_url(&self, command: &str) -> String {
        format!("{}://{}:{}/{}", self.scheme, self.hostname, self.port, command)
    }

    /// Apply session cookies when a login has happened, Basic Auth
    /// otherwise.
    async fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(cookies) = self.cookies.lock().await.as_ref() {
            request.header(reqwest::header::COOKIE, cookies.clone())
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    /// Authenticated GET to any CMD_* endpoint.
    pub async fn get(&self, command: &str, params: &[(&str, String)]) -> anyhow::Result<Response> {
        let request = self.client.get(self.command_url(command)).query(params);
        self.apply_auth(request)
            .await
            .send()
            .await
            .with_context(|| format!("GET {command} on {} failed", self.hostname))
    }

    /// Authenticated POST with a form body.
    pub async fn post(&self, command: &str, form: &[(String, String)]) -> anyhow::Result<Response> {
        let request = self.client.post(self.command_url(command)).form(form);
        self.apply_auth(request)
            .await
            .send()
            .await
            .with_context(|| format!("POST {command} on {} failed", self.hostname))
    }

    /// All zones on this upstream, via the paginated JSON listing. Falls
    /// back to the legacy URL-encoded parser when the response is not JSON.
    pub async fn list_domains(&self, ipp: u32) -> anyhow::Result<HashSet<String>> {
        let mut page = 1u32;
        let mut total_pages = 1u32;
        let mut all_domains = HashSet::new();

        while page <= total_pages {
            let request = self
                .client
                .get(self.command_url("CMD_DNS_ADMIN"))
                .query(&[
                    ("json", "yes".to_string()),
                    ("page", page.to_string()),
                    ("ipp", ipp.to_string()),
                ])
                .timeout(UPSTREAM_LIST_TIMEOUT);
            let response = self
                .apply_auth(request)
                .await
                .send()
                .await
                .with_context(|| format!("GET CMD_DNS_ADMIN on {} failed", self.hostname))?;

            if response.status().is_redirection() {
                if self.cookies.lock().await.is_some() {
                    bail!(
                        "still redirecting after session login — check that '{}' has admin-level access",
                        self.username
                    );
                }
                debug!(
                    upstream = %self.hostname,
                    status = %response.status(),
                    "Basic Auth redirected — attempting session login"
                );
                self.login().await?;
                continue; // retry this page with cookies
            }
            if !response.status().is_success() {
                bail!("CMD_DNS_ADMIN returned {}", response.status());
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = response.text().await?;
            if content_type.contains("text/html") {
                bail!("upstream returned HTML instead of an API response — check credentials and admin-level access");
            }

            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(data) => {
                    if let Some(map) = data.as_object() {
                        for (key, value) in map {
                            if key.chars().all(|c| c.is_ascii_digit()) {
                                if let Some(domain) =
                                    value.get("domain").and_then(|d| d.as_str())
                                {
                                    all_domains.insert(domain.trim().to_lowercase());
                                }
                            }
                        }
                        total_pages = data
                            .get("info")
                            .and_then(|i| i.get("total_pages"))
                            .and_then(value_as_u32)
                            .unwrap_or(1);
                    }
                    page += 1;
                }
                Err(e) => {
                    error!(
                        upstream = %self.hostname,
                        page,
                        error = %e,
                        "JSON decode failed — falling back to legacy parser"
                    );
                    all_domains.extend(parse_legacy_domain_list(&body));
                    break; // no paging in legacy mode
                }
            }
        }

        Ok(all_domains)
    }

    /// POST CMD_LOGIN to obtain a session cookie (newer panel versions
    /// redirect Basic Auth away from the API).
    async fn login(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.command_url("CMD_LOGIN"))
            .form(&[
                ("username", self.username.clone()),
                ("password", self.password.clone()),
                ("referer", "/CMD_DNS_ADMIN?json=yes&page=1&ipp=500".to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("CMD_LOGIN on {} failed", self.hostname))?;

        let cookies: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(|v| v.to_string())
            .collect();
        if cookies.is_empty() {
            bail!("CMD_LOGIN returned no session cookie — check username/password");
        }

        *self.cookies.lock().await = Some(cookies.join("; "));
        debug!(upstream = %self.hostname, "Session login successful");
        Ok(())
    }

    /// The extra-DNS-server map from CMD_MULTI_SERVER, keyed by server
    /// host/IP.
    pub async fn get_extra_dns_servers(&self) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        let response = self
            .get("CMD_MULTI_SERVER", &[("json", "yes".to_string())])
            .await?;
        if response.status() != StatusCode::OK {
            bail!("CMD_MULTI_SERVER GET returned {}", response.status());
        }
        let data: serde_json::Value = response.json().await?;
        Ok(data
            .get("servers")
            .and_then(|s| s.as_object())
            .cloned()
            .unwrap_or_default())
    }

    async fn add_extra_dns_server(
        &self,
        ip: &str,
        port: u16,
        user: &str,
        passwd: &str,
        ssl: bool,
    ) -> anyhow::Result<()> {
        let response = self
            .post(
                "CMD_MULTI_SERVER",
                &[
                    ("action".to_string(), "add".to_string()),
                    ("json".to_string(), "yes".to_string()),
                    ("ip".to_string(), ip.to_string()),
                    ("port".to_string(), port.to_string()),
                    ("user".to_string(), user.to_string()),
                    ("passwd".to_string(), passwd.to_string()),
                    ("ssl".to_string(), yes_no(ssl).to_string()),
                ],
            )
            .await?;
        if response.status() != StatusCode::OK {
            bail!("CMD_MULTI_SERVER add returned {}", response.status());
        }
        let result: serde_json::Value = response.json().await?;
        if !result.get("success").map(truthy).unwrap_or(false) {
            bail!(
                "CMD_MULTI_SERVER add error: {}",
                result.get("result").unwrap_or(&result)
            );
        }
        info!(upstream = %self.hostname, ip, "Added extra DNS server");
        Ok(())
    }

    /// Register (if absent) and configure this node as an extra DNS server,
    /// enforcing `dns=yes` and `domain_check=yes` so the upstream pushes
    /// zone updates here. Idempotent.
    pub async fn ensure_extra_dns_server(
        &self,
        ip: &str,
        port: u16,
        user: &str,
        passwd: &str,
        ssl: bool,
    ) -> anyhow::Result<()> {
        let servers = self.get_extra_dns_servers().await?;
        if !servers.contains_key(ip) {
            self.add_extra_dns_server(ip, port, user, passwd, ssl).await?;
        }

        let response = self
            .post(
                "CMD_MULTI_SERVER",
                &[
                    ("action".to_string(), "multiple".to_string()),
                    ("save".to_string(), "yes".to_string()),
                    ("json".to_string(), "yes".to_string()),
                    ("passwd".to_string(), String::new()),
                    ("select0".to_string(), ip.to_string()),
                    (format!("port-{ip}"), port.to_string()),
                    (format!("user-{ip}"), user.to_string()),
                    (format!("ssl-{ip}"), yes_no(ssl).to_string()),
                    (format!("dns-{ip}"), "yes".to_string()),
                    (format!("domain_check-{ip}"), "yes".to_string()),
                    (format!("user_check-{ip}"), "no".to_string()),
                    (format!("email-{ip}"), "no".to_string()),
                    (format!("show_all_users-{ip}"), "no".to_string()),
                ],
            )
            .await?;
        if response.status() != StatusCode::OK {
            bail!("CMD_MULTI_SERVER save returned {}", response.status());
        }
        let result: serde_json::Value = response.json().await?;
        if !result.get("success").map(truthy).unwrap_or(false) {
            bail!(
                "CMD_MULTI_SERVER save error: {}",
                result.get("result").unwrap_or(&result)
            );
        }
        info!(
            upstream = %self.hostname,
            ip,
            "Extra DNS server configured (dns=yes domain_check=yes)"
        );
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !s.is_empty() && s != "0" && s != "no",
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn value_as_u32(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(|v| v as u32),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse the legacy URL-encoded domain listing: `list[]=a.com&list[]=b.com`,
/// sometimes newline-separated instead of ampersand-separated.
pub(crate) fn parse_legacy_domain_list(body: &str) -> HashSet<String> {
    let normalized = body.replace('\n', "&");
    url::form_urlencoded::parse(normalized.trim_matches('&').as_bytes())
        .filter(|(key, _)| key == "list[]")
        .map(|(_, value)| value.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_legacy_domain_list_ampersands() {
        let parsed = parse_legacy_domain_list("list[]=Example.COM&list[]=other.net");
        assert!(parsed.contains("example.com"));
        assert!(parsed.contains("other.net"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_legacy_domain_list_newlines() {
        let parsed = parse_legacy_domain_list("list[]=a.com\nlist[]=b.com\n");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_legacy_domain_list_ignores_other_keys() {
        let parsed = parse_legacy_domain_list("error=0&list[]=a.com&text=ok");
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains("a.com"));
    }

    #[test]
    fn test_truthy_variants() {
        assert!(truthy(&serde_json::json!(true)));
        assert!(truthy(&serde_json::json!("yes")));
        assert!(truthy(&serde_json::json!(1)));
        assert!(!truthy(&serde_json::json!(false)));
        assert!(!truthy(&serde_json::json!("")));
        assert!(!truthy(&serde_json::json!("0")));
    }

    #[test]
    fn test_value_as_u32() {
        assert_eq!(value_as_u32(&serde_json::json!(3)), Some(3));
        assert_eq!(value_as_u32(&serde_json::json!("7")), Some(7));
        assert_eq!(value_as_u32(&serde_json::json!([])), None);
    }
}
