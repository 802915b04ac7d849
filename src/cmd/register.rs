//! `zonegate register`: idempotently register this node as an extra DNS
//! server on every configured upstream, with zone pushes and domain checks
//! enabled so the upstream starts sending zones here.

use color_eyre::eyre::{bail, eyre, Result};
use tracing::info;
use url::Url;
use zonegate_server::config::Config;
use zonegate_server::upstream::UpstreamClient;

pub async fn register_with_upstreams(config: &Config) -> Result<()> {
    if config.reconciliation.upstream_servers.is_empty() {
        bail!("no upstream servers configured under reconciliation.upstream_servers");
    }
    if config.app.advertise_url.is_empty() {
        bail!("app.advertise_url must be set so upstreams know how to reach this node");
    }

    let advertise = Url::parse(&config.app.advertise_url)
        .map_err(|e| eyre!("invalid app.advertise_url: {e}"))?;
    let host = advertise
        .host_str()
        .ok_or_else(|| eyre!("app.advertise_url has no host"))?
        .to_string();
    let port = advertise
        .port()
        .unwrap_or(config.app.listen_port);
    let ssl = advertise.scheme() == "https";

    for server in &config.reconciliation.upstream_servers {
        let client = UpstreamClient::from_server_config(server, config.reconciliation.verify_ssl)
            .map_err(|e| eyre!("{e:#}"))?;
        client
            .ensure_extra_dns_server(
                &host,
                port,
                &config.app.auth_username,
                &config.app.auth_password,
                ssl,
            )
            .await
            .map_err(|e| eyre!("{}: {e:#}", server.hostname))?;
        info!(upstream = %server.hostname, "Registered as extra DNS server");
        println!("✓ {} — registered {host}:{port} (dns=yes domain_check=yes)", server.hostname);
    }
    Ok(())
}
