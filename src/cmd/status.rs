//! `zonegate status`: query the local daemon's /status endpoint and print
//! a short operator summary.

use color_eyre::eyre::{eyre, Result};
use zonegate_server::config::Config;

pub async fn print_status(config: &Config) -> Result<()> {
    let url = format!("http://127.0.0.1:{}/status", config.app.listen_port);
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .basic_auth(&config.app.auth_username, Some(&config.app.auth_password))
        .send()
        .await
        .map_err(|e| eyre!("is the daemon running on port {}? {e}", config.app.listen_port))?;

    if !response.status().is_success() {
        return Err(eyre!("{url} returned {}", response.status()));
    }
    let doc: serde_json::Value = response.json().await?;

    println!("zonegate status");
    println!();
    println!("  State:        {}", doc["status"].as_str().unwrap_or("?"));
    println!("  Zones:        {}", doc["zones"]["total"]);
    println!(
        "  Queues:       save={} delete={} retry={} dead_letters={}",
        doc["queues"]["save"],
        doc["queues"]["delete"],
        doc["queues"]["retry"],
        doc["queues"]["dead_letters"]
    );
    println!(
        "  Workers:      save={} delete={} retry_drain={}",
        doc["workers"]["save"], doc["workers"]["delete"], doc["workers"]["retry_drain"]
    );
    println!(
        "  Peers:        {} known, {} healthy, {} degraded",
        doc["peer_sync"]["total"], doc["peer_sync"]["healthy"], doc["peer_sync"]["degraded"]
    );
    if let Some(last_run) = doc["reconciler"]["last_run"].as_object() {
        println!(
            "  Reconciler:   last run {} ({}s, orphans={} healed={})",
            last_run.get("status").and_then(|v| v.as_str()).unwrap_or("?"),
            last_run.get("duration_seconds").unwrap_or(&serde_json::json!(0)),
            last_run.get("orphans_found").unwrap_or(&serde_json::json!(0)),
            last_run.get("zones_healed").unwrap_or(&serde_json::json!(0)),
        );
    }
    Ok(())
}
