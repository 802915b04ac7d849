//! Configuration resolver.
//!
//! Merge order, lowest to highest: built-in defaults, a YAML config file,
//! then `ZONEGATE_*` environment variables. The env mapping is an explicit
//! key table: every scalar field has exactly one recognised key.

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Paths probed for the config file when none is given on the command line.
const CONFIG_SEARCH_PATHS: &[&str] = &[
    "/etc/zonegate/zonegate.yaml",
    "./zonegate.yaml",
    "./config/zonegate.yaml",
];

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub queue_location: PathBuf,
    pub app: AppConfig,
    pub datastore: DatastoreConfig,
    pub dns: DnsConfig,
    pub reconciliation: ReconciliationConfig,
    pub peer_sync: PeerSyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_port: u16,
    pub auth_username: String,
    pub auth_password: String,
    /// URL peers use to reach this node, e.g. `http://ns3.example.net:2222`.
    /// Never added to our own peer set.
    pub advertise_url: String,
    pub managed_by: String,
    /// Answer parent-domain existence checks from the cluster ownership
    /// table (`exists=3`) instead of the basic form (`exists=2`).
    pub check_subdomain_owner_in_cluster_domainowners: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_port: 2222,
            auth_username: "zonegate".to_string(),
            auth_password: "changeme".to_string(),
            advertise_url: String::new(),
            managed_by: zonegate_common::DEFAULT_MANAGED_BY.to_string(),
            check_subdomain_owner_in_cluster_domainowners: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreType {
    Sqlite,
    Mysql,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    #[serde(rename = "type")]
    pub store_type: DatastoreType,
    pub db_location: PathBuf,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub pass: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            store_type: DatastoreType::Sqlite,
            db_location: PathBuf::from("data/zonegate.db"),
            host: "localhost".to_string(),
            port: 3306,
            name: "zonegate".to_string(),
            user: "zonegate".to_string(),
            pass: String::new(),
        }
    }
}

impl DatastoreConfig {
    pub fn mysql_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.pass, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DnsConfig {
    /// Backend instances keyed by instance name.
    pub backends: BTreeMap<String, BackendConfig>,
}

/// Daemon flavor for file-based backends; controls the include-file stanza
/// format and the reload command shape.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileBackendFlavor {
    Nsd,
    Bind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Zone-file backend: writes RFC 1035 files and reloads the daemon via
    /// its control binary.
    File {
        #[serde(default)]
        enabled: bool,
        flavor: FileBackendFlavor,
        #[serde(default = "default_zones_dir")]
        zones_dir: PathBuf,
        #[serde(default = "default_include_conf")]
        include_conf: PathBuf,
        /// Control binary, e.g. `nsd-control` or `rndc`.
        control_bin: String,
    },
    /// Row-store backend: upserts per-record rows into a shared SQL schema.
    Sql {
        #[serde(default)]
        enabled: bool,
        #[serde(default = "default_sql_host")]
        host: String,
        #[serde(default = "default_sql_port")]
        port: u16,
        database: String,
        username: String,
        #[serde(default)]
        password: String,
    },
}

fn default_zones_dir() -> PathBuf {
    PathBuf::from("/etc/nsd/zones")
}

fn default_include_conf() -> PathBuf {
    PathBuf::from("/etc/nsd/nsd.conf.d/zones.conf")
}

fn default_sql_host() -> String {
    "localhost".to_string()
}

fn default_sql_port() -> u16 {
    3306
}

impl BackendConfig {
    pub fn enabled(&self) -> bool {
        match self {
            BackendConfig::File { enabled, .. } => *enabled,
            BackendConfig::Sql { enabled, .. } => *enabled,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub dry_run: bool,
    pub interval_minutes: u64,
    /// Staggers siblings behind a load balancer.
    pub initial_delay_minutes: u64,
    pub verify_ssl: bool,
    /// Items per page when listing upstream domains.
    pub ipp: u32,
    pub upstream_servers: Vec<UpstreamServerConfig>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: false,
            interval_minutes: 60,
            initial_delay_minutes: 0,
            verify_ssl: true,
            ipp: 1000,
            upstream_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamServerConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ssl: bool,
}

impl Default for UpstreamServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 2222,
            username: String::new(),
            password: String::new(),
            ssl: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerSyncConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    /// Credentials this node serves on the peer realm.
    pub auth_username: String,
    pub auth_password: String,
    pub peers: Vec<PeerConfig>,
}

impl Default for PeerSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 15,
            auth_username: "peersync".to_string(),
            auth_password: "changeme".to_string(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PeerConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Config {
    /// Resolve the configuration: defaults, then the YAML file (explicit path
    /// or the first hit on the search path), then environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = match Self::locate_file(path) {
            Some(file) => {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read config file {}", file.display()))?;
                let parsed: Config = serde_yaml::from_str(&text)
                    .with_context(|| format!("Failed to parse config file {}", file.display()))?;
                debug!(file = %file.display(), "Loaded config file");
                parsed
            }
            None => {
                warn!("No config file found, using defaults");
                Config::default()
            }
        };
        if config.log_level.is_empty() {
            config.log_level = "info".to_string();
        }
        if config.queue_location.as_os_str().is_empty() {
            config.queue_location = PathBuf::from("./data/queues");
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn locate_file(path: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = path {
            return Some(p.to_path_buf());
        }
        CONFIG_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Apply environment overrides from an explicit key table. `get` is
    /// injected so tests can drive the table without touching the process
    /// environment.
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn set_string(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
            if let Some(value) = get(key) {
                *target = value;
            }
        }
        fn set_bool(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
            if let Some(value) = get(key) {
                *target = matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1");
            }
        }

        if let Some(v) = get("ZONEGATE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("ZONEGATE_QUEUE_LOCATION") {
            self.queue_location = PathBuf::from(v);
        }

        if let Some(v) = get("ZONEGATE_APP_LISTEN_PORT") {
            match v.parse() {
                Ok(port) => self.app.listen_port = port,
                Err(_) => warn!(value = %v, "Ignoring invalid ZONEGATE_APP_LISTEN_PORT"),
            }
        }
        set_string(&get, "ZONEGATE_APP_AUTH_USERNAME", &mut self.app.auth_username);
        set_string(&get, "ZONEGATE_APP_AUTH_PASSWORD", &mut self.app.auth_password);
        set_string(&get, "ZONEGATE_APP_ADVERTISE_URL", &mut self.app.advertise_url);
        set_string(&get, "ZONEGATE_APP_MANAGED_BY", &mut self.app.managed_by);
        set_bool(
            &get,
            "ZONEGATE_APP_CHECK_SUBDOMAIN_OWNER_IN_CLUSTER_DOMAINOWNERS",
            &mut self.app.check_subdomain_owner_in_cluster_domainowners,
        );

        if let Some(v) = get("ZONEGATE_DATASTORE_TYPE") {
            match v.to_ascii_lowercase().as_str() {
                "sqlite" => self.datastore.store_type = DatastoreType::Sqlite,
                "mysql" => self.datastore.store_type = DatastoreType::Mysql,
                other => warn!(value = %other, "Ignoring unknown ZONEGATE_DATASTORE_TYPE"),
            }
        }
        if let Some(v) = get("ZONEGATE_DATASTORE_DB_LOCATION") {
            self.datastore.db_location = PathBuf::from(v);
        }
        set_string(&get, "ZONEGATE_DATASTORE_HOST", &mut self.datastore.host);
        if let Some(v) = get("ZONEGATE_DATASTORE_PORT") {
            if let Ok(port) = v.parse() {
                self.datastore.port = port;
            }
        }
        set_string(&get, "ZONEGATE_DATASTORE_NAME", &mut self.datastore.name);
        set_string(&get, "ZONEGATE_DATASTORE_USER", &mut self.datastore.user);
        set_string(&get, "ZONEGATE_DATASTORE_PASS", &mut self.datastore.pass);

        set_bool(&get, "ZONEGATE_RECONCILIATION_ENABLED", &mut self.reconciliation.enabled);
        set_bool(&get, "ZONEGATE_RECONCILIATION_DRY_RUN", &mut self.reconciliation.dry_run);
        if let Some(v) = get("ZONEGATE_RECONCILIATION_INTERVAL_MINUTES") {
            if let Ok(minutes) = v.parse() {
                self.reconciliation.interval_minutes = minutes;
            }
        }
        if let Some(v) = get("ZONEGATE_RECONCILIATION_INITIAL_DELAY_MINUTES") {
            if let Ok(minutes) = v.parse() {
                self.reconciliation.initial_delay_minutes = minutes;
            }
        }
        set_bool(&get, "ZONEGATE_RECONCILIATION_VERIFY_SSL", &mut self.reconciliation.verify_ssl);
        if let Some(v) = get("ZONEGATE_RECONCILIATION_IPP") {
            if let Ok(ipp) = v.parse() {
                self.reconciliation.ipp = ipp;
            }
        }

        set_bool(&get, "ZONEGATE_PEER_SYNC_ENABLED", &mut self.peer_sync.enabled);
        if let Some(v) = get("ZONEGATE_PEER_SYNC_INTERVAL_MINUTES") {
            if let Ok(minutes) = v.parse() {
                self.peer_sync.interval_minutes = minutes;
            }
        }
        set_string(&get, "ZONEGATE_PEER_SYNC_AUTH_USERNAME", &mut self.peer_sync.auth_username);
        set_string(&get, "ZONEGATE_PEER_SYNC_AUTH_PASSWORD", &mut self.peer_sync.auth_password);

        self.inject_env_peers(&get);
    }

    /// Merge peers supplied through env vars into the configured peer list.
    ///
    /// `ZONEGATE_PEER_SYNC_PEER_URL` names a single peer; numbered variants
    /// `ZONEGATE_PEER_SYNC_PEER_{1..9}_URL` add more. `_USERNAME` and
    /// `_PASSWORD` suffixes follow the same pattern.
    fn inject_env_peers<F>(&mut self, get: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut candidates = Vec::new();

        if let Some(url) = get("ZONEGATE_PEER_SYNC_PEER_URL").filter(|u| !u.trim().is_empty()) {
            candidates.push(PeerConfig {
                url: url.trim().to_string(),
                username: get("ZONEGATE_PEER_SYNC_PEER_USERNAME"),
                password: get("ZONEGATE_PEER_SYNC_PEER_PASSWORD"),
            });
        }

        for i in 1..=9 {
            let url = match get(&format!("ZONEGATE_PEER_SYNC_PEER_{i}_URL")) {
                Some(u) if !u.trim().is_empty() => u.trim().to_string(),
                _ => break,
            };
            candidates.push(PeerConfig {
                url,
                username: get(&format!("ZONEGATE_PEER_SYNC_PEER_{i}_USERNAME")),
                password: get(&format!("ZONEGATE_PEER_SYNC_PEER_{i}_PASSWORD")),
            });
        }

        for candidate in candidates {
            if self.peer_sync.peers.iter().any(|p| p.url == candidate.url) {
                continue;
            }
            debug!(url = %candidate.url, "Added peer from environment");
            self.peer_sync.peers.push(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.app.listen_port, 2222);
        assert_eq!(config.datastore.store_type, DatastoreType::Sqlite);
        assert_eq!(config.reconciliation.interval_minutes, 60);
        assert_eq!(config.peer_sync.interval_minutes, 15);
        assert!(!config.reconciliation.enabled);
    }

    #[test]
    fn test_yaml_parses_tagged_backends() {
        let yaml = r#"
app:
  listen_port: 2223
dns:
  backends:
    nsd-main:
      type: file
      enabled: true
      flavor: nsd
      control_bin: nsd-control
    coredns:
      type: sql
      enabled: true
      database: coredns
      username: coredns
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.app.listen_port, 2223);
        assert_eq!(config.dns.backends.len(), 2);
        assert!(matches!(
            config.dns.backends.get("nsd-main"),
            Some(BackendConfig::File { flavor: FileBackendFlavor::Nsd, .. })
        ));
        assert!(config.dns.backends.values().all(|b| b.enabled()));
    }

    #[test]
    fn test_env_overrides_win() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ZONEGATE_APP_LISTEN_PORT", "8053"),
            ("ZONEGATE_APP_AUTH_PASSWORD", "s3cret"),
            ("ZONEGATE_DATASTORE_TYPE", "mysql"),
            ("ZONEGATE_RECONCILIATION_ENABLED", "true"),
            ("ZONEGATE_RECONCILIATION_INTERVAL_MINUTES", "30"),
        ]));
        assert_eq!(config.app.listen_port, 8053);
        assert_eq!(config.app.auth_password, "s3cret");
        assert_eq!(config.datastore.store_type, DatastoreType::Mysql);
        assert!(config.reconciliation.enabled);
        assert_eq!(config.reconciliation.interval_minutes, 30);
    }

    #[test]
    fn test_env_invalid_port_is_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("ZONEGATE_APP_LISTEN_PORT", "not-a-port")]));
        assert_eq!(config.app.listen_port, 2222);
    }

    #[test]
    fn test_env_peer_injection_single_and_numbered() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ZONEGATE_PEER_SYNC_PEER_URL", "http://ns1.example.net:2222"),
            ("ZONEGATE_PEER_SYNC_PEER_PASSWORD", "pw0"),
            ("ZONEGATE_PEER_SYNC_PEER_1_URL", "http://ns2.example.net:2222"),
            ("ZONEGATE_PEER_SYNC_PEER_2_URL", "http://ns3.example.net:2222"),
        ]));
        let urls: Vec<&str> = config.peer_sync.peers.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "http://ns1.example.net:2222",
                "http://ns2.example.net:2222",
                "http://ns3.example.net:2222",
            ]
        );
    }

    #[test]
    fn test_env_peer_numbering_stops_at_gap() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ZONEGATE_PEER_SYNC_PEER_1_URL", "http://ns2.example.net:2222"),
            ("ZONEGATE_PEER_SYNC_PEER_3_URL", "http://ns4.example.net:2222"),
        ]));
        assert_eq!(config.peer_sync.peers.len(), 1);
    }

    #[test]
    fn test_env_peer_deduplicates_against_file_peers() {
        let mut config = Config::default();
        config.peer_sync.peers.push(PeerConfig {
            url: "http://ns2.example.net:2222".to_string(),
            username: None,
            password: None,
        });
        config.apply_env(env(&[(
            "ZONEGATE_PEER_SYNC_PEER_URL",
            "http://ns2.example.net:2222",
        )]));
        assert_eq!(config.peer_sync.peers.len(), 1);
    }
}
