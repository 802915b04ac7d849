//! DNS backend drivers.
//!
//! Every backend implements the same contract: idempotent zone writes and
//! deletes, an existence probe, a record count using the parser's counting
//! rule, and a reconcile operation that removes anything the backend holds
//! for a zone that is not in the reference text.
//!
//! Drivers:
//! - `FileBackend` - RFC 1035 zone files plus a daemon reload via the
//!   daemon's control binary (NSD and BIND flavors)
//! - `SqlBackend`  - row-per-record storage in a shared MySQL schema

mod file;
mod sql;

pub use file::FileBackend;
pub use sql::SqlBackend;

use crate::config::{BackendConfig, DnsConfig};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("reload failed: {0}")]
    Reload(String),

    #[error("invalid zone: {0}")]
    InvalidZone(String),
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        BackendError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// The uniform driver contract. Object-safe; the dispatcher fans out over
/// `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Instance name, unique within the registry.
    fn name(&self) -> &str;

    /// Replace all content for the zone. Idempotent; consumers of the
    /// backend never observe a partially written zone.
    async fn write_zone(&self, zone_name: &str, zone_data: &str) -> Result<()>;

    /// Remove the zone. Deleting an absent zone is ok.
    async fn delete_zone(&self, zone_name: &str) -> Result<()>;

    async fn zone_exists(&self, zone_name: &str) -> Result<bool>;

    /// Records currently served for the zone, counted the same way the
    /// parser counts the reference text.
    async fn count_records(&self, zone_name: &str) -> Result<usize>;

    /// Remove everything held for the zone that is not in `zone_data`.
    /// Safe on an already-consistent zone. Returns the number of records
    /// removed.
    async fn reconcile(&self, zone_name: &str, zone_data: &str) -> Result<usize>;
}

/// Enabled backend instances, built once from configuration.
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Instantiate every enabled backend from config. A backend that fails
    /// to initialize is skipped with a warning rather than failing startup;
    /// the healing pass re-pushes zones once it comes back.
    pub async fn from_config(config: &DnsConfig) -> Self {
        let mut backends: BTreeMap<String, Arc<dyn Backend>> = BTreeMap::new();

        for (instance_name, backend_config) in &config.backends {
            if !backend_config.enabled() {
                continue;
            }
            match backend_config {
                BackendConfig::File {
                    flavor,
                    zones_dir,
                    include_conf,
                    control_bin,
                    ..
                } => match FileBackend::new(
                    instance_name.clone(),
                    *flavor,
                    zones_dir.clone(),
                    include_conf.clone(),
                    control_bin.clone(),
                ) {
                    Ok(backend) => {
                        info!(instance = %instance_name, "Initialized file backend");
                        backends.insert(instance_name.clone(), Arc::new(backend));
                    }
                    Err(e) => {
                        warn!(instance = %instance_name, error = %e, "Skipping file backend");
                    }
                },
                BackendConfig::Sql {
                    host,
                    port,
                    database,
                    username,
                    password,
                    ..
                } => {
                    let url = format!("mysql://{username}:{password}@{host}:{port}/{database}");
                    match SqlBackend::connect(instance_name.clone(), &url).await {
                        Ok(backend) => {
                            info!(instance = %instance_name, database = %database, "Initialized SQL backend");
                            backends.insert(instance_name.clone(), Arc::new(backend));
                        }
                        Err(e) => {
                            warn!(instance = %instance_name, error = %e, "Skipping SQL backend");
                        }
                    }
                }
            }
        }

        if backends.is_empty() {
            warn!("No backends enabled — zone pushes will queue but go nowhere");
        }
        Self { backends }
    }

    /// Build a registry from pre-constructed backends (tests).
    pub fn from_backends(list: Vec<Arc<dyn Backend>>) -> Self {
        Self {
            backends: list
                .into_iter()
                .map(|b| (b.name().to_string(), b))
                .collect(),
        }
    }

    pub fn enabled(&self) -> &BTreeMap<String, Arc<dyn Backend>> {
        &self.backends
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// The named subset, silently dropping names that are no longer
    /// registered (a retry may outlive a config change).
    pub fn subset(&self, names: &[String]) -> BTreeMap<String, Arc<dyn Backend>> {
        names
            .iter()
            .filter_map(|n| self.backends.get(n).map(|b| (n.clone(), b.clone())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
