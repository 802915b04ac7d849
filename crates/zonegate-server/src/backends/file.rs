//! Zone-file backend for daemons that read RFC 1035 files from disk.
//!
//! Covers NSD and BIND; the flavor controls the include-file stanza format
//! and the reload command shape. Zone files are written to a temp file and
//! renamed into place so the daemon never sees a partial file. Managed
//! zones are registered in a dedicated include file; the daemon's main
//! configuration is never touched.

use super::{Backend, BackendError, Result};
use crate::config::FileBackendFlavor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zonegate_common::zone;

/// Wall-clock cap on the daemon reload exec. A hung control socket must not
/// wedge the save drainer.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FileBackend {
    name: String,
    flavor: FileBackendFlavor,
    zones_dir: PathBuf,
    include_conf: PathBuf,
    control_bin: String,
    /// Serializes zone-file writes per zone.
    zone_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes rewrites of the include file.
    conf_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(
        name: String,
        flavor: FileBackendFlavor,
        zones_dir: PathBuf,
        include_conf: PathBuf,
        control_bin: String,
    ) -> Result<Self> {
        std::fs::create_dir_all(&zones_dir)?;
        if let Some(parent) = include_conf.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !include_conf.exists() {
            std::fs::write(&include_conf, "")?;
            debug!(conf = %include_conf.display(), "Created empty zone include file");
        }
        Ok(Self {
            name,
            flavor,
            zones_dir,
            include_conf,
            control_bin,
            zone_locks: Mutex::new(HashMap::new()),
            conf_lock: Mutex::new(()),
        })
    }

    fn zone_file(&self, zone_name: &str) -> PathBuf {
        self.zones_dir.join(format!("{zone_name}.db"))
    }

    fn stanza(&self, zone_name: &str) -> String {
        let zone_file = self.zone_file(zone_name);
        match self.flavor {
            FileBackendFlavor::Nsd => format!(
                "\nzone:\n    name: \"{}\"\n    zonefile: \"{}\"\n",
                zone_name,
                zone_file.display()
            ),
            FileBackendFlavor::Bind => format!(
                "zone \"{}\" {{ type master; file \"{}\"; }};\n",
                zone_name,
                zone_file.display()
            ),
        }
    }

    fn stanza_marker(&self, zone_name: &str) -> String {
        match self.flavor {
            FileBackendFlavor::Nsd => format!("name: \"{zone_name}\""),
            FileBackendFlavor::Bind => format!("zone \"{zone_name}\""),
        }
    }

    async fn zone_lock(&self, zone_name: &str) -> Arc<Mutex<()>> {
        self.zone_locks
            .lock()
            .await
            .entry(zone_name.to_string())
            .or_default()
            .clone()
    }

    /// Write file contents atomically: temp file in the same directory,
    /// fsync, rename over the target.
    fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    async fn ensure_zone_in_conf(&self, zone_name: &str) -> Result<()> {
        let _guard = self.conf_lock.lock().await;
        let content = std::fs::read_to_string(&self.include_conf).unwrap_or_default();
        if content.contains(&self.stanza_marker(zone_name)) {
            return Ok(());
        }
        let updated = format!("{content}{}", self.stanza(zone_name));
        Self::write_atomic(&self.include_conf, &updated)?;
        debug!(backend = %self.name, zone = %zone_name, "Added zone to include conf");
        Ok(())
    }

    async fn remove_zone_from_conf(&self, zone_name: &str) -> Result<()> {
        let _guard = self.conf_lock.lock().await;
        let content = match std::fs::read_to_string(&self.include_conf) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let stanza = self.stanza(zone_name);
        let updated = content.replace(&stanza, "");
        if updated != content {
            Self::write_atomic(&self.include_conf, &updated)?;
            debug!(backend = %self.name, zone = %zone_name, "Removed zone from include conf");
        }
        Ok(())
    }

    /// Invoke the daemon's control binary to pick up the change.
    ///
    /// NSD reloads a single zone; BIND's `rndc reload` re-reads the whole
    /// configuration, which it needs anyway to notice include-file edits.
    async fn reload(&self, zone_name: &str) -> Result<()> {
        let mut cmd = Command::new(&self.control_bin);
        match self.flavor {
            FileBackendFlavor::Nsd => {
                cmd.arg("reload").arg(zone_name);
            }
            FileBackendFlavor::Bind => {
                cmd.arg("reload");
            }
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = tokio::time::timeout(RELOAD_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                BackendError::Reload(format!(
                    "{} timed out after {}s",
                    self.control_bin,
                    RELOAD_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| BackendError::Reload(format!("{} failed to start: {e}", self.control_bin)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Reload(format!(
                "{} exited with {}: {}",
                self.control_bin,
                output.status,
                stderr.trim()
            )));
        }
        debug!(backend = %self.name, zone = %zone_name, "Daemon reload successful");
        Ok(())
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_zone(&self, zone_name: &str, zone_data: &str) -> Result<()> {
        let lock = self.zone_lock(zone_name).await;
        let _guard = lock.lock().await;

        let zone_file = self.zone_file(zone_name);
        Self::write_atomic(&zone_file, zone_data)?;
        debug!(backend = %self.name, file = %zone_file.display(), "Wrote zone file");

        self.ensure_zone_in_conf(zone_name).await?;
        self.reload(zone_name).await
    }

    async fn delete_zone(&self, zone_name: &str) -> Result<()> {
        let lock = self.zone_lock(zone_name).await;
        let _guard = lock.lock().await;

        let zone_file = self.zone_file(zone_name);
        match std::fs::remove_file(&zone_file) {
            Ok(()) => debug!(backend = %self.name, file = %zone_file.display(), "Deleted zone file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(backend = %self.name, zone = %zone_name, "Zone file already absent");
            }
            Err(e) => return Err(e.into()),
        }

        self.remove_zone_from_conf(zone_name).await?;
        self.reload(zone_name).await
    }

    async fn zone_exists(&self, zone_name: &str) -> Result<bool> {
        Ok(self.zone_file(zone_name).exists())
    }

    async fn count_records(&self, zone_name: &str) -> Result<usize> {
        let contents = std::fs::read_to_string(self.zone_file(zone_name))?;
        zone::count_records(&contents, zone_name)
            .map_err(|e| BackendError::InvalidZone(e.to_string()))
    }

    async fn reconcile(&self, zone_name: &str, zone_data: &str) -> Result<usize> {
        // The whole file is the unit of storage, so reconciliation is a
        // rewrite from the reference text.
        let previous = match std::fs::read_to_string(self.zone_file(zone_name)) {
            Ok(contents) => zone::count_records(&contents, zone_name).unwrap_or(0),
            Err(_) => 0,
        };
        let target = zone::count_records(zone_data, zone_name)
            .map_err(|e| BackendError::InvalidZone(e.to_string()))?;

        self.write_zone(zone_name, zone_data).await?;

        let removed = previous.saturating_sub(target);
        if removed > 0 {
            warn!(
                backend = %self.name,
                zone = %zone_name,
                removed,
                "Reconciled zone file against reference"
            );
        }
        Ok(removed)
    }
}
