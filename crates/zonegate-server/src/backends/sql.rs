//! Row-store backend for DNS daemons that serve from a shared SQL schema
//! (CoreDNS/PowerDNS style: a `domains` table plus one row per record).
//!
//! Writes diff the parsed reference zone against the stored rows inside a
//! single transaction: stale rows are deleted before new ones are inserted,
//! so readers never see a mixed generation. In-zone targets (NS/CNAME/MX/
//! SRV) are stored as absolute FQDNs, never origin-relative.

use super::{Backend, BackendError, Result};
use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool, Row};
use std::collections::HashSet;
use tracing::{debug, info};
use zonegate_common::zone::{self, ParsedZone};

use hickory_proto::rr::{DNSClass, RData};

pub struct SqlBackend {
    name: String,
    pool: Pool<MySql>,
}

/// One record row in the shared schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRow {
    pub name: String,
    pub rtype: String,
    pub content: String,
    pub ttl: u32,
    pub prio: Option<u32>,
}

fn strip_root_dot(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

/// Flatten a parsed zone into the rows the schema stores. MX and SRV carry
/// their priority in a dedicated column; name-typed targets lose the
/// trailing dot but stay fully qualified.
pub fn zone_rows(zone_name: &str, zone_data: &str) -> std::result::Result<Vec<RecordRow>, zonegate_common::Error> {
    let parsed: ParsedZone = zone::parse_zone(zone_data, zone_name)?;
    let mut rows = Vec::new();

    for record in parsed.iter_records() {
        if record.dns_class() != DNSClass::IN {
            continue;
        }
        let name = strip_root_dot(&record.name().to_ascii().to_lowercase());
        let rtype = record.record_type().to_string();
        let ttl = record.ttl();

        let (content, prio) = match record.data() {
            RData::MX(mx) => (
                strip_root_dot(&mx.exchange().to_ascii()),
                Some(u32::from(mx.preference())),
            ),
            RData::SRV(srv) => (
                format!(
                    "{} {} {}",
                    srv.weight(),
                    srv.port(),
                    strip_root_dot(&srv.target().to_ascii())
                ),
                Some(u32::from(srv.priority())),
            ),
            RData::NS(ns) => (strip_root_dot(&ns.0.to_ascii()), None),
            RData::CNAME(cname) => (strip_root_dot(&cname.0.to_ascii()), None),
            RData::PTR(ptr) => (strip_root_dot(&ptr.0.to_ascii()), None),
            other => (other.to_string(), None),
        };

        rows.push(RecordRow {
            name,
            rtype,
            content,
            ttl,
            prio,
        });
    }
    Ok(rows)
}

impl SqlBackend {
    pub async fn connect(name: String, database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let backend = Self { name, pool };
        backend.create_tables().await?;
        Ok(backend)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS domains (
                id INT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                type VARCHAR(6) NOT NULL DEFAULT 'NATIVE'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                domain_id INT NOT NULL,
                name VARCHAR(255) NOT NULL,
                type VARCHAR(10) NOT NULL,
                content TEXT NOT NULL,
                ttl INT,
                prio INT,
                disabled TINYINT(1) NOT NULL DEFAULT 0,
                INDEX records_domain_idx (domain_id),
                INDEX records_name_idx (name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn domain_id(
        &self,
        tx: &mut sqlx::Transaction<'_, MySql>,
        zone_name: &str,
        create: bool,
    ) -> Result<Option<u64>> {
        let existing = sqlx::query("SELECT id FROM domains WHERE name = ?")
            .bind(zone_name)
            .fetch_optional(&mut **tx)
            .await?;
        if let Some(row) = existing {
            return Ok(Some(row.get::<i32, _>("id") as u64));
        }
        if !create {
            return Ok(None);
        }
        let result = sqlx::query("INSERT INTO domains (name, type) VALUES (?, 'NATIVE')")
            .bind(zone_name)
            .execute(&mut **tx)
            .await?;
        info!(backend = %self.name, zone = %zone_name, "Created domain row");
        Ok(Some(result.last_insert_id()))
    }

    async fn existing_rows(
        &self,
        tx: &mut sqlx::Transaction<'_, MySql>,
        domain_id: u64,
    ) -> Result<Vec<(u64, RecordRow)>> {
        let rows = sqlx::query(
            "SELECT id, name, type, content, ttl, prio FROM records WHERE domain_id = ?",
        )
        .bind(domain_id as i64)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<i64, _>("id") as u64,
                    RecordRow {
                        name: row.get("name"),
                        rtype: row.get("type"),
                        content: row.get("content"),
                        ttl: row.get::<Option<i64>, _>("ttl").unwrap_or(0) as u32,
                        prio: row.get::<Option<i64>, _>("prio").map(|p| p as u32),
                    },
                )
            })
            .collect())
    }

    /// Diff the stored rows against the reference and apply deletions and
    /// insertions in one transaction. Returns (added, removed).
    async fn apply_rows(&self, zone_name: &str, desired: Vec<RecordRow>) -> Result<(usize, usize)> {
        let mut tx = self.pool.begin().await?;
        let domain_id = match self.domain_id(&mut tx, zone_name, true).await? {
            Some(id) => id,
            None => {
                return Err(BackendError::Database(format!(
                    "domain row missing after insert for {zone_name}"
                )))
            }
        };

        let existing = self.existing_rows(&mut tx, domain_id).await?;
        let desired_set: HashSet<&RecordRow> = desired.iter().collect();
        let existing_set: HashSet<&RecordRow> = existing.iter().map(|(_, r)| r).collect();

        let mut removed = 0usize;
        for (id, row) in &existing {
            if !desired_set.contains(row) {
                sqlx::query("DELETE FROM records WHERE id = ?")
                    .bind(*id as i64)
                    .execute(&mut *tx)
                    .await?;
                removed += 1;
            }
        }

        let mut added = 0usize;
        for row in &desired {
            if !existing_set.contains(row) {
                sqlx::query(
                    "INSERT INTO records (domain_id, name, type, content, ttl, prio, disabled) \
                     VALUES (?, ?, ?, ?, ?, ?, 0)",
                )
                .bind(domain_id as i64)
                .bind(&row.name)
                .bind(&row.rtype)
                .bind(&row.content)
                .bind(row.ttl as i64)
                .bind(row.prio.map(|p| p as i64))
                .execute(&mut *tx)
                .await?;
                added += 1;
            }
        }

        tx.commit().await?;
        Ok((added, removed))
    }
}

#[async_trait]
impl Backend for SqlBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_zone(&self, zone_name: &str, zone_data: &str) -> Result<()> {
        let desired =
            zone_rows(zone_name, zone_data).map_err(|e| BackendError::InvalidZone(e.to_string()))?;
        let (added, removed) = self.apply_rows(zone_name, desired).await?;
        info!(
            backend = %self.name,
            zone = %zone_name,
            added,
            removed,
            "Zone rows updated"
        );
        Ok(())
    }

    async fn delete_zone(&self, zone_name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(domain_id) = self.domain_id(&mut tx, zone_name, false).await? else {
            debug!(backend = %self.name, zone = %zone_name, "Domain row already absent");
            return Ok(());
        };
        let result = sqlx::query("DELETE FROM records WHERE domain_id = ?")
            .bind(domain_id as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM domains WHERE id = ?")
            .bind(domain_id as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(
            backend = %self.name,
            zone = %zone_name,
            records = result.rows_affected(),
            "Deleted domain and records"
        );
        Ok(())
    }

    async fn zone_exists(&self, zone_name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT id FROM domains WHERE name = ?")
            .bind(zone_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn count_records(&self, zone_name: &str) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM records r \
             JOIN domains d ON d.id = r.domain_id \
             WHERE d.name = ? AND r.disabled = 0",
        )
        .bind(zone_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn reconcile(&self, zone_name: &str, zone_data: &str) -> Result<usize> {
        let desired =
            zone_rows(zone_name, zone_data).map_err(|e| BackendError::InvalidZone(e.to_string()))?;
        let (_, removed) = self.apply_rows(zone_name, desired).await?;
        if removed > 0 {
            info!(
                backend = %self.name,
                zone = %zone_name,
                removed,
                "Reconciled extra rows against reference zone"
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = "\
$ORIGIN example.com.
$TTL 300
@ IN SOA ns1.example.com. hostmaster.example.com. 1 3600 900 604800 300
@ IN NS ns1.example.com.
@ IN NS ns2.example.com.
@ IN MX 10 mail
www IN A 192.0.2.10
mail IN A 192.0.2.25
";

    #[test]
    fn test_zone_rows_absolute_names() {
        let rows = zone_rows("example.com", ZONE).unwrap();
        assert_eq!(rows.len(), 6);

        let www = rows.iter().find(|r| r.rtype == "A" && r.name == "www.example.com");
        assert!(www.is_some(), "www row should be fully qualified: {rows:?}");
        assert!(rows.iter().all(|r| !r.name.ends_with('.')));
    }

    #[test]
    fn test_zone_rows_mx_priority_split() {
        let rows = zone_rows("example.com", ZONE).unwrap();
        let mx = rows.iter().find(|r| r.rtype == "MX").unwrap();
        assert_eq!(mx.prio, Some(10));
        assert_eq!(mx.content, "mail.example.com");
    }

    #[test]
    fn test_zone_rows_cname_to_apex_is_absolute() {
        let zone = "\
$ORIGIN example.com.
$TTL 300
@ IN SOA ns1.example.com. hostmaster.example.com. 1 3600 900 604800 300
alias IN CNAME @
";
        let rows = zone_rows("example.com", zone).unwrap();
        let cname = rows.iter().find(|r| r.rtype == "CNAME").unwrap();
        assert_eq!(cname.name, "alias.example.com");
        assert_eq!(cname.content, "example.com");
    }

    #[test]
    fn test_zone_rows_srv_fields() {
        let zone = "\
$ORIGIN example.com.
$TTL 300
@ IN SOA ns1.example.com. hostmaster.example.com. 1 3600 900 604800 300
_sip._tcp IN SRV 5 10 5060 sip.example.com.
";
        let rows = zone_rows("example.com", zone).unwrap();
        let srv = rows.iter().find(|r| r.rtype == "SRV").unwrap();
        assert_eq!(srv.prio, Some(5));
        assert_eq!(srv.content, "10 5060 sip.example.com");
    }

    #[test]
    fn test_zone_rows_count_matches_parser() {
        let rows = zone_rows("example.com", ZONE).unwrap();
        assert_eq!(rows.len(), zone::count_records(ZONE, "example.com").unwrap());
    }
}
