//! Embedded single-file store, the default datastore.

use super::{
    decode_backends, encode_backends, format_ts, parse_ts, Result, StoreError, ZoneStore,
};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use tracing::info;
use zonegate_common::{DeadLetter, DomainRecord, OperationKind};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if necessary) the database file and apply migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(format!("create {}: {e}", parent.display())))?;
            }
        }

        let database_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        let store = Self { pool };
        store.create_tables().await?;
        store.migrate_domains_columns().await?;
        info!(path = %db_path.display(), "SQLite datastore initialized");
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.create_tables().await?;
        store.migrate_domains_columns().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS domains (
                zone_name TEXT PRIMARY KEY,
                upstream_server_hostname TEXT,
                upstream_username TEXT,
                managed_by TEXT NOT NULL DEFAULT 'directadmin',
                zone_data TEXT,
                zone_updated_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                zone_name TEXT NOT NULL,
                payload TEXT,
                backends TEXT NOT NULL,
                cause TEXT NOT NULL,
                first_failure TEXT NOT NULL,
                last_failure TEXT NOT NULL,
                attempts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Additive migration: rows written by older releases may predate the
    /// `managed_by`, `zone_data`, and `zone_updated_at` columns.
    async fn migrate_domains_columns(&self) -> Result<()> {
        let rows = sqlx::query("PRAGMA table_info(domains)")
            .fetch_all(&self.pool)
            .await?;
        let existing: Vec<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        let wanted: &[(&str, &str)] = &[
            ("upstream_server_hostname", "TEXT"),
            ("upstream_username", "TEXT"),
            ("managed_by", "TEXT NOT NULL DEFAULT 'directadmin'"),
            ("zone_data", "TEXT"),
            ("zone_updated_at", "TEXT"),
        ];

        for (column, definition) in wanted {
            if !existing.iter().any(|c| c == column) {
                info!(column, "Adding missing column to domains table");
                sqlx::query(&format!("ALTER TABLE domains ADD COLUMN {column} {definition}"))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    fn row_to_domain(row: &sqlx::sqlite::SqliteRow) -> DomainRecord {
        DomainRecord {
            zone_name: row.get("zone_name"),
            upstream_server_hostname: row.get("upstream_server_hostname"),
            upstream_username: row.get("upstream_username"),
            managed_by: row.get("managed_by"),
            zone_data: row.get("zone_data"),
            zone_updated_at: parse_ts(row.get("zone_updated_at")),
        }
    }

    fn row_to_dead_letter(row: &sqlx::sqlite::SqliteRow) -> Result<DeadLetter> {
        let kind: String = row.get("kind");
        let kind = match kind.as_str() {
            "write" => OperationKind::Write,
            "delete" => OperationKind::Delete,
            other => return Err(StoreError::InvalidData(format!("dead letter kind '{other}'"))),
        };
        Ok(DeadLetter {
            id: row.get("id"),
            kind,
            zone_name: row.get("zone_name"),
            payload: row.get("payload"),
            backends: decode_backends(&row.get::<String, _>("backends")),
            cause: row.get("cause"),
            first_failure: parse_ts(Some(row.get("first_failure"))).unwrap_or_default(),
            last_failure: parse_ts(Some(row.get("last_failure"))).unwrap_or_default(),
            attempts: row.get::<i64, _>("attempts") as u32,
        })
    }
}

#[async_trait]
impl ZoneStore for SqliteStore {
    async fn get_domain(&self, zone_name: &str) -> Result<Option<DomainRecord>> {
        let row = sqlx::query("SELECT * FROM domains WHERE zone_name = ?")
            .bind(zone_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_domain))
    }

    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let rows = sqlx::query("SELECT * FROM domains ORDER BY zone_name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_domain).collect())
    }

    async fn list_domains_with_zone_data(&self) -> Result<Vec<DomainRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM domains WHERE zone_data IS NOT NULL ORDER BY zone_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_domain).collect())
    }

    async fn upsert_zone(&self, record: &DomainRecord) -> Result<()> {
        // The WHERE clause drops the whole update when the incoming
        // timestamp is older than the stored one, keeping zone_updated_at
        // monotonic per zone. Timestamps are fixed-width text (format_ts),
        // so the string comparison is chronological.
        sqlx::query(
            r#"
            INSERT INTO domains
                (zone_name, upstream_server_hostname, upstream_username,
                 managed_by, zone_data, zone_updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(zone_name) DO UPDATE SET
                upstream_server_hostname = excluded.upstream_server_hostname,
                upstream_username = excluded.upstream_username,
                managed_by = excluded.managed_by,
                zone_data = excluded.zone_data,
                zone_updated_at = excluded.zone_updated_at
            WHERE excluded.zone_updated_at IS NULL
               OR domains.zone_updated_at IS NULL
               OR excluded.zone_updated_at >= domains.zone_updated_at
            "#,
        )
        .bind(&record.zone_name)
        .bind(&record.upstream_server_hostname)
        .bind(&record.upstream_username)
        .bind(&record.managed_by)
        .bind(&record.zone_data)
        .bind(format_ts(record.zone_updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_ownership(
        &self,
        zone_name: &str,
        hostname: &str,
        username: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE domains SET upstream_server_hostname = ?, upstream_username = ? \
             WHERE zone_name = ?",
        )
        .bind(hostname)
        .bind(username)
        .bind(zone_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_domain(&self, zone_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM domains WHERE zone_name = ?")
            .bind(zone_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_domains(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM domains")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO dead_letters
                (kind, zone_name, payload, backends, cause,
                 first_failure, last_failure, attempts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dead_letter.kind.to_string())
        .bind(&dead_letter.zone_name)
        .bind(&dead_letter.payload)
        .bind(encode_backends(&dead_letter.backends))
        .bind(&dead_letter.cause)
        .bind(format_ts(Some(dead_letter.first_failure)))
        .bind(format_ts(Some(dead_letter.last_failure)))
        .bind(dead_letter.attempts as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query("SELECT * FROM dead_letters ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    async fn count_dead_letters(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}
