//! Remote MySQL store, for deployments that point several zonegate
//! processes at one shared datastore.

use super::{
    decode_backends, encode_backends, format_ts, parse_ts, Result, StoreError, ZoneStore,
};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, Pool, Row};
use tracing::info;
use zonegate_common::{DeadLetter, DomainRecord, OperationKind};

pub struct MysqlStore {
    pool: Pool<MySql>,
}

impl MysqlStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.create_tables().await?;
        store.migrate_domains_columns().await?;
        info!("MySQL datastore initialized");
        Ok(store)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS domains (
                zone_name VARCHAR(255) NOT NULL PRIMARY KEY,
                upstream_server_hostname VARCHAR(255),
                upstream_username VARCHAR(255),
                managed_by VARCHAR(64) NOT NULL DEFAULT 'directadmin',
                zone_data MEDIUMTEXT,
                zone_updated_at VARCHAR(64)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                kind VARCHAR(16) NOT NULL,
                zone_name VARCHAR(255) NOT NULL,
                payload MEDIUMTEXT,
                backends TEXT NOT NULL,
                cause TEXT NOT NULL,
                first_failure VARCHAR(64) NOT NULL,
                last_failure VARCHAR(64) NOT NULL,
                attempts INT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Additive migration, mirroring the SQLite store.
    async fn migrate_domains_columns(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = 'domains'",
        )
        .fetch_all(&self.pool)
        .await?;
        let existing: Vec<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("COLUMN_NAME"))
            .collect();

        let wanted: &[(&str, &str)] = &[
            ("upstream_server_hostname", "VARCHAR(255)"),
            ("upstream_username", "VARCHAR(255)"),
            ("managed_by", "VARCHAR(64) NOT NULL DEFAULT 'directadmin'"),
            ("zone_data", "MEDIUMTEXT"),
            ("zone_updated_at", "VARCHAR(64)"),
        ];

        for (column, definition) in wanted {
            if !existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                info!(column, "Adding missing column to domains table");
                sqlx::query(&format!("ALTER TABLE domains ADD COLUMN {column} {definition}"))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    fn row_to_domain(row: &MySqlRow) -> DomainRecord {
        DomainRecord {
            zone_name: row.get("zone_name"),
            upstream_server_hostname: row.get("upstream_server_hostname"),
            upstream_username: row.get("upstream_username"),
            managed_by: row.get("managed_by"),
            zone_data: row.get("zone_data"),
            zone_updated_at: parse_ts(row.get("zone_updated_at")),
        }
    }

    fn row_to_dead_letter(row: &MySqlRow) -> Result<DeadLetter> {
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
            attempts: row.get::<i32, _>("attempts") as u32,
        })
    }
}

#[async_trait]
impl ZoneStore for MysqlStore {
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
        // Read-then-write under a row lock so zone_updated_at stays
        // monotonic per zone: a record older than the stored row is dropped
        // whole, never applied column by column.
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query(
            "SELECT zone_updated_at FROM domains WHERE zone_name = ? FOR UPDATE",
        )
        .bind(&record.zone_name)
        .fetch_optional(&mut *tx)
        .await?;

        match current {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO domains
                        (zone_name, upstream_server_hostname, upstream_username,
                         managed_by, zone_data, zone_updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.zone_name)
                .bind(&record.upstream_server_hostname)
                .bind(&record.upstream_username)
                .bind(&record.managed_by)
                .bind(&record.zone_data)
                .bind(format_ts(record.zone_updated_at))
                .execute(&mut *tx)
                .await?;
            }
            Some(row) => {
                let current_ts = parse_ts(row.get("zone_updated_at"));
                if super::should_apply(record.zone_updated_at, current_ts) {
                    sqlx::query(
                        r#"
                        UPDATE domains SET
                            upstream_server_hostname = ?,
                            upstream_username = ?,
                            managed_by = ?,
                            zone_data = ?,
                            zone_updated_at = ?
                        WHERE zone_name = ?
                        "#,
                    )
                    .bind(&record.upstream_server_hostname)
                    .bind(&record.upstream_username)
                    .bind(&record.managed_by)
                    .bind(&record.zone_data)
                    .bind(format_ts(record.zone_updated_at))
                    .bind(&record.zone_name)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
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
        .bind(dead_letter.attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id() as i64)
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
