//! In-memory store for tests.

use super::{Result, ZoneStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use zonegate_common::{DeadLetter, DomainRecord};

#[derive(Default)]
pub struct MemoryStore {
    domains: RwLock<BTreeMap<String, DomainRecord>>,
    dead_letters: RwLock<Vec<DeadLetter>>,
    next_dead_letter_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(BTreeMap::new()),
            dead_letters: RwLock::new(Vec::new()),
            next_dead_letter_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl ZoneStore for MemoryStore {
    async fn get_domain(&self, zone_name: &str) -> Result<Option<DomainRecord>> {
        Ok(self.domains.read().await.get(zone_name).cloned())
    }

    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        Ok(self.domains.read().await.values().cloned().collect())
    }

    async fn list_domains_with_zone_data(&self) -> Result<Vec<DomainRecord>> {
        Ok(self
            .domains
            .read()
            .await
            .values()
            .filter(|r| r.zone_data.is_some())
            .cloned()
            .collect())
    }

    async fn upsert_zone(&self, record: &DomainRecord) -> Result<()> {
        let mut domains = self.domains.write().await;
        if let Some(existing) = domains.get(&record.zone_name) {
            if !super::should_apply(record.zone_updated_at, existing.zone_updated_at) {
                return Ok(());
            }
        }
        domains.insert(record.zone_name.clone(), record.clone());
        Ok(())
    }

    async fn update_ownership(
        &self,
        zone_name: &str,
        hostname: &str,
        username: &str,
    ) -> Result<()> {
        if let Some(record) = self.domains.write().await.get_mut(zone_name) {
            record.upstream_server_hostname = Some(hostname.to_string());
            record.upstream_username = Some(username.to_string());
        }
        Ok(())
    }

    async fn delete_domain(&self, zone_name: &str) -> Result<()> {
        self.domains.write().await.remove(zone_name);
        Ok(())
    }

    async fn count_domains(&self) -> Result<u64> {
        Ok(self.domains.read().await.len() as u64)
    }

    async fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> Result<i64> {
        let id = self.next_dead_letter_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = dead_letter.clone();
        stored.id = id;
        self.dead_letters.write().await.push(stored);
        Ok(id)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.dead_letters.read().await.clone())
    }

    async fn count_dead_letters(&self) -> Result<u64> {
        Ok(self.dead_letters.read().await.len() as u64)
    }
}
