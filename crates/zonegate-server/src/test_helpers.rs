//! Shared helpers for unit and integration tests.

use crate::backends::{Backend, BackendError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use zonegate_common::zone;

/// SOA + NS + NS + A, four records.
pub fn sample_zone() -> String {
    "\
$ORIGIN example.com.
$TTL 300
@ IN SOA ns1.example.com. hostmaster.example.com. 2024010101 3600 900 604800 300
@ IN NS ns1.example.com.
@ IN NS ns2.example.com.
www IN A 192.0.2.10
"
    .to_string()
}

/// An in-memory backend with scriptable failures.
///
/// `inject_extra_record` makes `count_records` over-report until the next
/// `reconcile`, simulating stale rows left behind in a shared database.
pub struct MockBackend {
    name: String,
    zones: Mutex<HashMap<String, String>>,
    extra_records: Mutex<HashMap<String, usize>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    fail_reconcile: AtomicBool,
    fail_exists: AtomicBool,
    write_calls: AtomicUsize,
    reconcile_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            zones: Mutex::new(HashMap::new()),
            extra_records: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_reconcile: AtomicBool::new(false),
            fail_exists: AtomicBool::new(false),
            write_calls: AtomicUsize::new(0),
            reconcile_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reconcile(&self, fail: bool) {
        self.fail_reconcile.store(fail, Ordering::SeqCst);
    }

    pub fn fail_exists(&self, fail: bool) {
        self.fail_exists.store(fail, Ordering::SeqCst);
    }

    pub fn put_zone(&self, zone_name: &str, zone_data: &str) {
        self.zones
            .lock()
            .unwrap()
            .insert(zone_name.to_string(), zone_data.to_string());
    }

    pub fn has_zone(&self, zone_name: &str) -> bool {
        self.zones.lock().unwrap().contains_key(zone_name)
    }

    pub fn zone_text(&self, zone_name: &str) -> Option<String> {
        self.zones.lock().unwrap().get(zone_name).cloned()
    }

    pub fn inject_extra_record(&self, zone_name: &str) {
        *self
            .extra_records
            .lock()
            .unwrap()
            .entry(zone_name.to_string())
            .or_insert(0) += 1;
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn reconcile_calls(&self) -> usize {
        self.reconcile_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_zone(&self, zone_name: &str, zone_data: &str) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Database("injected write failure".to_string()));
        }
        self.put_zone(zone_name, zone_data);
        Ok(())
    }

    async fn delete_zone(&self, zone_name: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BackendError::Database("injected delete failure".to_string()));
        }
        self.zones.lock().unwrap().remove(zone_name);
        Ok(())
    }

    async fn zone_exists(&self, zone_name: &str) -> Result<bool> {
        if self.fail_exists.load(Ordering::SeqCst) {
            return Err(BackendError::Database("injected exists failure".to_string()));
        }
        Ok(self.has_zone(zone_name))
    }

    async fn count_records(&self, zone_name: &str) -> Result<usize> {
        let text = self
            .zone_text(zone_name)
            .ok_or_else(|| BackendError::Database(format!("zone {zone_name} not stored")))?;
        let parsed = zone::count_records(&text, zone_name)
            .map_err(|e| BackendError::InvalidZone(e.to_string()))?;
        let extra = self
            .extra_records
            .lock()
            .unwrap()
            .get(zone_name)
            .copied()
            .unwrap_or(0);
        Ok(parsed + extra)
    }

    async fn reconcile(&self, zone_name: &str, zone_data: &str) -> Result<usize> {
        self.reconcile_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reconcile.load(Ordering::SeqCst) {
            return Err(BackendError::Database(
                "injected reconcile failure".to_string(),
            ));
        }
        let removed = self
            .extra_records
            .lock()
            .unwrap()
            .remove(zone_name)
            .unwrap_or(0);
        self.put_zone(zone_name, zone_data);
        Ok(removed)
    }
}
