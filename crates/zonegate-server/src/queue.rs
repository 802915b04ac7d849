//! Crash-safe on-disk FIFO queues.
//!
//! One directory per queue, one JSON file per item, named by a
//! zero-padded monotonic sequence number. Enqueue writes to a temp file,
//! fsyncs, renames into place, and fsyncs the directory. A consumer claims
//! the lowest-numbered unclaimed file and deletes it only on `commit`, so
//! the consumer offset never advances before the post-consumption
//! side-effect has itself been committed. A crash between claim and commit
//! re-delivers the item (at-least-once).
//!
//! Single consumer per queue; producers may be many.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::warn;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue item encode error: {0}")]
    Encode(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// How long a blocked consumer waits before rescanning the directory, as a
/// safety net against a missed notify.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

const ITEM_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";

/// An item handed to the consumer. The backing file stays on disk until
/// `DiskQueue::commit` is called with it.
#[derive(Debug)]
pub struct Claimed<T> {
    seq: u64,
    pub item: T,
}

pub struct DiskQueue<T> {
    dir: PathBuf,
    next_seq: AtomicU64,
    in_flight: Mutex<BTreeSet<u64>>,
    notify: Notify,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> DiskQueue<T> {
    /// Open a queue directory, creating it if absent. Leftover temp files
    /// from a crashed enqueue are discarded; completed items survive.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut max_seq = 0u64;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) {
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            if let Some(seq) = parse_seq(&name) {
                max_seq = max_seq.max(seq);
            }
        }

        Ok(Self {
            dir,
            next_seq: AtomicU64::new(max_seq + 1),
            in_flight: Mutex::new(BTreeSet::new()),
            notify: Notify::new(),
            _marker: PhantomData,
        })
    }

    /// Durably append an item. The item is visible to the consumer only
    /// after the rename, so a crash mid-enqueue loses the item but never
    /// yields a torn one.
    pub fn push(&self, item: &T) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let encoded = serde_json::to_vec(item).map_err(QueueError::Encode)?;

        let tmp_path = self.dir.join(format!("{seq:020}{TMP_SUFFIX}"));
        let final_path = self.dir.join(format!("{seq:020}{ITEM_SUFFIX}"));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &final_path)?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        self.notify.notify_waiters();
        Ok(())
    }

    /// Claim the oldest unclaimed item without blocking. Undecodable files
    /// are moved aside so one corrupt item cannot wedge the queue.
    pub fn try_claim(&self) -> Result<Option<Claimed<T>>> {
        loop {
            // Candidate selection and the in-flight reservation happen under
            // one lock so two concurrent callers can never claim the same
            // sequence number.
            let seq = {
                let mut in_flight = self.in_flight.lock().expect("queue lock poisoned");
                let candidate = self
                    .scan_sequences()?
                    .into_iter()
                    .find(|seq| !in_flight.contains(seq));
                match candidate {
                    Some(seq) => {
                        in_flight.insert(seq);
                        seq
                    }
                    None => return Ok(None),
                }
            };

            let path = self.item_path(seq);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Raced with an external cleanup; release and look again.
                    self.release(seq);
                    continue;
                }
                Err(e) => {
                    self.release(seq);
                    return Err(e.into());
                }
            };

            match serde_json::from_slice(&bytes) {
                Ok(item) => return Ok(Some(Claimed { seq, item })),
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        error = %e,
                        "Quarantining undecodable queue item"
                    );
                    let _ = std::fs::rename(&path, path.with_extension("corrupt"));
                    self.release(seq);
                }
            }
        }
    }

    fn release(&self, seq: u64) {
        self.in_flight
            .lock()
            .expect("queue lock poisoned")
            .remove(&seq);
    }

    /// Claim the oldest item, waiting until one arrives or the shutdown
    /// signal fires. Returns `None` on shutdown.
    pub async fn claim(&self, shutdown: &mut watch::Receiver<()>) -> Result<Option<Claimed<T>>> {
        loop {
            if let Some(claimed) = self.try_claim()? {
                return Ok(Some(claimed));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
                _ = shutdown.changed() => return Ok(None),
            }
        }
    }

    /// Remove a consumed item from disk. Call only after the consumption
    /// side-effect (store update, retry enqueue) is durably committed.
    pub fn commit(&self, claimed: Claimed<T>) -> Result<()> {
        let path = self.item_path(claimed.seq);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.in_flight
            .lock()
            .expect("queue lock poisoned")
            .remove(&claimed.seq);
        Ok(())
    }

    /// Items currently on disk, claimed or not.
    pub fn len(&self) -> u64 {
        self.scan_sequences().map(|s| s.len() as u64).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn item_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}{ITEM_SUFFIX}"))
    }

    fn scan_sequences(&self) -> Result<BTreeSet<u64>> {
        let mut seqs = BTreeSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(seq) = parse_seq(&entry.file_name().to_string_lossy()) {
                seqs.insert(seq);
            }
        }
        Ok(seqs)
    }
}

fn parse_seq(file_name: &str) -> Option<u64> {
    file_name
        .strip_suffix(ITEM_SUFFIX)
        .and_then(|stem| stem.parse().ok())
}
