//! Durable FIFO queue of pending uploads.
//!
//! Every mutation rewrites the on-disk snapshot so a crash loses at most the
//! mutation that was in flight. The snapshot is a JSON array of records in
//! queue order, written to a temp file in the same directory and renamed
//! over the target, so readers never observe a torn write.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Result, UplinkError};

/// One pending file awaiting upload.
///
/// Immutable once created; the queue removes records by `id`, never by value
/// equality, since two files can coincidentally share local and remote
/// paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    id: Uuid,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub enqueued_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(local_path: PathBuf, remote_path: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_path,
            remote_path,
            enqueued_at: Utc::now(),
        }
    }

    /// Identity used by [`DurableQueue::remove`].
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Ordered collection of pending transfers, persisted after every mutation.
///
/// Safe for concurrent enqueue from the watcher task and dequeue from the
/// worker task; the internal mutex also serializes snapshot writes so
/// overlapping writers cannot corrupt the file.
#[derive(Debug)]
pub struct DurableQueue {
    snapshot_path: PathBuf,
    records: Mutex<VecDeque<TransferRecord>>,
}

impl DurableQueue {
    /// Open the queue, restoring any prior snapshot. A missing or corrupt
    /// snapshot yields an empty queue; corruption is logged, not fatal.
    pub fn open(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let records = match load_snapshot(&snapshot_path) {
            Ok(Some(records)) => {
                debug!(
                    path = %snapshot_path.display(),
                    pending = records.len(),
                    "restored queue snapshot"
                );
                records
            }
            Ok(None) => VecDeque::new(),
            Err(err) => {
                warn!(
                    path = %snapshot_path.display(),
                    error = %err,
                    "queue snapshot unreadable, starting empty"
                );
                VecDeque::new()
            }
        };

        Self {
            snapshot_path,
            records: Mutex::new(records),
        }
    }

    /// Append a record and persist the new state before returning.
    ///
    /// A persist failure is logged but does not fail the enqueue: a file we
    /// already detected must not be dropped from the current run because of
    /// a transient snapshot I/O hiccup. The record is then at risk only
    /// across a crash.
    pub fn enqueue(&self, record: TransferRecord) {
        let mut records = self.records.lock().expect("queue mutex poisoned");
        records.push_back(record);
        self.persist(&records);
    }

    /// Clone of the earliest record, or [`UplinkError::QueueEmpty`].
    pub fn peek(&self) -> Result<TransferRecord> {
        let records = self.records.lock().expect("queue mutex poisoned");
        records.front().cloned().ok_or(UplinkError::QueueEmpty)
    }

    /// Remove the record with the given identity and persist. Returns false
    /// when no such record remains (e.g. it was already confirmed).
    pub fn remove(&self, id: Uuid) -> bool {
        let mut records = self.records.lock().expect("queue mutex poisoned");
        let Some(index) = records.iter().position(|record| record.id == id) else {
            return false;
        };
        records.remove(index);
        self.persist(&records);
        true
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, records: &VecDeque<TransferRecord>) {
        if let Err(err) = write_snapshot(&self.snapshot_path, records) {
            error!(
                path = %self.snapshot_path.display(),
                error = %err,
                "failed to persist queue snapshot"
            );
        }
    }
}

fn load_snapshot(path: &Path) -> Result<Option<VecDeque<TransferRecord>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let records = serde_json::from_reader(BufReader::new(file))?;
    Ok(Some(records))
}

fn write_snapshot(path: &Path, records: &VecDeque<TransferRecord>) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => NamedTempFile::new_in(dir)?,
        None => NamedTempFile::new_in(".")?,
    };
    serde_json::to_writer(&mut tmp, records)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
