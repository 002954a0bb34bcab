//! In-memory server-like replica.
//!
//! Behaves like the shared storage service: the last write to a GUID wins by
//! arrival, every stored record is stamped with the server clock, and
//! tombstones are kept so other devices learn about deletions.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::debug;

use crate::bundle::RepositorySessionBundle;
use crate::clock::Clock;
use crate::error::Result;
use crate::record::{Collection, Record};

use super::backend::{SessionBackend, StoreDisposition, WorkerSession};
use super::{Repository, RepositorySession, SessionOptions};

type Shared = Arc<Mutex<BTreeMap<String, Record>>>;

/// Server-like replica held in memory. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryRepository {
    collection: Collection,
    records: Shared,
    clock: Arc<dyn Clock>,
    options: SessionOptions,
}

impl MemoryRepository {
    /// Empty repository for `collection` stamping writes with `clock`.
    pub fn new(collection: Collection, clock: Arc<dyn Clock>) -> Self {
        Self {
            collection,
            records: Arc::new(Mutex::new(BTreeMap::new())),
            clock,
            options: SessionOptions::default(),
        }
    }

    /// Override worker and fetch buffer sizes.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Place a record as-is, keeping its `last_modified`. For seeding fixtures.
    pub fn seed(&self, record: Record) {
        let mut record = record;
        record.local_id = None;
        self.records.lock().insert(record.guid.clone(), record);
    }

    /// Every record, tombstones included, ordered by GUID.
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().values().cloned().collect()
    }

    /// Live records only.
    pub fn live_records(&self) -> Vec<Record> {
        self.records
            .lock()
            .values()
            .filter(|r| !r.deleted)
            .cloned()
            .collect()
    }

    /// Record by GUID.
    pub fn get(&self, guid: &str) -> Option<Record> {
        self.records.lock().get(guid).cloned()
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True if the repository holds nothing.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Repository for MemoryRepository {
    fn collection(&self) -> Collection {
        self.collection
    }

    fn create_session(
        &self,
        bundle: RepositorySessionBundle,
        handle: &Handle,
    ) -> Result<Arc<dyn RepositorySession>> {
        let backend = MemoryBackend {
            records: self.records.clone(),
            clock: self.clock.clone(),
        };
        Ok(Arc::new(WorkerSession::spawn(
            "remote",
            self.collection,
            bundle,
            backend,
            self.options,
            handle,
        )))
    }
}

struct MemoryBackend {
    records: Shared,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    fn since(&self, timestamp: i64) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .records
            .lock()
            .values()
            .filter(|r| r.last_modified >= timestamp)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.last_modified, &a.guid).cmp(&(b.last_modified, &b.guid)));
        out
    }
}

impl SessionBackend for MemoryBackend {
    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn guids_since(&mut self, timestamp: i64) -> Result<Vec<String>> {
        Ok(self.since(timestamp).into_iter().map(|r| r.guid).collect())
    }

    fn fetch_since(&mut self, timestamp: i64, visit: &mut dyn FnMut(Record) -> bool) -> Result<()> {
        for record in self.since(timestamp) {
            if !visit(record) {
                break;
            }
        }
        Ok(())
    }

    fn fetch(&mut self, guids: &[String], visit: &mut dyn FnMut(Record) -> bool) -> Result<()> {
        let found: Vec<Record> = {
            let records = self.records.lock();
            guids.iter().filter_map(|g| records.get(g).cloned()).collect()
        };
        for record in found {
            if !visit(record) {
                break;
            }
        }
        Ok(())
    }

    fn fetch_all(&mut self, visit: &mut dyn FnMut(Record) -> bool) -> Result<()> {
        self.fetch_since(i64::MIN, visit)
    }

    fn store(&mut self, record: Record) -> Result<StoreDisposition> {
        let mut record = record;
        record.local_id = None;
        record.last_modified = self.clock.now_ms();
        debug!(guid = %record.guid, deleted = record.deleted, "remote store");
        self.records.lock().insert(record.guid.clone(), record);
        Ok(StoreDisposition::Applied)
    }

    fn wipe(&mut self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }
}
