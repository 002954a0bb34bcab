//! Storage adapter boundary for on-device stores.
//!
//! An adapter is a plain blocking handle on one collection of the local store.
//! It is only called from a session worker, so implementations need no
//! internal synchronization. Adapters store what they are given: stamping
//! `last_modified` is the session's job.

use crate::error::Result;
use crate::record::{Collection, LocalId, Record};

pub mod memory;

pub use memory::MemoryStorageAdapter;

/// Blocking access to one collection of the on-device store.
pub trait StorageAdapter: Send + 'static {
    /// The collection this adapter serves.
    fn collection(&self) -> Collection;

    /// Validate that the store is usable.
    fn check(&mut self) -> Result<()>;

    /// GUIDs of records modified at or after `timestamp`.
    fn guids_since(&mut self, timestamp: i64) -> Result<Vec<String>>;

    /// Visit records modified at or after `timestamp`, oldest first.
    fn fetch_since(&mut self, timestamp: i64, visit: &mut dyn FnMut(Record) -> bool) -> Result<()>;

    /// Visit the records with the given GUIDs. Unknown GUIDs are skipped.
    fn fetch(&mut self, guids: &[String], visit: &mut dyn FnMut(Record) -> bool) -> Result<()>;

    /// Visit every record.
    fn fetch_all(&mut self, visit: &mut dyn FnMut(Record) -> bool) -> Result<()>;

    /// The record stored under `guid`, with its local id set.
    fn record_for_guid(&mut self, guid: &str) -> Result<Option<Record>>;

    /// Insert a new record and return its assigned local id.
    fn insert(&mut self, record: &Record) -> Result<LocalId>;

    /// Insert several records. Either all are written or none.
    fn insert_batch(&mut self, records: &[Record]) -> Result<Vec<LocalId>> {
        records.iter().map(|r| self.insert(r)).collect()
    }

    /// Replace the record stored under `existing_guid`, keeping its local id.
    /// The replacement may carry a different GUID.
    fn replace(&mut self, existing_guid: &str, record: &Record) -> Result<LocalId>;

    /// Turn the record under `guid` into a tombstone modified at `timestamp`.
    fn delete(&mut self, guid: &str, timestamp: i64) -> Result<()>;

    /// Remove every record of the collection.
    fn wipe(&mut self) -> Result<()>;

    /// Local id of the record under `guid`, if any.
    fn assigned_local_identity(&mut self, guid: &str) -> Result<Option<LocalId>>;

    /// Create the well-known folders if they are missing. No-op for flat collections.
    fn ensure_roots(&mut self) -> Result<()> {
        Ok(())
    }

    /// GUIDs of every live folder, roots included.
    fn folder_guids(&mut self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.fetch_all(&mut |r| {
            if !r.deleted && r.is_folder() {
                out.push(r.guid);
            }
            true
        })?;
        Ok(out)
    }

    /// Attach the record under `guid` to the folder with local id `parent`.
    fn update_parent(&mut self, guid: &str, parent: LocalId) -> Result<()>;

    /// GUIDs of records that declare `parent_guid` as parent but were filed
    /// under the fallback root because it was missing when they were written.
    fn children_awaiting(&mut self, parent_guid: &str) -> Result<Vec<String>>;

    /// Live children of a folder in display order.
    fn children_of(&mut self, parent_guid: &str) -> Result<Vec<Record>>;
}
