//! Reference storage adapter backed by a BTreeMap.
//!
//! Models what an on-device database does for bookmarks: every row has a
//! parent local id. A row whose declared parent does not exist yet is filed
//! under `unfiled` and flagged, so a later insert of the parent can move it.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::record::{Collection, LocalId, Record, FALLBACK_ROOT, PLACES_ROOT, SPECIAL_FOLDERS};

#[derive(Debug, Clone)]
struct Row {
    record: Record,
    local_id: LocalId,
    parent: Option<LocalId>,
    misfiled: bool,
}

/// In-memory on-device store for one collection.
#[derive(Debug)]
pub struct MemoryStorageAdapter {
    collection: Collection,
    rows: BTreeMap<String, Row>,
    next_id: u64,
    fail_markers: HashSet<String>,
    fail_check: bool,
}

impl MemoryStorageAdapter {
    /// Empty store for `collection`.
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            rows: BTreeMap::new(),
            next_id: 1,
            fail_markers: HashSet::new(),
            fail_check: false,
        }
    }

    /// Make every write of a GUID containing `marker` fail.
    pub fn fail_writes_containing(&mut self, marker: impl Into<String>) {
        self.fail_markers.insert(marker.into());
    }

    /// Make `check` (and therefore session begin) fail.
    pub fn set_fail_check(&mut self, fail: bool) {
        self.fail_check = fail;
    }

    /// Place a record as-is, keeping its `last_modified`. For seeding fixtures.
    pub fn seed(&mut self, record: Record) -> LocalId {
        let local_id = self.allocate();
        self.put_row(record, local_id);
        local_id
    }

    /// Every record (tombstones included, roots excluded), ordered by GUID.
    pub fn records(&self) -> Vec<Record> {
        self.rows
            .values()
            .filter(|row| !is_root(&row.record.guid))
            .map(|row| row.record.clone())
            .collect()
    }

    /// Live records, roots excluded.
    pub fn live_records(&self) -> Vec<Record> {
        self.records().into_iter().filter(|r| !r.deleted).collect()
    }

    /// Record by GUID, roots included.
    pub fn get(&self, guid: &str) -> Option<Record> {
        self.rows.get(guid).map(|row| row.record.clone())
    }

    /// GUID of the folder a record currently sits in.
    pub fn placed_parent(&self, guid: &str) -> Option<String> {
        let parent = self.rows.get(guid)?.parent?;
        self.guid_for_local(parent).map(str::to_string)
    }

    /// Number of rows filed under the fallback root awaiting their parent.
    pub fn misfiled_count(&self) -> usize {
        self.rows.values().filter(|row| row.misfiled).count()
    }

    fn allocate(&mut self) -> LocalId {
        let id = LocalId(self.next_id);
        self.next_id += 1;
        id
    }

    fn check_writable(&self, guid: &str) -> Result<()> {
        if self.fail_markers.iter().any(|m| guid.contains(m.as_str())) {
            return Err(SyncError::adapter(format!("write rejected for {}", guid)));
        }
        Ok(())
    }

    fn guid_for_local(&self, local_id: LocalId) -> Option<&str> {
        self.rows
            .values()
            .find(|row| row.local_id == local_id)
            .map(|row| row.record.guid.as_str())
    }

    fn live_folder_id(&self, guid: &str) -> Option<LocalId> {
        self.rows
            .get(guid)
            .filter(|row| !row.record.deleted && row.record.is_folder())
            .map(|row| row.local_id)
    }

    fn placement(&self, record: &Record) -> (Option<LocalId>, bool) {
        if !self.collection.is_hierarchical() || record.guid == PLACES_ROOT {
            return (None, false);
        }
        let declared = match record.parent_id() {
            Some(p) => p,
            None => return (None, false),
        };
        match self.live_folder_id(declared) {
            Some(id) => (Some(id), false),
            None => {
                debug!(
                    guid = %record.guid,
                    parent = %declared,
                    "parent missing, filing under fallback root"
                );
                (self.live_folder_id(FALLBACK_ROOT), true)
            }
        }
    }

    fn put_row(&mut self, mut record: Record, local_id: LocalId) {
        record.local_id = Some(local_id);
        let (parent, misfiled) = self.placement(&record);
        self.rows.insert(
            record.guid.clone(),
            Row {
                record,
                local_id,
                parent,
                misfiled,
            },
        );
    }

    fn since(&self, timestamp: i64) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .rows
            .values()
            .filter(|row| row.record.last_modified >= timestamp && !is_root(&row.record.guid))
            .map(|row| row.record.clone())
            .collect();
        out.sort_by(|a, b| (a.last_modified, &a.guid).cmp(&(b.last_modified, &b.guid)));
        out
    }
}

fn is_root(guid: &str) -> bool {
    SPECIAL_FOLDERS.contains(&guid)
}

impl super::StorageAdapter for MemoryStorageAdapter {
    fn collection(&self) -> Collection {
        self.collection
    }

    fn check(&mut self) -> Result<()> {
        if self.fail_check {
            return Err(SyncError::adapter("store unavailable"));
        }
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
        for guid in guids {
            if let Some(row) = self.rows.get(guid) {
                if !visit(row.record.clone()) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn fetch_all(&mut self, visit: &mut dyn FnMut(Record) -> bool) -> Result<()> {
        self.fetch_since(i64::MIN, visit)
    }

    fn record_for_guid(&mut self, guid: &str) -> Result<Option<Record>> {
        Ok(self.rows.get(guid).map(|row| row.record.clone()))
    }

    fn insert(&mut self, record: &Record) -> Result<LocalId> {
        self.check_writable(&record.guid)?;
        if self.rows.contains_key(&record.guid) {
            return Err(SyncError::MultipleRecordsForGuid {
                guid: record.guid.clone(),
            });
        }
        let local_id = self.allocate();
        self.put_row(record.clone(), local_id);
        Ok(local_id)
    }

    fn insert_batch(&mut self, records: &[Record]) -> Result<Vec<LocalId>> {
        for record in records {
            self.check_writable(&record.guid)?;
            if self.rows.contains_key(&record.guid) {
                return Err(SyncError::MultipleRecordsForGuid {
                    guid: record.guid.clone(),
                });
            }
        }
        Ok(records
            .iter()
            .map(|record| {
                let local_id = self.allocate();
                self.put_row(record.clone(), local_id);
                local_id
            })
            .collect())
    }

    fn replace(&mut self, existing_guid: &str, record: &Record) -> Result<LocalId> {
        self.check_writable(&record.guid)?;
        let local_id = match self.rows.get(existing_guid) {
            Some(row) => row.local_id,
            None => {
                return Err(SyncError::adapter(format!(
                    "no record {} to replace",
                    existing_guid
                )))
            }
        };
        if let Some(requested) = record.local_id {
            if requested != local_id {
                return Err(SyncError::adapter(format!(
                    "local id {} does not match {} for {}",
                    requested, local_id, existing_guid
                )));
            }
        }
        if record.guid != existing_guid && self.rows.contains_key(&record.guid) {
            return Err(SyncError::MultipleRecordsForGuid {
                guid: record.guid.clone(),
            });
        }
        self.rows.remove(existing_guid);
        self.put_row(record.clone(), local_id);
        Ok(local_id)
    }

    fn delete(&mut self, guid: &str, timestamp: i64) -> Result<()> {
        self.check_writable(guid)?;
        let row = self
            .rows
            .get_mut(guid)
            .ok_or_else(|| SyncError::adapter(format!("no record {} to delete", guid)))?;
        let tombstone = Record::tombstone(guid, row.record.collection, timestamp);
        row.record = Record {
            local_id: Some(row.local_id),
            ..tombstone
        };
        row.misfiled = false;
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        warn!(collection = %self.collection, rows = self.rows.len(), "wiping local store");
        self.rows.clear();
        Ok(())
    }

    fn assigned_local_identity(&mut self, guid: &str) -> Result<Option<LocalId>> {
        Ok(self.rows.get(guid).map(|row| row.local_id))
    }

    fn ensure_roots(&mut self) -> Result<()> {
        if !self.collection.is_hierarchical() {
            return Ok(());
        }
        for guid in SPECIAL_FOLDERS {
            if self.rows.contains_key(guid) {
                continue;
            }
            let folder = Record::folder(guid, PLACES_ROOT, guid, Vec::new(), 0);
            let local_id = self.allocate();
            self.put_row(folder, local_id);
        }
        Ok(())
    }

    fn folder_guids(&mut self) -> Result<Vec<String>> {
        Ok(self
            .rows
            .values()
            .filter(|row| !row.record.deleted && row.record.is_folder())
            .map(|row| row.record.guid.clone())
            .collect())
    }

    fn update_parent(&mut self, guid: &str, parent: LocalId) -> Result<()> {
        let row = self
            .rows
            .get_mut(guid)
            .ok_or_else(|| SyncError::adapter(format!("no record {} to reparent", guid)))?;
        row.parent = Some(parent);
        row.misfiled = false;
        Ok(())
    }

    fn children_awaiting(&mut self, parent_guid: &str) -> Result<Vec<String>> {
        Ok(self
            .rows
            .values()
            .filter(|row| row.misfiled && row.record.parent_id() == Some(parent_guid))
            .map(|row| row.record.guid.clone())
            .collect())
    }

    fn children_of(&mut self, parent_guid: &str) -> Result<Vec<Record>> {
        let (parent_id, order) = match self.rows.get(parent_guid) {
            Some(row) => (
                row.local_id,
                row.record
                    .bookmark_payload()
                    .map(|b| b.children.clone())
                    .unwrap_or_default(),
            ),
            None => {
                return Err(SyncError::ParentNotFound {
                    guid: parent_guid.to_string(),
                    parent: parent_guid.to_string(),
                })
            }
        };
        let mut children: Vec<(usize, LocalId, Record)> = self
            .rows
            .values()
            .filter(|row| row.parent == Some(parent_id) && !row.record.deleted)
            .filter(|row| row.record.guid != parent_guid)
            .map(|row| {
                let position = order
                    .iter()
                    .position(|g| *g == row.record.guid)
                    .unwrap_or(usize::MAX);
                (position, row.local_id, row.record.clone())
            })
            .collect();
        children.sort_by_key(|(position, local_id, _)| (*position, *local_id));
        Ok(children.into_iter().map(|(_, _, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StorageAdapter;
    use crate::record::{MENU_ROOT, UNFILED_ROOT};

    fn bookmarks() -> MemoryStorageAdapter {
        let mut a = MemoryStorageAdapter::new(Collection::Bookmarks);
        a.ensure_roots().unwrap();
        a
    }

    mod flat {
        use super::*;

        #[test]
        fn test_insert_assigns_sequential_ids() {
            let mut a = MemoryStorageAdapter::new(Collection::History);
            let x = a.insert(&Record::tombstone("x", Collection::History, 1)).unwrap();
            let y = a.insert(&Record::tombstone("y", Collection::History, 1)).unwrap();
            assert!(y > x);
            assert_eq!(a.assigned_local_identity("x").unwrap(), Some(x));
        }

        #[test]
        fn test_duplicate_insert_rejected() {
            let mut a = MemoryStorageAdapter::new(Collection::History);
            a.insert(&Record::tombstone("x", Collection::History, 1)).unwrap();
            assert!(matches!(
                a.insert(&Record::tombstone("x", Collection::History, 2)),
                Err(SyncError::MultipleRecordsForGuid { .. })
            ));
        }

        #[test]
        fn test_replace_keeps_local_id_and_changes_guid() {
            let mut a = MemoryStorageAdapter::new(Collection::History);
            let id = a.insert(&Record::tombstone("old", Collection::History, 1)).unwrap();
            let replaced = a
                .replace("old", &Record::tombstone("new", Collection::History, 2))
                .unwrap();
            assert_eq!(id, replaced);
            assert!(a.get("old").is_none());
            assert_eq!(a.get("new").unwrap().local_id, Some(id));
        }

        #[test]
        fn test_failure_injection() {
            let mut a = MemoryStorageAdapter::new(Collection::History);
            a.fail_writes_containing("Fail");
            assert!(a.insert(&Record::tombstone("Fail1", Collection::History, 1)).is_err());
            let batch = vec![
                Record::tombstone("ok", Collection::History, 1),
                Record::tombstone("Fail2", Collection::History, 1),
            ];
            assert!(a.insert_batch(&batch).is_err());
            assert!(a.get("ok").is_none());
            a.set_fail_check(true);
            assert!(a.check().is_err());
        }

        #[test]
        fn test_delete_keeps_tombstone() {
            let mut a = MemoryStorageAdapter::new(Collection::History);
            let id = a.insert(&Record::bookmark("b", MENU_ROOT, "t", "u", 1)).unwrap();
            a.delete("b", 50).unwrap();
            let t = a.get("b").unwrap();
            assert!(t.deleted);
            assert_eq!(t.last_modified, 50);
            assert_eq!(t.local_id, Some(id));
        }
    }

    mod tree {
        use super::*;

        #[test]
        fn test_roots_hidden_from_since_queries() {
            let mut a = bookmarks();
            assert!(a.guids_since(0).unwrap().is_empty());
            assert!(a.get(UNFILED_ROOT).is_some());
            assert_eq!(a.folder_guids().unwrap().len(), SPECIAL_FOLDERS.len());
        }

        #[test]
        fn test_orphan_filed_under_fallback_then_reparented() {
            let mut a = bookmarks();
            a.insert(&Record::bookmark("c1", "f1", "c", "u", 1)).unwrap();
            assert_eq!(a.placed_parent("c1").as_deref(), Some(UNFILED_ROOT));
            assert_eq!(a.children_awaiting("f1").unwrap(), vec!["c1".to_string()]);

            let f = a
                .insert(&Record::folder("f1", MENU_ROOT, "F", vec!["c1".into()], 1))
                .unwrap();
            a.update_parent("c1", f).unwrap();
            assert_eq!(a.placed_parent("c1").as_deref(), Some("f1"));
            assert_eq!(a.misfiled_count(), 0);
        }

        #[test]
        fn test_children_follow_folder_order() {
            let mut a = bookmarks();
            a.insert(&Record::folder(
                "f",
                MENU_ROOT,
                "F",
                vec!["b".into(), "c".into(), "a".into()],
                1,
            ))
                .unwrap();
            for g in ["a", "b", "c"] {
                a.insert(&Record::bookmark(g, "f", g, "u", 1)).unwrap();
            }
            let order: Vec<String> =
                a.children_of("f").unwrap().into_iter().map(|r| r.guid).collect();
            assert_eq!(order, vec!["b", "c", "a"]);
        }

        #[test]
        fn test_children_of_unknown_folder() {
            let mut a = bookmarks();
            assert!(matches!(
                a.children_of("nope"),
                Err(SyncError::ParentNotFound { .. })
            ));
        }
    }
}
