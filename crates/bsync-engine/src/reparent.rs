//! Order-independent admission of tree-structured records.
//!
//! Records may arrive before the folder they belong to, or long after it. The
//! queue holds each record until its parent folder is known, then admits it
//! together with everything that was waiting on it (depth-first). Admitted
//! records gather in a ready list that is flushed to a [`TreeWriter`] once it
//! reaches the threshold: folders one at a time, since children need the
//! folder's local id, then leaves in batches.
//!
//! The queue is owned by a single session and touched only from its worker.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::Result;
use crate::record::{LocalId, Record, FALLBACK_ROOT, SPECIAL_FOLDERS};

/// Persists admitted records.
pub trait TreeWriter {
    /// Write one folder and return its local id.
    fn write_folder(&mut self, folder: &Record) -> Result<LocalId>;

    /// Write a batch of non-folder records.
    fn write_leaves(&mut self, leaves: &[Record]) -> Result<()>;
}

/// Result of [`ReparentingQueue::flush_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records written during the session.
    pub written: usize,
    /// Records whose parent never resolved and were filed under the fallback root.
    pub orphans: usize,
    /// GUIDs whose write failed.
    pub failed: Vec<String>,
}

/// Where a buffered record currently sits.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Waiting(String),
    Ready,
}

/// Buffers hierarchical records until their parent is known.
#[derive(Debug)]
pub struct ReparentingQueue {
    threshold: usize,
    written_folders: HashSet<String>,
    waiting_for_parent: HashMap<String, Vec<Record>>,
    ready_to_write: Vec<Record>,
    slots: HashMap<String, Slot>,
    failed: Vec<String>,
    written: usize,
}

impl ReparentingQueue {
    /// Create a queue flushing every `threshold` admitted records, seeded with
    /// the well-known roots.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            written_folders: SPECIAL_FOLDERS.iter().map(|g| g.to_string()).collect(),
            waiting_for_parent: HashMap::new(),
            ready_to_write: Vec::new(),
            slots: HashMap::new(),
            failed: Vec::new(),
            written: 0,
        }
    }

    /// Treat `guid` as an existing folder.
    pub fn mark_known(&mut self, guid: &str) {
        self.written_folders.insert(guid.to_string());
    }

    /// True if `guid` is a known folder.
    pub fn is_known(&self, guid: &str) -> bool {
        self.written_folders.contains(guid)
    }

    /// Number of records waiting on a parent.
    pub fn waiting_count(&self) -> usize {
        self.waiting_for_parent.values().map(Vec::len).sum()
    }

    /// Number of admitted records not yet written.
    pub fn ready_count(&self) -> usize {
        self.ready_to_write.len()
    }

    /// True if nothing is buffered.
    pub fn is_clear(&self) -> bool {
        self.waiting_for_parent.is_empty() && self.ready_to_write.is_empty()
    }

    /// Drop everything buffered. Known folders are kept.
    pub fn clear(&mut self) {
        self.waiting_for_parent.clear();
        self.ready_to_write.clear();
        self.slots.clear();
        self.failed.clear();
    }

    /// The buffered record stored under `guid`, if it has not been written yet.
    pub fn pending(&self, guid: &str) -> Option<&Record> {
        match self.slots.get(guid)? {
            Slot::Waiting(parent) => self
                .waiting_for_parent
                .get(parent)?
                .iter()
                .find(|r| r.guid == guid),
            Slot::Ready => self.ready_to_write.iter().find(|r| r.guid == guid),
        }
    }

    /// Remove the buffered record stored under `guid` and return it. Records
    /// waiting on it stay where they are.
    pub fn take_pending(&mut self, guid: &str) -> Option<Record> {
        match self.slots.remove(guid)? {
            Slot::Waiting(parent) => {
                let siblings = self.waiting_for_parent.get_mut(&parent)?;
                let pos = siblings.iter().position(|r| r.guid == guid)?;
                let record = siblings.remove(pos);
                if siblings.is_empty() {
                    self.waiting_for_parent.remove(&parent);
                }
                Some(record)
            }
            Slot::Ready => {
                let pos = self.ready_to_write.iter().position(|r| r.guid == guid)?;
                Some(self.ready_to_write.remove(pos))
            }
        }
    }

    /// Offer a record. It is admitted now if its parent is known, otherwise
    /// held. A buffered record with the same GUID is replaced.
    pub fn enqueue(&mut self, record: Record, writer: &mut impl TreeWriter) {
        self.take_pending(&record.guid);
        let parent = record.parent_id().unwrap_or(FALLBACK_ROOT).to_string();
        if !self.written_folders.contains(&parent) {
            debug!(guid = %record.guid, parent = %parent, "parent unknown, holding record");
            self.slots.insert(record.guid.clone(), Slot::Waiting(parent.clone()));
            self.waiting_for_parent.entry(parent).or_default().push(record);
            return;
        }
        self.admit(record);
        if self.ready_to_write.len() >= self.threshold {
            self.flush_ready(writer);
        }
    }

    /// A folder was written outside the queue; admit whatever waited on it.
    pub fn resolve(&mut self, guid: &str, writer: &mut impl TreeWriter) {
        self.mark_known(guid);
        if let Some(children) = self.waiting_for_parent.remove(guid) {
            for child in children {
                self.admit(child);
            }
        }
        if self.ready_to_write.len() >= self.threshold {
            self.flush_ready(writer);
        }
    }

    /// Write everything, filing subtrees whose parent never arrived under the
    /// fallback root. Their declared parent is kept, so a later session that
    /// stores the parent can move them.
    pub fn flush_all(&mut self, writer: &mut impl TreeWriter) -> FlushReport {
        let mut orphans = 0;
        while !self.waiting_for_parent.is_empty() {
            // Prefer a parent that is not itself held, so whole subtrees move
            // together. A cycle has no such parent; break it anywhere.
            let parent = {
                let held: HashSet<&str> = self
                    .waiting_for_parent
                    .values()
                    .flatten()
                    .map(|r| r.guid.as_str())
                    .collect();
                self.waiting_for_parent
                    .keys()
                    .find(|p| !held.contains(p.as_str()))
                    .or_else(|| self.waiting_for_parent.keys().next())
                    .cloned()
            };
            let Some(parent) = parent else { break };
            let children = self.waiting_for_parent.remove(&parent).unwrap_or_default();
            for child in children {
                warn!(
                    guid = %child.guid,
                    parent = %parent,
                    "parent never arrived, filing under fallback root"
                );
                orphans += 1;
                self.admit(child);
            }
        }
        self.flush_ready(writer);
        FlushReport {
            written: self.written,
            orphans,
            failed: std::mem::take(&mut self.failed),
        }
    }

    fn admit(&mut self, record: Record) {
        let mut stack = vec![record];
        while let Some(record) = stack.pop() {
            if record.is_folder() {
                self.written_folders.insert(record.guid.clone());
                if let Some(children) = self.waiting_for_parent.remove(&record.guid) {
                    stack.extend(children.into_iter().rev());
                }
            }
            self.slots.insert(record.guid.clone(), Slot::Ready);
            self.ready_to_write.push(record);
        }
    }

    fn flush_ready(&mut self, writer: &mut impl TreeWriter) {
        if self.ready_to_write.is_empty() {
            return;
        }
        let ready = std::mem::take(&mut self.ready_to_write);
        for record in &ready {
            self.slots.remove(&record.guid);
        }
        let (folders, leaves): (Vec<Record>, Vec<Record>) =
            ready.into_iter().partition(Record::is_folder);
        debug!(folders = folders.len(), leaves = leaves.len(), "flushing ready records");
        for folder in &folders {
            match writer.write_folder(folder) {
                Ok(_) => self.written += 1,
                Err(e) => {
                    warn!(guid = %folder.guid, error = %e, "folder write failed");
                    self.failed.push(folder.guid.clone());
                }
            }
        }
        for batch in leaves.chunks(self.threshold) {
            match writer.write_leaves(batch) {
                Ok(()) => self.written += batch.len(),
                Err(e) => {
                    warn!(count = batch.len(), error = %e, "leaf batch write failed");
                    self.failed.extend(batch.iter().map(|r| r.guid.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::record::MOBILE_ROOT;

    /// Records every write call as a list of GUIDs.
    #[derive(Default)]
    struct RecordingWriter {
        calls: Vec<Vec<String>>,
        next: u64,
        fail: HashSet<String>,
    }

    impl TreeWriter for RecordingWriter {
        fn write_folder(&mut self, folder: &Record) -> Result<LocalId> {
            if self.fail.contains(&folder.guid) {
                return Err(SyncError::adapter("boom"));
            }
            self.calls.push(vec![folder.guid.clone()]);
            self.next += 1;
            Ok(LocalId(self.next))
        }

        fn write_leaves(&mut self, leaves: &[Record]) -> Result<()> {
            if leaves.iter().any(|l| self.fail.contains(&l.guid)) {
                return Err(SyncError::adapter("boom"));
            }
            self.calls.push(leaves.iter().map(|l| l.guid.clone()).collect());
            Ok(())
        }
    }

    fn folder(guid: &str, parent: &str) -> Record {
        Record::folder(guid, parent, guid, Vec::new(), 1)
    }

    fn leaf(guid: &str, parent: &str) -> Record {
        Record::bookmark(guid, parent, guid, "https://example.com/", 1)
    }

    fn calls(w: &RecordingWriter) -> Vec<Vec<&str>> {
        w.calls
            .iter()
            .map(|c| c.iter().map(String::as_str).collect())
            .collect()
    }

    mod admission {
        use super::*;

        #[test]
        fn test_children_wait_for_folder() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("child1", "folder1"), &mut w);
            q.enqueue(leaf("child2", "folder1"), &mut w);
            assert_eq!(q.waiting_count(), 2);
            assert_eq!(q.ready_count(), 0);
            q.enqueue(folder("folder1", MOBILE_ROOT), &mut w);
            assert_eq!(q.waiting_count(), 0);
            assert_eq!(q.ready_count(), 3);
            assert!(w.calls.is_empty());
        }

        #[test]
        fn test_threshold_flush_writes_folders_then_batched_leaves() {
            let mut q = ReparentingQueue::new(3);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("child1", "folder1"), &mut w);
            q.enqueue(leaf("child2", "folder2"), &mut w);
            q.enqueue(leaf("child3", "folder1"), &mut w);
            q.enqueue(leaf("child4", "folder2"), &mut w);
            q.enqueue(folder("folder1", MOBILE_ROOT), &mut w);
            assert_eq!(calls(&w), vec![vec!["folder1"], vec!["child1", "child3"]]);
            q.enqueue(folder("folder2", MOBILE_ROOT), &mut w);
            assert_eq!(
                calls(&w),
                vec![
                    vec!["folder1"],
                    vec!["child1", "child3"],
                    vec!["folder2"],
                    vec!["child2", "child4"],
                ]
            );
            assert!(q.is_clear());
        }

        #[test]
        fn test_nested_subtree_admitted_depth_first() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("leaf", "inner"), &mut w);
            q.enqueue(folder("inner", "outer"), &mut w);
            q.enqueue(folder("outer", MOBILE_ROOT), &mut w);
            let report = q.flush_all(&mut w);
            assert_eq!(calls(&w), vec![vec!["outer"], vec!["inner"], vec!["leaf"]]);
            assert_eq!(report.written, 3);
            assert_eq!(report.orphans, 0);
        }

        #[test]
        fn test_requeued_guid_replaces_buffered_record() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("c", "missing"), &mut w);
            let mut moved = leaf("c", MOBILE_ROOT);
            moved.last_modified = 7;
            q.enqueue(moved, &mut w);
            assert_eq!(q.waiting_count(), 0);
            assert_eq!(q.ready_count(), 1);
            assert_eq!(q.pending("c").map(|r| r.last_modified), Some(7));
            let report = q.flush_all(&mut w);
            assert_eq!(calls(&w), vec![vec!["c"]]);
            assert_eq!(report.orphans, 0);
        }

        #[test]
        fn test_take_pending_from_either_list() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("held", "missing"), &mut w);
            q.enqueue(leaf("admitted", MOBILE_ROOT), &mut w);
            assert_eq!(q.pending("held").map(|r| r.guid.as_str()), Some("held"));
            assert_eq!(q.take_pending("held").map(|r| r.guid), Some("held".to_string()));
            assert_eq!(q.take_pending("admitted").map(|r| r.guid), Some("admitted".to_string()));
            assert!(q.take_pending("admitted").is_none());
            assert!(q.is_clear());
        }

        #[test]
        fn test_written_records_are_no_longer_pending() {
            let mut q = ReparentingQueue::new(1);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("a", MOBILE_ROOT), &mut w);
            assert_eq!(calls(&w), vec![vec!["a"]]);
            assert!(q.pending("a").is_none());
        }

        #[test]
        fn test_resolve_admits_waiting_children() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("c", "existing"), &mut w);
            q.resolve("existing", &mut w);
            assert_eq!(q.ready_count(), 1);
            assert!(q.is_known("existing"));
        }
    }

    mod flush_all {
        use super::*;

        #[test]
        fn test_orphans_written_under_fallback() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("a", "missing"), &mut w);
            q.enqueue(folder("f", "missing2"), &mut w);
            q.enqueue(leaf("b", "f"), &mut w);
            let report = q.flush_all(&mut w);
            assert_eq!(report.orphans, 2);
            assert_eq!(report.written, 3);
            assert!(q.is_clear());
        }

        #[test]
        fn test_cycle_is_broken() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            q.enqueue(folder("x", "y"), &mut w);
            q.enqueue(folder("y", "x"), &mut w);
            let report = q.flush_all(&mut w);
            assert_eq!(report.written, 2);
            assert_eq!(report.orphans, 1);
            assert!(q.is_clear());
        }

        #[test]
        fn test_write_failures_reported() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            w.fail.insert("bad".into());
            q.enqueue(folder("bad", MOBILE_ROOT), &mut w);
            q.enqueue(leaf("ok", MOBILE_ROOT), &mut w);
            let report = q.flush_all(&mut w);
            assert_eq!(report.failed, vec!["bad".to_string()]);
            assert_eq!(report.written, 1);
            let again = q.flush_all(&mut w);
            assert!(again.failed.is_empty());
        }

        #[test]
        fn test_clear_drops_buffered() {
            let mut q = ReparentingQueue::new(100);
            let mut w = RecordingWriter::default();
            q.enqueue(leaf("a", "missing"), &mut w);
            assert!(!q.is_clear());
            q.clear();
            assert!(q.is_clear());
        }
    }
}
