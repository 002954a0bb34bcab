//! The on-device replica: sessions over a [`StorageAdapter`].
//!
//! Storing a record looks the local copy up by GUID, then by fingerprint,
//! reconciles, and writes the survivor. Hierarchical inserts go through a
//! [`ReparentingQueue`] so children never reference a folder that does not
//! exist yet.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::adapter::StorageAdapter;
use crate::bundle::RepositorySessionBundle;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::fingerprint::FingerprintSpec;
use crate::reconcile::{reconcile, ReconcileDecision, ReconcileStats};
use crate::record::{Collection, LocalId, Record};
use crate::reparent::{ReparentingQueue, TreeWriter};
use crate::session::{
    Repository, RepositorySession, SessionBackend, SessionOptions, StoreDisposition, WorkerSession,
};

/// Tuning for local sessions.
#[derive(Debug, Clone)]
pub struct LocalOptions {
    /// Fields used to match records across GUIDs.
    pub fingerprint: FingerprintSpec,
    /// Ready-list size that triggers a reparenting flush.
    pub flush_threshold: usize,
    /// Worker and fetch buffer sizes.
    pub session: SessionOptions,
}

impl LocalOptions {
    /// Defaults for `collection`.
    pub fn for_collection(collection: Collection) -> Self {
        Self {
            fingerprint: FingerprintSpec::for_collection(collection),
            flush_threshold: 50,
            session: SessionOptions::default(),
        }
    }
}

/// On-device replica backed by a storage adapter shared by all its sessions.
pub struct LocalRepository<A: StorageAdapter> {
    collection: Collection,
    adapter: Arc<Mutex<A>>,
    clock: Arc<dyn Clock>,
    options: LocalOptions,
}

impl<A: StorageAdapter> LocalRepository<A> {
    /// Wrap `adapter`, stamping writes with `clock`.
    pub fn new(adapter: A, clock: Arc<dyn Clock>) -> Self {
        let collection = adapter.collection();
        Self {
            collection,
            adapter: Arc::new(Mutex::new(adapter)),
            clock,
            options: LocalOptions::for_collection(collection),
        }
    }

    /// Override the default options.
    pub fn with_options(mut self, options: LocalOptions) -> Self {
        self.options = options;
        self
    }

    /// Run `f` against the adapter. Must not be called while a fetch is being consumed
    /// on the same task.
    pub fn with_adapter<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut self.adapter.lock())
    }
}

impl<A: StorageAdapter> Repository for LocalRepository<A> {
    fn collection(&self) -> Collection {
        self.collection
    }

    fn create_session(
        &self,
        bundle: RepositorySessionBundle,
        handle: &Handle,
    ) -> Result<Arc<dyn RepositorySession>> {
        let backend = LocalBackend {
            collection: self.collection,
            adapter: self.adapter.clone(),
            clock: self.clock.clone(),
            index: FingerprintIndex::new(self.options.fingerprint.clone()),
            flush_threshold: self.options.flush_threshold,
            queue: None,
            pending_fingerprints: HashMap::new(),
            stats: ReconcileStats::default(),
            deferred_failures: Vec::new(),
            orphans: 0,
        };
        Ok(Arc::new(WorkerSession::spawn(
            "local",
            self.collection,
            bundle,
            backend,
            self.options.session,
            handle,
        )))
    }
}

/// Fingerprint to GUID map over live local records, built on first use.
struct FingerprintIndex {
    spec: FingerprintSpec,
    map: Option<HashMap<String, String>>,
}

impl FingerprintIndex {
    fn new(spec: FingerprintSpec) -> Self {
        Self { spec, map: None }
    }

    fn lookup<A: StorageAdapter>(
        &mut self,
        adapter: &mut A,
        record: &Record,
    ) -> Result<Option<String>> {
        let fingerprint = match self.spec.fingerprint(record) {
            Some(fp) => fp,
            None => return Ok(None),
        };
        if self.map.is_none() {
            let spec = &self.spec;
            let mut map = HashMap::new();
            adapter.fetch_all(&mut |r| {
                if let Some(fp) = spec.fingerprint(&r) {
                    map.insert(fp, r.guid);
                }
                true
            })?;
            debug!(entries = map.len(), "built fingerprint index");
            self.map = Some(map);
        }
        Ok(self.map.as_ref().and_then(|m| m.get(&fingerprint).cloned()))
    }

    fn remember(&mut self, record: &Record) {
        if let (Some(map), Some(fp)) = (self.map.as_mut(), self.spec.fingerprint(record)) {
            map.insert(fp, record.guid.clone());
        }
    }

    fn forget(&mut self, record: &Record) {
        if let (Some(map), Some(fp)) = (self.map.as_mut(), self.spec.fingerprint(record)) {
            if map.get(&fp) == Some(&record.guid) {
                map.remove(&fp);
            }
        }
    }

    fn reset(&mut self) {
        self.map = None;
    }
}

fn adopt_waiting_children<A: StorageAdapter>(
    adapter: &mut A,
    folder_guid: &str,
    folder: LocalId,
) -> Result<()> {
    let waiting = adapter.children_awaiting(folder_guid)?;
    if !waiting.is_empty() {
        info!(
            folder = %folder_guid,
            children = waiting.len(),
            "reparenting children filed under fallback root"
        );
    }
    for child in waiting {
        adapter.update_parent(&child, folder)?;
    }
    Ok(())
}

/// Writes admitted bookmarks through the adapter.
struct LocalTreeWriter<'a, A> {
    adapter: &'a mut A,
    index: &'a mut FingerprintIndex,
}

impl<'a, A: StorageAdapter> LocalTreeWriter<'a, A> {
    fn upsert(&mut self, record: &Record) -> Result<LocalId> {
        let id = match self.adapter.record_for_guid(&record.guid)? {
            Some(existing) => {
                self.index.forget(&existing);
                let replacement = record.copy_with_ids(&record.guid, existing.local_id);
                self.adapter.replace(&existing.guid, &replacement)?
            }
            None => self.adapter.insert(record)?,
        };
        self.index.remember(record);
        Ok(id)
    }
}

impl<'a, A: StorageAdapter> TreeWriter for LocalTreeWriter<'a, A> {
    fn write_folder(&mut self, folder: &Record) -> Result<LocalId> {
        let id = self.upsert(folder)?;
        adopt_waiting_children(&mut *self.adapter, &folder.guid, id)?;
        Ok(id)
    }

    fn write_leaves(&mut self, leaves: &[Record]) -> Result<()> {
        let mut fresh = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            if self.adapter.assigned_local_identity(&leaf.guid)?.is_some() {
                self.upsert(leaf)?;
            } else {
                fresh.push(leaf.clone());
            }
        }
        self.adapter.insert_batch(&fresh)?;
        for leaf in &fresh {
            self.index.remember(leaf);
        }
        Ok(())
    }
}

struct LocalBackend<A: StorageAdapter> {
    collection: Collection,
    adapter: Arc<Mutex<A>>,
    clock: Arc<dyn Clock>,
    index: FingerprintIndex,
    flush_threshold: usize,
    queue: Option<ReparentingQueue>,
    /// Fingerprint to GUID over records buffered in the queue.
    pending_fingerprints: HashMap<String, String>,
    stats: ReconcileStats,
    deferred_failures: Vec<String>,
    orphans: usize,
}

impl<A: StorageAdapter> LocalBackend<A> {
    fn seeded_queue(&self, adapter: &mut A) -> Result<ReparentingQueue> {
        adapter.ensure_roots()?;
        let mut queue = ReparentingQueue::new(self.flush_threshold);
        for guid in adapter.folder_guids()? {
            queue.mark_known(&guid);
        }
        Ok(queue)
    }

    /// Buffer `record` in the reparenting queue.
    fn enqueue(&mut self, record: Record, adapter: &mut A) {
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        if let Some(fp) = self.index.spec.fingerprint(&record) {
            self.pending_fingerprints.insert(fp, record.guid.clone());
        }
        let mut writer = LocalTreeWriter {
            adapter,
            index: &mut self.index,
        };
        queue.enqueue(record, &mut writer);
    }

    /// Take the still unwritten record buffered under `guid`.
    fn take_pending(&mut self, guid: &str) -> Option<Record> {
        let queued = self.queue.as_mut()?.take_pending(guid)?;
        if let Some(fp) = self.index.spec.fingerprint(&queued) {
            if self.pending_fingerprints.get(&fp).map(String::as_str) == Some(guid) {
                self.pending_fingerprints.remove(&fp);
            }
        }
        Some(queued)
    }

    /// Take an unwritten record with the same fingerprint as `record`.
    fn take_pending_twin(&mut self, record: &Record) -> Option<Record> {
        let fp = self.index.spec.fingerprint(record)?;
        let guid = self.pending_fingerprints.get(&fp)?.clone();
        let matches = self
            .queue
            .as_ref()
            .and_then(|q| q.pending(&guid))
            .and_then(|queued| self.index.spec.fingerprint(queued))
            .is_some_and(|queued_fp| queued_fp == fp);
        if !matches {
            self.pending_fingerprints.remove(&fp);
            return None;
        }
        self.take_pending(&guid)
    }

    /// Reconcile against a record that is still buffered and put the survivor
    /// back in the queue.
    fn store_over_pending(
        &mut self,
        record: Record,
        queued: Record,
        by_fingerprint: bool,
        adapter: &mut A,
    ) -> StoreDisposition {
        let decision = reconcile(&record, Some(&queued));
        self.stats.record(&decision, true);
        if by_fingerprint {
            self.stats.fingerprint_matches += 1;
        }
        debug!(
            guid = %record.guid,
            decision = decision.label(),
            by_fingerprint,
            "reconciled with buffered record"
        );

        let now = self.clock.now_ms();
        match decision {
            ReconcileDecision::Ignore => {
                self.enqueue(queued, adapter);
                StoreDisposition::Skipped
            }
            ReconcileDecision::KeepLocal(mut kept) => {
                if kept.guid != queued.guid {
                    kept.last_modified = now;
                }
                self.enqueue(kept, adapter);
                StoreDisposition::KeptLocal
            }
            // Never written, so there is nothing left to delete.
            ReconcileDecision::DeleteLocal(_) => StoreDisposition::Applied,
            ReconcileDecision::TakeIncoming(mut incoming) => {
                incoming.last_modified = now;
                self.enqueue(incoming, adapter);
                StoreDisposition::Applied
            }
        }
    }

    fn flush(&mut self) {
        let shared = self.adapter.clone();
        let mut guard = shared.lock();
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        let mut writer = LocalTreeWriter {
            adapter: &mut *guard,
            index: &mut self.index,
        };
        let report = queue.flush_all(&mut writer);
        self.pending_fingerprints.clear();
        if report.orphans > 0 {
            warn!(
                collection = %self.collection,
                orphans = report.orphans,
                "records filed under fallback root"
            );
        }
        self.orphans += report.orphans;
        self.deferred_failures.extend(report.failed);
    }
}

impl<A: StorageAdapter> SessionBackend for LocalBackend<A> {
    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn begin(&mut self) -> Result<()> {
        let shared = self.adapter.clone();
        let mut adapter = shared.lock();
        adapter.check()?;
        if self.collection.is_hierarchical() {
            self.queue = Some(self.seeded_queue(&mut adapter)?);
        }
        Ok(())
    }

    fn guids_since(&mut self, timestamp: i64) -> Result<Vec<String>> {
        self.adapter.lock().guids_since(timestamp)
    }

    fn fetch_since(&mut self, timestamp: i64, visit: &mut dyn FnMut(Record) -> bool) -> Result<()> {
        self.adapter.lock().fetch_since(timestamp, visit)
    }

    fn fetch(&mut self, guids: &[String], visit: &mut dyn FnMut(Record) -> bool) -> Result<()> {
        self.adapter.lock().fetch(guids, visit)
    }

    fn fetch_all(&mut self, visit: &mut dyn FnMut(Record) -> bool) -> Result<()> {
        self.adapter.lock().fetch_all(visit)
    }

    fn store(&mut self, record: Record) -> Result<StoreDisposition> {
        if let Some(bookmark) = record.bookmark_payload() {
            if !record.deleted && !bookmark.kind.is_supported() {
                debug!(
                    guid = %record.guid,
                    kind = bookmark.kind.as_str(),
                    "ignoring unsupported bookmark kind"
                );
                self.stats.ignored += 1;
                return Ok(StoreDisposition::Skipped);
            }
        }

        let shared = self.adapter.clone();
        let mut guard = shared.lock();
        let adapter = &mut *guard;

        let mut local = adapter.record_for_guid(&record.guid)?;
        let mut pending = None;
        if local.is_none() {
            pending = self.take_pending(&record.guid);
        }
        let mut by_fingerprint = false;
        if local.is_none() && pending.is_none() && !record.deleted {
            if let Some(guid) = self.index.lookup(&mut *adapter, &record)? {
                local = adapter.record_for_guid(&guid)?;
                by_fingerprint = local.is_some();
            }
            if local.is_none() {
                pending = self.take_pending_twin(&record);
                by_fingerprint = pending.is_some();
            }
        }
        if let Some(queued) = pending {
            return Ok(self.store_over_pending(record, queued, by_fingerprint, adapter));
        }

        let decision = reconcile(&record, local.as_ref());
        self.stats.record(&decision, local.is_some());
        if by_fingerprint {
            self.stats.fingerprint_matches += 1;
        }
        debug!(guid = %record.guid, decision = decision.label(), by_fingerprint, "reconciled");

        let now = self.clock.now_ms();
        let hierarchical = self.collection.is_hierarchical();
        match (decision, local) {
            (ReconcileDecision::Ignore, _) => Ok(StoreDisposition::Skipped),
            (ReconcileDecision::KeepLocal(mut kept), Some(local)) => {
                if kept.guid != local.guid {
                    kept.last_modified = now;
                    let id = adapter.replace(&local.guid, &kept)?;
                    self.index.forget(&local);
                    self.index.remember(&kept);
                    if hierarchical && kept.is_folder() {
                        adopt_waiting_children(&mut *adapter, &kept.guid, id)?;
                        if let Some(queue) = self.queue.as_mut() {
                            let mut writer = LocalTreeWriter {
                                adapter: &mut *adapter,
                                index: &mut self.index,
                            };
                            queue.resolve(&kept.guid, &mut writer);
                        }
                    }
                }
                Ok(StoreDisposition::KeptLocal)
            }
            (ReconcileDecision::DeleteLocal(_), Some(local)) => {
                adapter.delete(&local.guid, now)?;
                self.index.forget(&local);
                Ok(StoreDisposition::Applied)
            }
            (ReconcileDecision::TakeIncoming(mut incoming), Some(local)) => {
                incoming.last_modified = now;
                let id = adapter.replace(&local.guid, &incoming)?;
                self.index.forget(&local);
                self.index.remember(&incoming);
                if hierarchical && incoming.is_folder() {
                    adopt_waiting_children(&mut *adapter, &incoming.guid, id)?;
                    if let Some(queue) = self.queue.as_mut() {
                        let mut writer = LocalTreeWriter {
                            adapter: &mut *adapter,
                            index: &mut self.index,
                        };
                        queue.resolve(&incoming.guid, &mut writer);
                    }
                }
                Ok(StoreDisposition::Applied)
            }
            (ReconcileDecision::TakeIncoming(mut incoming), None) => {
                incoming.last_modified = now;
                if self.queue.is_some() {
                    self.enqueue(incoming, adapter);
                } else {
                    adapter.insert(&incoming)?;
                    self.index.remember(&incoming);
                }
                Ok(StoreDisposition::Applied)
            }
            (decision, None) => Err(SyncError::adapter(format!(
                "{} without a local record for {}",
                decision.label(),
                record.guid
            ))),
        }
    }

    fn store_done(&mut self) {
        self.flush();
    }

    fn wipe(&mut self) -> Result<()> {
        let shared = self.adapter.clone();
        let mut adapter = shared.lock();
        adapter.wipe()?;
        self.index.reset();
        self.pending_fingerprints.clear();
        if self.collection.is_hierarchical() {
            self.queue = Some(self.seeded_queue(&mut adapter)?);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush();
        info!(
            collection = %self.collection,
            inserted = self.stats.inserted,
            replaced = self.stats.replaced,
            kept_local = self.stats.kept_local,
            deleted = self.stats.deleted,
            ignored = self.stats.ignored,
            fingerprint_matches = self.stats.fingerprint_matches,
            "local session finished"
        );
        if self.orphans > 0 {
            let pending = SyncError::NeedsReparenting { count: self.orphans };
            warn!(collection = %self.collection, "{}", pending);
        }
        if !self.deferred_failures.is_empty() {
            return Err(SyncError::FinishFailed {
                msg: format!(
                    "{} deferred write(s) failed: {}",
                    self.deferred_failures.len(),
                    self.deferred_failures.join(", ")
                ),
            });
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(queue) = self.queue.as_mut() {
            queue.clear();
        }
        self.pending_fingerprints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryStorageAdapter;
    use crate::clock::ManualClock;
    use crate::record::{BookmarkKind, HistoryPayload, Payload, MENU_ROOT, UNFILED_ROOT};
    use crate::session::{StoreEvent, StoreSink};

    fn history(guid: &str, ts: i64, title: &str) -> Record {
        Record::new(
            guid,
            Collection::History,
            ts,
            Payload::History(HistoryPayload {
                title: title.into(),
                uri: format!("https://example.com/{}", title),
                visits: Vec::new(),
            }),
        )
    }

    fn repo(collection: Collection, start: i64) -> LocalRepository<MemoryStorageAdapter> {
        LocalRepository::new(
            MemoryStorageAdapter::new(collection),
            Arc::new(ManualClock::ticking(start, 1)),
        )
    }

    async fn store_all(
        session: &Arc<dyn RepositorySession>,
        records: Vec<Record>,
    ) -> Vec<StoreEvent> {
        let (sink, mut events) = StoreSink::channel();
        for r in records {
            session.store(r, &sink).await.unwrap();
        }
        session.store_done(&sink).await.unwrap();
        let mut out = Vec::new();
        while let Some(ev) = events.next().await {
            let done = matches!(ev, StoreEvent::Completed { .. });
            out.push(ev);
            if done {
                break;
            }
        }
        out
    }

    async fn open(repo: &LocalRepository<MemoryStorageAdapter>) -> Arc<dyn RepositorySession> {
        let session = repo
            .create_session(RepositorySessionBundle::default(), &Handle::current())
            .unwrap();
        session.begin().await.unwrap();
        session
    }

    mod flat {
        use super::*;

        #[tokio::test]
        async fn test_storing_twice_is_idempotent() {
            let repo = repo(Collection::History, 1_000);
            let session = open(&repo).await;
            store_all(&session, vec![history("a", 5, "t"), history("a", 5, "t")]).await;
            session.finish().await.unwrap();
            let live = repo.with_adapter(|a| a.live_records());
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].guid, "a");
        }

        #[tokio::test]
        async fn test_newer_incoming_keeps_local_id() {
            let repo = repo(Collection::History, 1_000);
            let id = repo.with_adapter(|a| a.seed(history("a", 10, "old")));
            let session = open(&repo).await;
            store_all(&session, vec![history("a", 20, "new")]).await;
            session.finish().await.unwrap();
            let stored = repo.with_adapter(|a| a.get("a")).unwrap();
            assert_eq!(stored.local_id, Some(id));
            assert_eq!(stored.payload, history("a", 20, "new").payload);
        }

        #[tokio::test]
        async fn test_late_tombstone_leaves_record_live() {
            let repo = repo(Collection::History, 1_000);
            repo.with_adapter(|a| a.seed(history("a", 10, "keep")));
            let session = open(&repo).await;
            store_all(&session, vec![Record::tombstone("a", Collection::History, 5)]).await;
            session.finish().await.unwrap();
            let stored = repo.with_adapter(|a| a.get("a")).unwrap();
            assert!(!stored.deleted);
            assert_eq!(stored.last_modified, 10);
        }

        #[tokio::test]
        async fn test_fingerprint_match_adopts_incoming_guid() {
            let repo = repo(Collection::History, 1_000);
            let id = repo.with_adapter(|a| a.seed(history("local", 1, "same")));
            let session = open(&repo).await;
            store_all(&session, vec![history("server", 2, "same")]).await;
            session.finish().await.unwrap();
            repo.with_adapter(|a| {
                assert!(a.get("local").is_none());
                assert_eq!(a.get("server").unwrap().local_id, Some(id));
            });
        }

        #[tokio::test]
        async fn test_begin_fails_when_store_unusable() {
            let repo = repo(Collection::History, 1_000);
            repo.with_adapter(|a| a.set_fail_check(true));
            let session = repo
                .create_session(RepositorySessionBundle::default(), &Handle::current())
                .unwrap();
            assert!(matches!(session.begin().await, Err(SyncError::BeginFailed { .. })));
            assert_eq!(session.status(), crate::session::SessionStatus::Unstarted);
        }

        #[tokio::test]
        async fn test_store_failure_reported_per_record() {
            let repo = repo(Collection::History, 1_000);
            repo.with_adapter(|a| a.fail_writes_containing("Fail"));
            let session = open(&repo).await;
            let events =
                store_all(&session, vec![history("ok", 1, "a"), history("Fail1", 1, "b")]).await;
            let failed: Vec<&str> = events
                .iter()
                .filter_map(|e| match e {
                    StoreEvent::Failed { guid, error } => {
                        assert!(
                            matches!(error, SyncError::StoreFailed { guid: g, .. } if g == guid),
                            "unexpected error {:?}",
                            error
                        );
                        Some(guid.as_str())
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(failed, vec!["Fail1"]);
            session.finish().await.unwrap();
        }

        #[tokio::test]
        async fn test_wipe_removes_everything() {
            let repo = repo(Collection::History, 1_000);
            repo.with_adapter(|a| a.seed(history("a", 1, "x")));
            let session = open(&repo).await;
            session.wipe().await.unwrap();
            assert!(session.guids_since(0).await.unwrap().is_empty());
            session.finish().await.unwrap();
        }
    }

    mod tree {
        use super::*;

        #[tokio::test]
        async fn test_children_before_folder_are_filed_correctly() {
            let repo = repo(Collection::Bookmarks, 1_000);
            let session = open(&repo).await;
            let children: Vec<String> = vec!["c1".into(), "c2".into()];
            store_all(
                &session,
                vec![
                    Record::bookmark("c2", "f", "two", "https://2/", 1),
                    Record::bookmark("c1", "f", "one", "https://1/", 1),
                    Record::folder("f", MENU_ROOT, "F", children, 1),
                ],
            )
            .await;
            session.finish().await.unwrap();
            let order: Vec<String> = repo.with_adapter(|a| {
                a.children_of("f").unwrap().into_iter().map(|r| r.guid).collect()
            });
            assert_eq!(order, vec!["c1", "c2"]);
        }

        fn child_guids(repo: &LocalRepository<MemoryStorageAdapter>, folder: &str) -> Vec<String> {
            repo.with_adapter(|a| {
                a.children_of(folder)
                    .unwrap()
                    .into_iter()
                    .map(|r| r.guid)
                    .collect()
            })
        }

        #[tokio::test]
        async fn test_newer_tombstone_drops_buffered_bookmark() {
            let repo = repo(Collection::Bookmarks, 1_000);
            let session = open(&repo).await;
            let events = store_all(
                &session,
                vec![
                    Record::bookmark("b", "later", "b", "https://b/", 1),
                    Record::tombstone("b", Collection::Bookmarks, 1_000_000),
                ],
            )
            .await;
            assert!(events.iter().all(|e| !matches!(e, StoreEvent::Failed { .. })));
            session.finish().await.unwrap();
            assert!(repo.with_adapter(|a| a.get("b")).is_none());
            assert_eq!(repo.with_adapter(|a| a.misfiled_count()), 0);
        }

        #[tokio::test]
        async fn test_older_duplicate_keeps_buffered_record() {
            let repo = repo(Collection::Bookmarks, 1_000);
            let session = open(&repo).await;
            store_all(
                &session,
                vec![
                    Record::bookmark("b", "later", "new", "https://new/", 50),
                    Record::bookmark("b", "later", "old", "https://old/", 5),
                    Record::folder("later", MENU_ROOT, "Later", vec!["b".into()], 60),
                ],
            )
            .await;
            session.finish().await.unwrap();
            assert_eq!(child_guids(&repo, "later"), vec!["b"]);
            let stored = repo.with_adapter(|a| a.get("b")).unwrap();
            assert_eq!(stored.bookmark_payload().unwrap().title, "new");
        }

        #[tokio::test]
        async fn test_newer_duplicate_replaces_buffered_record() {
            let repo = repo(Collection::Bookmarks, 1_000);
            let session = open(&repo).await;
            store_all(
                &session,
                vec![
                    Record::bookmark("b", "later", "old", "https://old/", 5),
                    Record::bookmark("b", MENU_ROOT, "moved", "https://moved/", 1_000_000),
                    Record::folder("later", MENU_ROOT, "Later", Vec::new(), 60),
                ],
            )
            .await;
            session.finish().await.unwrap();
            assert!(child_guids(&repo, "later").is_empty());
            assert_eq!(repo.with_adapter(|a| a.placed_parent("b")).as_deref(), Some(MENU_ROOT));
            assert_eq!(repo.with_adapter(|a| a.misfiled_count()), 0);
        }

        #[tokio::test]
        async fn test_buffered_fingerprint_twins_merge() {
            let repo = repo(Collection::Bookmarks, 1_000);
            let session = open(&repo).await;
            store_all(
                &session,
                vec![
                    Record::bookmark("one", "later", "same", "https://same/", 1),
                    Record::bookmark("two", "later", "same", "https://same/", 2),
                    Record::folder("later", MENU_ROOT, "Later", vec!["two".into()], 3),
                ],
            )
            .await;
            session.finish().await.unwrap();
            assert_eq!(child_guids(&repo, "later"), vec!["two"]);
            assert!(repo.with_adapter(|a| a.get("one")).is_none());
        }

        #[tokio::test]
        async fn test_orphan_reparented_by_later_session() {
            let repo = repo(Collection::Bookmarks, 1_000);
            let first = open(&repo).await;
            store_all(&first, vec![Record::bookmark("c", "late", "c", "https://c/", 1)]).await;
            first.finish().await.unwrap();
            assert_eq!(repo.with_adapter(|a| a.placed_parent("c")).as_deref(), Some(UNFILED_ROOT));

            let second = open(&repo).await;
            let folder = Record::folder("late", MENU_ROOT, "Late", vec!["c".into()], 2);
            store_all(&second, vec![folder]).await;
            second.finish().await.unwrap();
            assert_eq!(repo.with_adapter(|a| a.placed_parent("c")).as_deref(), Some("late"));
            assert_eq!(repo.with_adapter(|a| a.misfiled_count()), 0);
        }

        #[tokio::test]
        async fn test_unsupported_kind_acknowledged_not_written() {
            let repo = repo(Collection::Bookmarks, 1_000);
            let session = open(&repo).await;
            let mut livemark = Record::bookmark("lm", MENU_ROOT, "feed", "https://feed/", 1);
            livemark.bookmark_payload_mut().unwrap().kind = BookmarkKind::Livemark;
            let events = store_all(&session, vec![livemark]).await;
            assert!(matches!(events[0], StoreEvent::Stored { .. }));
            session.finish().await.unwrap();
            assert!(repo.with_adapter(|a| a.get("lm")).is_none());
        }

        #[tokio::test]
        async fn test_deferred_write_failure_fails_finish() {
            let repo = repo(Collection::Bookmarks, 1_000);
            repo.with_adapter(|a| a.fail_writes_containing("Fail"));
            let session = open(&repo).await;
            let failing = Record::bookmark("Fail1", MENU_ROOT, "x", "https://x/", 1);
            let events = store_all(&session, vec![failing]).await;
            // Accepted into the queue; the write only fails at flush.
            assert!(matches!(events[0], StoreEvent::Stored { .. }));
            assert!(matches!(session.finish().await, Err(SyncError::FinishFailed { .. })));
        }
    }
}
