//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bsync_engine::record::{HistoryPayload, Visit};
use bsync_engine::session::{FetchEvent, FetchStream, StoreEvent, StoreSink};
use bsync_engine::{
    BundleStore, Clock, Collection, LocalRepository, ManualClock, MemoryKeyValueStore,
    MemoryRepository, MemoryStorageAdapter, Payload, Record, Repository, RepositorySession,
    RepositorySessionBundle, Result, SessionStatus, SyncError,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;

/// GUIDs containing this marker fail to store while store faults are on.
pub const FAIL_MARKER: &str = "Fail";

/// Faults injected into every session of a [`FaultyRepository`].
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Fail stores of GUIDs containing this marker.
    pub fail_store_containing: Option<String>,
    /// Fail every fetch after this many records.
    pub fail_fetch_after: Option<usize>,
}

/// Runs once, right after a session lists GUIDs.
pub type ListingHook = Box<dyn FnOnce() + Send>;

/// Wraps a repository and injects faults into its sessions.
pub struct FaultyRepository {
    inner: Arc<dyn Repository>,
    faults: Arc<Mutex<Faults>>,
    after_listing: Arc<Mutex<Option<ListingHook>>>,
}

impl FaultyRepository {
    pub fn new(inner: Arc<dyn Repository>) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
            after_listing: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `hook` after the next `guids_since` on any session returns.
    pub fn after_next_listing(&self, hook: impl FnOnce() + Send + 'static) {
        *self.after_listing.lock() = Some(Box::new(hook));
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    pub fn clear_faults(&self) {
        self.set_faults(Faults::default());
    }
}

impl Repository for FaultyRepository {
    fn collection(&self) -> Collection {
        self.inner.collection()
    }

    fn create_session(
        &self,
        bundle: RepositorySessionBundle,
        handle: &Handle,
    ) -> Result<Arc<dyn RepositorySession>> {
        Ok(Arc::new(FaultySession {
            inner: self.inner.create_session(bundle, handle)?,
            faults: self.faults.lock().clone(),
            after_listing: self.after_listing.clone(),
        }))
    }
}

struct FaultySession {
    inner: Arc<dyn RepositorySession>,
    faults: Faults,
    after_listing: Arc<Mutex<Option<ListingHook>>>,
}

impl FaultySession {
    fn cut(&self, stream: FetchStream) -> FetchStream {
        match self.faults.fail_fetch_after {
            Some(after) => fail_after(stream, after),
            None => stream,
        }
    }
}

/// Pass `after` records through, then fail the fetch.
fn fail_after(mut stream: FetchStream, after: usize) -> FetchStream {
    let (tx, out) = FetchStream::channel(16);
    tokio::spawn(async move {
        let mut passed = 0;
        while let Some(event) = stream.next().await {
            match event {
                FetchEvent::Record(record) => {
                    if passed == after {
                        let _ = tx
                            .send(FetchEvent::Failed(SyncError::FetchFailed {
                                msg: "injected fetch failure".to_string(),
                            }))
                            .await;
                        return;
                    }
                    passed += 1;
                    if !tx.send(FetchEvent::Record(record)).await {
                        return;
                    }
                }
                terminal => {
                    let _ = tx.send(terminal).await;
                    return;
                }
            }
        }
    });
    out
}

#[async_trait]
impl RepositorySession for FaultySession {
    fn collection(&self) -> Collection {
        self.inner.collection()
    }

    fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    fn last_sync_timestamp(&self) -> i64 {
        self.inner.last_sync_timestamp()
    }

    async fn begin(&self) -> Result<()> {
        self.inner.begin().await
    }

    async fn now_ms(&self) -> Result<i64> {
        self.inner.now_ms().await
    }

    async fn guids_since(&self, timestamp: i64) -> Result<Vec<String>> {
        let guids = self.inner.guids_since(timestamp).await?;
        let hook = self.after_listing.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(guids)
    }

    async fn fetch_since(&self, timestamp: i64) -> Result<FetchStream> {
        Ok(self.cut(self.inner.fetch_since(timestamp).await?))
    }

    async fn fetch(&self, guids: Vec<String>) -> Result<FetchStream> {
        Ok(self.cut(self.inner.fetch(guids).await?))
    }

    async fn fetch_all(&self) -> Result<FetchStream> {
        Ok(self.cut(self.inner.fetch_all().await?))
    }

    async fn store(&self, record: Record, sink: &StoreSink) -> Result<()> {
        if let Some(marker) = &self.faults.fail_store_containing {
            if record.guid.contains(marker.as_str()) {
                let failure =
                    SyncError::store_failed(record.guid.as_str(), "injected store failure");
                sink.failed(record.guid, failure);
                return Ok(());
            }
        }
        self.inner.store(record, sink).await
    }

    async fn store_done(&self, sink: &StoreSink) -> Result<()> {
        self.inner.store_done(sink).await
    }

    async fn wipe(&self) -> Result<()> {
        self.inner.wipe().await
    }

    async fn data_available(&self) -> Result<bool> {
        self.inner.data_available().await
    }

    async fn finish(&self) -> Result<RepositorySessionBundle> {
        self.inner.finish().await
    }

    async fn abort(&self) {
        self.inner.abort().await
    }
}

/// A history record with a unique title and URI derived from `guid`.
pub fn history(guid: &str, last_modified: i64) -> Record {
    Record::new(
        guid,
        Collection::History,
        last_modified,
        Payload::History(HistoryPayload {
            title: format!("title {}", guid),
            uri: format!("https://example.com/{}", guid),
            visits: vec![Visit {
                date: last_modified,
                transition: 1,
            }],
        }),
    )
}

/// Remote, local and bundle store for one collection, sharing a ticking clock.
pub struct Replicas {
    pub clock: Arc<ManualClock>,
    pub remote: MemoryRepository,
    pub local: Arc<LocalRepository<MemoryStorageAdapter>>,
    pub bundles: BundleStore,
}

impl Replicas {
    pub fn new(collection: Collection) -> Self {
        let clock = Arc::new(ManualClock::ticking(1_000, 1));
        let shared: Arc<dyn Clock> = clock.clone();
        Self {
            remote: MemoryRepository::new(collection, shared.clone()),
            local: Arc::new(LocalRepository::new(
                MemoryStorageAdapter::new(collection),
                shared,
            )),
            bundles: BundleStore::new(Arc::new(MemoryKeyValueStore::new())),
            clock,
        }
    }

    /// Current local record under `guid`.
    pub fn local_record(&self, guid: &str) -> Option<Record> {
        self.local.with_adapter(|a| a.get(guid))
    }
}

/// Store `records` through `session` in order and return every outcome up to completion.
pub async fn store_all(
    session: &Arc<dyn RepositorySession>,
    records: Vec<Record>,
) -> Vec<StoreEvent> {
    let (sink, mut events) = StoreSink::channel();
    for record in records {
        session.store(record, &sink).await.unwrap();
    }
    session.store_done(&sink).await.unwrap();
    let mut out = Vec::new();
    while let Some(event) = events.next().await {
        let done = matches!(event, StoreEvent::Completed { .. });
        out.push(event);
        if done {
            break;
        }
    }
    out
}
