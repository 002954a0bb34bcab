//! Generic session over a synchronous backend driven by a serial worker.
//!
//! A replica implements [`SessionBackend`] with plain blocking calls. A
//! [`WorkerSession`] wraps it with the lifecycle state machine, the store
//! tracker and the channel plumbing, and runs every call on its own
//! [`SerialWorker`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::bundle::RepositorySessionBundle;
use crate::error::{Result, SyncError};
use crate::record::{Collection, Record};

use super::tracker::StoreTracker;
use super::worker::SerialWorker;
use super::{
    FetchStream, RepositorySession, SessionOptions, SessionState, SessionStatus, StoreSink,
};

/// What a backend did with a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDisposition {
    /// The incoming content was written (inserted, replaced or deleted).
    Applied,
    /// The local record won; only identity fields may have changed.
    KeptLocal,
    /// Nothing to do (late tombstone, unsupported kind, ...).
    Skipped,
}

/// Blocking replica operations, only ever called from the session worker.
///
/// `visit` callbacks return false to stop the fetch early.
pub trait SessionBackend: Send + 'static {
    /// Current time on this replica's clock.
    fn now_ms(&self) -> i64;

    /// Validate the store.
    fn begin(&mut self) -> Result<()>;

    /// GUIDs modified at or after `timestamp`.
    fn guids_since(&mut self, timestamp: i64) -> Result<Vec<String>>;

    /// Visit records modified at or after `timestamp`.
    fn fetch_since(&mut self, timestamp: i64, visit: &mut dyn FnMut(Record) -> bool) -> Result<()>;

    /// Visit the records with the given GUIDs.
    fn fetch(&mut self, guids: &[String], visit: &mut dyn FnMut(Record) -> bool) -> Result<()>;

    /// Visit every record.
    fn fetch_all(&mut self, visit: &mut dyn FnMut(Record) -> bool) -> Result<()>;

    /// Store one record.
    fn store(&mut self, record: Record) -> Result<StoreDisposition>;

    /// Called once no more stores will be issued.
    fn store_done(&mut self) {}

    /// Destroy every record.
    fn wipe(&mut self) -> Result<()>;

    /// Final work before the session is done.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Discard pending work.
    fn abort(&mut self) {}
}

struct SessionCore<B> {
    backend: B,
    tracker: StoreTracker,
}

fn as_fetch_failure(error: SyncError) -> SyncError {
    match error {
        SyncError::FetchFailed { .. } => error,
        other => SyncError::FetchFailed {
            msg: other.to_string(),
        },
    }
}

/// A [`RepositorySession`] running a [`SessionBackend`] on a serial worker.
pub struct WorkerSession<B: SessionBackend> {
    collection: Collection,
    bundle: RepositorySessionBundle,
    state: Arc<SessionState>,
    worker: SerialWorker<SessionCore<B>>,
    fetch_buffer: usize,
}

impl<B: SessionBackend> WorkerSession<B> {
    /// Spawn the session's worker on `handle`.
    pub fn spawn(
        label: &str,
        collection: Collection,
        bundle: RepositorySessionBundle,
        backend: B,
        options: SessionOptions,
        handle: &Handle,
    ) -> Self {
        let core = SessionCore {
            backend,
            tracker: StoreTracker::new(),
        };
        let worker = SerialWorker::spawn(
            format!("{}/{}", collection, label),
            core,
            options.worker_queue_capacity,
            handle,
        );
        Self {
            collection,
            bundle,
            state: Arc::new(SessionState::new()),
            worker,
            fetch_buffer: options.fetch_buffer,
        }
    }

    async fn stream<F>(&self, run: F) -> Result<FetchStream>
    where
        F: FnOnce(&mut B, &mut dyn FnMut(Record) -> bool) -> Result<()> + Send + 'static,
    {
        self.state.ensure_active()?;
        let (tx, stream) = FetchStream::channel(self.fetch_buffer);
        let state = self.state.clone();
        let label = self.worker.label().to_string();
        self.worker
            .submit(move |core| {
                if !state.is_active() {
                    tx.blocking_fail(SyncError::InactiveSession);
                    return;
                }
                let SessionCore { backend, tracker } = core;
                let end = backend.now_ms();
                let mut delivered = 0usize;
                let mut visit = |record: Record| {
                    if tracker.is_tracked(&record.guid) {
                        return true;
                    }
                    delivered += 1;
                    tx.blocking_record(record)
                };
                match run(backend, &mut visit) {
                    Ok(()) => {
                        debug!(worker = %label, delivered, end, "fetch completed");
                        tx.blocking_complete(end);
                    }
                    Err(e) => {
                        warn!(worker = %label, delivered, error = %e, "fetch failed");
                        tx.blocking_fail(as_fetch_failure(e));
                    }
                }
            })
            .await?;
        Ok(stream)
    }
}

#[async_trait]
impl<B: SessionBackend> RepositorySession for WorkerSession<B> {
    fn collection(&self) -> Collection {
        self.collection
    }

    fn status(&self) -> SessionStatus {
        self.state.status()
    }

    fn last_sync_timestamp(&self) -> i64 {
        self.bundle.timestamp
    }

    async fn begin(&self) -> Result<()> {
        self.state.check_begin()?;
        match self.worker.call(|core| core.backend.begin()).await? {
            Ok(()) => {
                self.state.begin()?;
                debug!(
                    worker = %self.worker.label(),
                    since = self.bundle.timestamp,
                    "session active"
                );
                Ok(())
            }
            Err(e) => {
                warn!(worker = %self.worker.label(), error = %e, "session begin failed");
                Err(SyncError::BeginFailed { msg: e.to_string() })
            }
        }
    }

    async fn now_ms(&self) -> Result<i64> {
        self.state.ensure_active()?;
        self.worker.call(|core| core.backend.now_ms()).await
    }

    async fn guids_since(&self, timestamp: i64) -> Result<Vec<String>> {
        self.state.ensure_active()?;
        self.worker
            .call(move |core| {
                core.backend
                    .guids_since(timestamp)
                    .map(|guids| core.tracker.filter_guids(guids))
            })
            .await?
    }

    async fn fetch_since(&self, timestamp: i64) -> Result<FetchStream> {
        self.stream(move |backend, visit| backend.fetch_since(timestamp, visit))
            .await
    }

    async fn fetch(&self, guids: Vec<String>) -> Result<FetchStream> {
        self.stream(move |backend, visit| backend.fetch(&guids, visit))
            .await
    }

    async fn fetch_all(&self) -> Result<FetchStream> {
        self.stream(|backend, visit| backend.fetch_all(visit)).await
    }

    async fn store(&self, record: Record, sink: &StoreSink) -> Result<()> {
        self.state.ensure_active()?;
        let sink = sink.clone();
        let state = self.state.clone();
        self.worker
            .submit(move |core| {
                let guid = record.guid.clone();
                if !state.is_active() {
                    sink.failed(guid, SyncError::InactiveSession);
                    return;
                }
                match core.backend.store(record) {
                    Ok(StoreDisposition::Applied) => {
                        core.tracker.track(&guid);
                        sink.stored(guid);
                    }
                    Ok(_) => sink.stored(guid),
                    Err(e @ SyncError::StoreFailed { .. }) => sink.failed(guid, e),
                    Err(e) => {
                        let failure = SyncError::store_failed(guid.as_str(), e.to_string());
                        sink.failed(guid, failure);
                    }
                }
            })
            .await
    }

    async fn store_done(&self, sink: &StoreSink) -> Result<()> {
        self.state.ensure_active()?;
        let sink = sink.clone();
        self.worker
            .submit(move |core| {
                core.backend.store_done();
                sink.completed(core.backend.now_ms());
            })
            .await
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_active()?;
        info!(worker = %self.worker.label(), "wiping collection");
        self.worker
            .call(|core| {
                core.tracker = StoreTracker::new();
                core.backend.wipe()
            })
            .await?
    }

    async fn data_available(&self) -> Result<bool> {
        self.state.ensure_active()?;
        let since = self.bundle.timestamp;
        self.worker
            .call(move |core| {
                core.backend
                    .guids_since(since)
                    .map(|guids| !core.tracker.filter_guids(guids).is_empty())
            })
            .await?
    }

    async fn finish(&self) -> Result<RepositorySessionBundle> {
        let status = self.state.status();
        if status != SessionStatus::Active {
            return Err(SyncError::InvalidSessionTransition {
                from: status.to_string(),
                to: SessionStatus::Done.to_string(),
            });
        }
        let finished = self
            .worker
            .call(|core| core.backend.finish().map(|()| core.tracker.len()))
            .await?;
        match finished {
            Ok(stored) => {
                self.state.finish()?;
                debug!(worker = %self.worker.label(), stored, "session done");
                Ok(self.bundle)
            }
            Err(e) => {
                self.state.abort();
                warn!(worker = %self.worker.label(), error = %e, "session finish failed");
                Err(match e {
                    SyncError::FinishFailed { .. } => e,
                    other => SyncError::FinishFailed {
                        msg: other.to_string(),
                    },
                })
            }
        }
    }

    async fn abort(&self) {
        if self.state.abort() {
            debug!(worker = %self.worker.label(), "session aborted");
            let _ = self.worker.submit(|core| core.backend.abort()).await;
        }
    }
}
