//! Replica sessions: one endpoint's handle on a collection.
//!
//! A session moves through `Unstarted -> Active -> {Done, Aborted}`. Data
//! operations are only valid while active. Results are pushed over channels:
//! fetches yield a [`FetchStream`] of individual records followed by one
//! completion, and stores report per-record outcomes to a [`StoreSink`].
//! All work for a session runs on its own [`SerialWorker`](worker::SerialWorker),
//! so operations on one session never run concurrently.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::bundle::RepositorySessionBundle;
use crate::error::{Result, SyncError};
use crate::record::{Collection, Record};

pub mod backend;
pub mod memory;
pub mod tracker;
pub mod worker;

pub use backend::{SessionBackend, StoreDisposition, WorkerSession};
pub use memory::MemoryRepository;
pub use tracker::StoreTracker;
pub use worker::SerialWorker;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, `begin` not yet called (or begin failed).
    Unstarted,
    /// Accepting data operations.
    Active,
    /// Terminated by `abort`.
    Aborted,
    /// Terminated by a successful `finish`.
    Done,
}

impl SessionStatus {
    /// True for `Aborted` and `Done`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Done)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::Active => "active",
            Self::Aborted => "aborted",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Shared, thread-safe session status enforcing the legal transitions.
#[derive(Debug)]
pub struct SessionState {
    status: Mutex<SessionStatus>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// A new, unstarted state.
    pub fn new() -> Self {
        Self {
            status: Mutex::new(SessionStatus::Unstarted),
        }
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// True while data operations are allowed.
    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    /// Fail with `InactiveSession` unless active.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SyncError::InactiveSession)
        }
    }

    /// Check that `begin` is allowed without changing state.
    pub fn check_begin(&self) -> Result<()> {
        self.check(SessionStatus::Unstarted, SessionStatus::Active)
    }

    /// `Unstarted -> Active`.
    pub fn begin(&self) -> Result<()> {
        self.transition(SessionStatus::Unstarted, SessionStatus::Active)
    }

    /// `Active -> Done`.
    pub fn finish(&self) -> Result<()> {
        self.transition(SessionStatus::Active, SessionStatus::Done)
    }

    /// Any non-terminal status to `Aborted`. Returns false if already terminal.
    pub fn abort(&self) -> bool {
        let mut status = self.status.lock();
        if status.is_terminal() {
            return false;
        }
        *status = SessionStatus::Aborted;
        true
    }

    fn check(&self, from: SessionStatus, to: SessionStatus) -> Result<()> {
        let status = self.status.lock();
        if *status != from {
            return Err(SyncError::InvalidSessionTransition {
                from: status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&self, from: SessionStatus, to: SessionStatus) -> Result<()> {
        let mut status = self.status.lock();
        if *status != from {
            return Err(SyncError::InvalidSessionTransition {
                from: status.to_string(),
                to: to.to_string(),
            });
        }
        *status = to;
        Ok(())
    }
}

/// One event of a fetch.
#[derive(Debug)]
pub enum FetchEvent {
    /// A fetched record.
    Record(Record),
    /// The fetch failed; no further events follow.
    Failed(SyncError),
    /// The fetch finished; `end` is the time captured before it started.
    Completed {
        /// Watermark to use for the next fetch from this replica.
        end: i64,
    },
}

/// Receiving end of a fetch. Records arrive one at a time over a bounded channel.
#[derive(Debug)]
pub struct FetchStream {
    rx: mpsc::Receiver<FetchEvent>,
}

impl FetchStream {
    /// Create a connected sender and stream with room for `capacity` buffered events.
    pub fn channel(capacity: usize) -> (FetchSender, FetchStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (FetchSender { tx }, FetchStream { rx })
    }

    /// A stream that completes immediately without records.
    pub fn completed(end: i64) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(FetchEvent::Completed { end });
        Self { rx }
    }

    /// A stream that fails immediately.
    pub fn failed(error: SyncError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(FetchEvent::Failed(error));
        Self { rx }
    }

    /// Next event, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<FetchEvent> {
        self.rx.recv().await
    }

    /// Drain the stream into a vector of records plus the terminal event.
    pub async fn collect(mut self) -> (Vec<Record>, Option<FetchEvent>) {
        let mut records = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                FetchEvent::Record(r) => records.push(r),
                terminal => return (records, Some(terminal)),
            }
        }
        (records, None)
    }
}

/// Producing end of a fetch.
#[derive(Debug, Clone)]
pub struct FetchSender {
    tx: mpsc::Sender<FetchEvent>,
}

impl FetchSender {
    /// Push a record from a blocking context. Returns false once the consumer is gone.
    pub fn blocking_record(&self, record: Record) -> bool {
        self.tx.blocking_send(FetchEvent::Record(record)).is_ok()
    }

    /// Report failure from a blocking context.
    pub fn blocking_fail(&self, error: SyncError) {
        let _ = self.tx.blocking_send(FetchEvent::Failed(error));
    }

    /// Report completion from a blocking context.
    pub fn blocking_complete(&self, end: i64) {
        let _ = self.tx.blocking_send(FetchEvent::Completed { end });
    }

    /// Push any event from async code. Returns false once the consumer is gone.
    pub async fn send(&self, event: FetchEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Per-record store outcome, plus the trailing completion.
#[derive(Debug)]
pub enum StoreEvent {
    /// The record was accepted by the sink.
    Stored {
        /// GUID of the stored record.
        guid: String,
    },
    /// The record could not be stored. The flow continues.
    Failed {
        /// GUID of the offending record.
        guid: String,
        /// Why the store failed.
        error: SyncError,
    },
    /// Every store issued before `store_done` has reported.
    Completed {
        /// Time at which the sink processed `store_done`.
        store_end: i64,
    },
}

/// Where a session reports store outcomes.
#[derive(Debug, Clone)]
pub struct StoreSink {
    tx: mpsc::UnboundedSender<StoreEvent>,
}

/// Receiving end of a [`StoreSink`].
#[derive(Debug)]
pub struct StoreEvents {
    rx: mpsc::UnboundedReceiver<StoreEvent>,
}

impl StoreSink {
    /// Create a connected sink and event receiver.
    pub fn channel() -> (StoreSink, StoreEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StoreSink { tx }, StoreEvents { rx })
    }

    /// Report a successful store.
    pub fn stored(&self, guid: impl Into<String>) {
        let _ = self.tx.send(StoreEvent::Stored { guid: guid.into() });
    }

    /// Report a failed store.
    pub fn failed(&self, guid: impl Into<String>, error: SyncError) {
        let _ = self.tx.send(StoreEvent::Failed {
            guid: guid.into(),
            error,
        });
    }

    /// Report store completion.
    pub fn completed(&self, store_end: i64) {
        let _ = self.tx.send(StoreEvent::Completed { store_end });
    }
}

impl StoreEvents {
    /// Next event, or `None` once every sink handle is dropped.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }
}

/// Bounds for a session's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Capacity of the serial task queue.
    pub worker_queue_capacity: usize,
    /// Capacity of each fetch's record channel.
    pub fetch_buffer: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            worker_queue_capacity: 64,
            fetch_buffer: 128,
        }
    }
}

/// One endpoint's handle on a collection.
#[async_trait]
pub trait RepositorySession: Send + Sync {
    /// The collection this session synchronizes.
    fn collection(&self) -> Collection;

    /// Current lifecycle status.
    fn status(&self) -> SessionStatus;

    /// Watermark this session was created with.
    fn last_sync_timestamp(&self) -> i64;

    /// Validate the underlying store and become active. Stays unstarted on failure.
    async fn begin(&self) -> Result<()>;

    /// The replica's clock. Records modified after this reading have a later
    /// timestamp.
    async fn now_ms(&self) -> Result<i64>;

    /// GUIDs of records modified at or after `timestamp`.
    async fn guids_since(&self, timestamp: i64) -> Result<Vec<String>>;

    /// Stream records modified at or after `timestamp`.
    async fn fetch_since(&self, timestamp: i64) -> Result<FetchStream>;

    /// Stream the records with the given GUIDs. Unknown GUIDs are skipped.
    async fn fetch(&self, guids: Vec<String>) -> Result<FetchStream>;

    /// Stream every record.
    async fn fetch_all(&self) -> Result<FetchStream>;

    /// Queue one record for storing; the outcome is reported to `sink`.
    async fn store(&self, record: Record, sink: &StoreSink) -> Result<()>;

    /// No more stores will be issued. `sink` receives `Completed` after every
    /// earlier store has reported.
    async fn store_done(&self, sink: &StoreSink) -> Result<()>;

    /// Destroy every record of the collection in this replica.
    async fn wipe(&self) -> Result<()>;

    /// True if anything changed since this session's watermark.
    async fn data_available(&self) -> Result<bool>;

    /// Become done and hand back the session's bundle.
    async fn finish(&self) -> Result<RepositorySessionBundle>;

    /// Terminate without finishing. Work still queued is dropped or fails.
    async fn abort(&self);
}

/// Factory for sessions on one replica.
pub trait Repository: Send + Sync {
    /// The collection this repository holds.
    fn collection(&self) -> Collection;

    /// Create a session starting from `bundle`, running its worker on `handle`.
    fn create_session(
        &self,
        bundle: RepositorySessionBundle,
        handle: &Handle,
    ) -> Result<Arc<dyn RepositorySession>>;
}
