#![warn(missing_docs)]

//! bsync: bidirectional synchronization of browser data (bookmarks, history,
//! form history, passwords, tabs, clients) between a remote and a local replica.

pub mod adapter;
pub mod bundle;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod kvstore;
pub mod local;
pub mod reconcile;
pub mod record;
pub mod reparent;
pub mod session;
pub mod synchronizer;

pub use adapter::{MemoryStorageAdapter, StorageAdapter};
pub use bundle::{BundleStore, ReplicaSide, RepositorySessionBundle};
pub use channel::{
    FlowReport, GuidsManager, MemoryGuidsManager, PersistentGuidsManager, RecordsChannel,
    RetryPolicy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CollectionConfig, LogFormat, SyncConfig};
pub use error::{Result, SyncError};
pub use fingerprint::{FingerprintField, FingerprintSpec};
pub use kvstore::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use local::{LocalOptions, LocalRepository};
pub use reconcile::{reconcile, ReconcileDecision, ReconcileStats};
pub use record::{Collection, LocalId, Payload, Record};
pub use session::{MemoryRepository, Repository, RepositorySession, SessionOptions, SessionStatus};
pub use synchronizer::{
    FlowStats, SyncOptions, SyncStats, SynchronizeOutcome, Synchronizer, SynchronizerState,
};
