//! Error types for the synchronization engine.

use thiserror::Error;

/// Errors that can occur while synchronizing a collection.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A data operation was issued against a session that is not active.
    #[error("session is not active")]
    InactiveSession,

    /// A lifecycle call was made from a state that does not allow it.
    #[error("invalid session transition from {from} to {to}")]
    InvalidSessionTransition {
        /// State the session was in.
        from: String,
        /// State the caller asked for.
        to: String,
    },

    /// A session could not be started.
    #[error("session begin failed: {msg}")]
    BeginFailed {
        /// Error message describing the failure.
        msg: String,
    },

    /// Fetching records from a source failed.
    #[error("fetch failed: {msg}")]
    FetchFailed {
        /// Error message describing the failure.
        msg: String,
    },

    /// Storing a single record failed.
    #[error("store failed for {guid}: {msg}")]
    StoreFailed {
        /// GUID of the offending record.
        guid: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// A session could not be finished.
    #[error("session finish failed: {msg}")]
    FinishFailed {
        /// Error message describing the failure.
        msg: String,
    },

    /// More than one local record carries the same GUID.
    #[error("multiple local records for guid {guid}")]
    MultipleRecordsForGuid {
        /// The duplicated GUID.
        guid: String,
    },

    /// A hierarchical record referenced a parent that cannot be resolved.
    #[error("parent {parent} not found for {guid}")]
    ParentNotFound {
        /// GUID of the child record.
        guid: String,
        /// GUID of the missing parent.
        parent: String,
    },

    /// Records were filed under the fallback root and still await their parent.
    #[error("{count} record(s) still need reparenting")]
    NeedsReparenting {
        /// Number of records filed under the fallback root.
        count: usize,
    },

    /// The storage adapter rejected an operation.
    #[error("storage adapter error: {msg}")]
    Adapter {
        /// Error message describing the issue.
        msg: String,
    },

    /// The key-value store backing bundles and retry state failed.
    #[error("key-value store error: {msg}")]
    KeyValue {
        /// Error message describing the issue.
        msg: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// A session worker has shut down and no longer accepts work.
    #[error("session worker closed")]
    WorkerClosed,

    /// Binary serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// JSON serialization/deserialization error.
    #[error("json error")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Shorthand for an adapter error.
    pub fn adapter(msg: impl Into<String>) -> Self {
        Self::Adapter { msg: msg.into() }
    }

    /// Shorthand for a per-record store failure.
    pub fn store_failed(guid: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StoreFailed {
            guid: guid.into(),
            msg: msg.into(),
        }
    }

    /// Returns true for errors caused by calling an operation in the wrong session state.
    pub fn is_session_state(&self) -> bool {
        matches!(
            self,
            Self::InactiveSession | Self::InvalidSessionTransition { .. }
        )
    }

    /// Returns true if a later sync cycle is expected to recover from this error
    /// without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed { .. }
                | Self::StoreFailed { .. }
                | Self::Adapter { .. }
                | Self::NeedsReparenting { .. }
                | Self::Io(_)
        )
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, SyncError>;
