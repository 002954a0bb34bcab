//! Last-writer-wins reconciliation of an incoming record against local state.
//!
//! Winner selection:
//! 1. Higher `last_modified` wins
//! 2. Equal timestamps keep the local record
//!
//! Whatever survives keeps the local record's local id (so UI references do
//! not dangle) and the incoming GUID (the server-visible identity).

use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Outcome of reconciling one incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileDecision {
    /// The local record stays. Carries it with the incoming GUID applied.
    KeepLocal(Record),
    /// Write the incoming record. Carries the local id when one exists.
    TakeIncoming(Record),
    /// Replace the local record with this tombstone.
    DeleteLocal(Record),
    /// Nothing to do.
    Ignore,
}

impl ReconcileDecision {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::KeepLocal(_) => "keep_local",
            Self::TakeIncoming(_) => "take_incoming",
            Self::DeleteLocal(_) => "delete_local",
            Self::Ignore => "ignore",
        }
    }
}

/// Decide between `incoming` and the matching `local` record, if any.
///
/// `local` may have been matched by GUID or by fingerprint; in the latter case
/// its GUID differs from the incoming one.
pub fn reconcile(incoming: &Record, local: Option<&Record>) -> ReconcileDecision {
    let local = match local {
        Some(local) => local,
        None if incoming.deleted => return ReconcileDecision::Ignore,
        None => return ReconcileDecision::TakeIncoming(incoming.clone()),
    };

    let incoming_newer = incoming.last_modified > local.last_modified;

    if incoming.deleted {
        if local.deleted || !incoming_newer {
            return ReconcileDecision::Ignore;
        }
        let tombstone = incoming.copy_with_ids(&incoming.guid, local.local_id);
        return ReconcileDecision::DeleteLocal(tombstone);
    }

    if incoming_newer {
        ReconcileDecision::TakeIncoming(incoming.copy_with_ids(&incoming.guid, local.local_id))
    } else {
        ReconcileDecision::KeepLocal(local.copy_with_ids(&incoming.guid, local.local_id))
    }
}

/// Counts of reconciliation outcomes over one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    /// Incoming records with no local match.
    pub inserted: u64,
    /// Local records replaced by newer incoming ones.
    pub replaced: u64,
    /// Local records that won.
    pub kept_local: u64,
    /// Local records turned into tombstones.
    pub deleted: u64,
    /// Incoming records ignored.
    pub ignored: u64,
    /// Matches found through the fingerprint index rather than GUID.
    pub fingerprint_matches: u64,
}

impl ReconcileStats {
    /// Count one decision. `had_local` distinguishes inserts from replacements.
    pub fn record(&mut self, decision: &ReconcileDecision, had_local: bool) {
        match decision {
            ReconcileDecision::TakeIncoming(_) if had_local => self.replaced += 1,
            ReconcileDecision::TakeIncoming(_) => self.inserted += 1,
            ReconcileDecision::KeepLocal(_) => self.kept_local += 1,
            ReconcileDecision::DeleteLocal(_) => self.deleted += 1,
            ReconcileDecision::Ignore => self.ignored += 1,
        }
    }

    /// Total decisions counted.
    pub fn total(&self) -> u64 {
        self.inserted + self.replaced + self.kept_local + self.deleted + self.ignored
    }
}
