//! Tracks GUIDs stored during a session so they are not fetched back out.
//!
//! The second flow of a cycle reads from the replica the first flow wrote to.
//! Without tracking, every record just applied would be echoed straight back.

use std::collections::HashSet;

/// GUIDs written into a session.
#[derive(Debug, Default)]
pub struct StoreTracker {
    stored: HashSet<String>,
}

impl StoreTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `guid` was written in this session.
    pub fn track(&mut self, guid: &str) {
        self.stored.insert(guid.to_string());
    }

    /// True if `guid` was written in this session.
    pub fn is_tracked(&self, guid: &str) -> bool {
        self.stored.contains(guid)
    }

    /// Keep only the GUIDs that were not written in this session.
    pub fn filter_guids(&self, guids: Vec<String>) -> Vec<String> {
        guids.into_iter().filter(|g| !self.is_tracked(g)).collect()
    }

    /// Number of tracked GUIDs.
    pub fn len(&self) -> usize {
        self.stored.len()
    }

    /// True if nothing was tracked.
    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }
}
