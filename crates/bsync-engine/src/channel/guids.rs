//! Outstanding-GUID bookkeeping for the retry-capable channel.
//!
//! A GUID enters when the source reports it changed and leaves once it is
//! stored. Store failures keep it for the next cycle, at most `max_retries`
//! times. Each cycle fetches only the newest `batch_size` outstanding GUIDs,
//! so a large backlog drains over several cycles.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::kvstore::KeyValueStore;
use crate::record::Collection;

/// Limits for the outstanding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Most GUIDs fetched per cycle.
    pub batch_size: usize,
    /// Failed stores tolerated before a GUID is dropped.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
        }
    }
}

/// Persisted set of GUIDs still to be delivered.
pub trait GuidsManager: Send + Sync {
    /// Add GUIDs the source reported as changed. Known GUIDs move to the newest end.
    fn add_fresh_guids(&self, guids: &[String]) -> Result<()>;

    /// The newest batch to fetch this cycle. Does not remove anything.
    fn next_guids(&self) -> Result<Vec<String>>;

    /// Forget GUIDs that were delivered (or can never be).
    fn remove_guids(&self, guids: &[String]) -> Result<()>;

    /// Count a failed delivery; GUIDs out of retries are dropped.
    fn retry_guids(&self, guids: &[String]) -> Result<()>;

    /// Number of GUIDs still outstanding.
    fn num_guids_remaining(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    guid: String,
    retries_remaining: u32,
}

/// The ordered set itself, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct GuidsState {
    entries: Vec<Entry>,
}

impl GuidsState {
    fn add_fresh(&mut self, guids: &[String], policy: &RetryPolicy) {
        // A GUID listed twice takes the position of its last occurrence.
        let mut seen = HashSet::with_capacity(guids.len());
        let mut fresh: Vec<&String> = guids
            .iter()
            .rev()
            .filter(|g| seen.insert(g.as_str()))
            .collect();
        fresh.reverse();
        self.entries.retain(|e| !seen.contains(e.guid.as_str()));
        self.entries.extend(fresh.into_iter().map(|guid| Entry {
            guid: guid.clone(),
            retries_remaining: policy.max_retries,
        }));
    }

    fn next(&self, policy: &RetryPolicy) -> Vec<String> {
        let start = self.entries.len().saturating_sub(policy.batch_size);
        self.entries[start..].iter().map(|e| e.guid.clone()).collect()
    }

    fn remove(&mut self, guids: &[String]) {
        let gone: HashSet<&str> = guids.iter().map(String::as_str).collect();
        self.entries.retain(|e| !gone.contains(e.guid.as_str()));
    }

    fn retry(&mut self, guids: &[String]) {
        let failed: HashSet<&str> = guids.iter().map(String::as_str).collect();
        let before = self.entries.len();
        self.entries.retain_mut(|e| {
            if failed.contains(e.guid.as_str()) {
                e.retries_remaining = e.retries_remaining.saturating_sub(1);
            }
            e.retries_remaining > 0
        });
        let dropped = before - self.entries.len();
        if dropped > 0 {
            warn!(dropped, "giving up on records that kept failing to store");
        }
    }

    fn retries_remaining(&self, guid: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.guid == guid)
            .map(|e| e.retries_remaining)
    }
}

/// Outstanding set kept in memory.
#[derive(Debug, Default)]
pub struct MemoryGuidsManager {
    policy: RetryPolicy,
    state: Mutex<GuidsState>,
}

impl MemoryGuidsManager {
    /// Empty manager with `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(GuidsState::default()),
        }
    }

    /// Every outstanding GUID, oldest first.
    pub fn guids(&self) -> Vec<String> {
        self.state.lock().entries.iter().map(|e| e.guid.clone()).collect()
    }

    /// Retries left for `guid`, if outstanding.
    pub fn retries_remaining(&self, guid: &str) -> Option<u32> {
        self.state.lock().retries_remaining(guid)
    }
}

impl GuidsManager for MemoryGuidsManager {
    fn add_fresh_guids(&self, guids: &[String]) -> Result<()> {
        self.state.lock().add_fresh(guids, &self.policy);
        Ok(())
    }

    fn next_guids(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().next(&self.policy))
    }

    fn remove_guids(&self, guids: &[String]) -> Result<()> {
        self.state.lock().remove(guids);
        Ok(())
    }

    fn retry_guids(&self, guids: &[String]) -> Result<()> {
        self.state.lock().retry(guids);
        Ok(())
    }

    fn num_guids_remaining(&self) -> Result<usize> {
        Ok(self.state.lock().entries.len())
    }
}

/// Outstanding set persisted through a key-value store, one key per collection.
pub struct PersistentGuidsManager {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    policy: RetryPolicy,
    lock: Mutex<()>,
}

impl PersistentGuidsManager {
    /// Manager for `collection` over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>, collection: Collection, policy: RetryPolicy) -> Self {
        Self {
            kv,
            key: format!("guids.{}", collection.name()),
            policy,
            lock: Mutex::new(()),
        }
    }

    /// Every outstanding GUID, oldest first.
    pub fn guids(&self) -> Result<Vec<String>> {
        Ok(self.load()?.entries.into_iter().map(|e| e.guid).collect())
    }

    fn load(&self) -> Result<GuidsState> {
        match self.kv.get(&self.key)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(GuidsState::default()),
        }
    }

    fn save(&self, state: &GuidsState) -> Result<()> {
        if state.entries.is_empty() {
            return self.kv.delete(&self.key);
        }
        self.kv.put(&self.key, serde_json::to_vec(state)?)
    }

    fn update(&self, f: impl FnOnce(&mut GuidsState)) -> Result<()> {
        let _guard = self.lock.lock();
        let mut state = self.load()?;
        f(&mut state);
        debug!(key = %self.key, outstanding = state.entries.len(), "saving outstanding guids");
        self.save(&state)
    }
}

impl GuidsManager for PersistentGuidsManager {
    fn add_fresh_guids(&self, guids: &[String]) -> Result<()> {
        let policy = self.policy;
        self.update(|s| s.add_fresh(guids, &policy))
    }

    fn next_guids(&self) -> Result<Vec<String>> {
        Ok(self.load()?.next(&self.policy))
    }

    fn remove_guids(&self, guids: &[String]) -> Result<()> {
        self.update(|s| s.remove(guids))
    }

    fn retry_guids(&self, guids: &[String]) -> Result<()> {
        self.update(|s| s.retry(guids))
    }

    fn num_guids_remaining(&self) -> Result<usize> {
        Ok(self.load()?.entries.len())
    }
}
