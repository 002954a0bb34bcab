//! Per-replica watermarks ("bundles") and their persistence hooks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::kvstore::KeyValueStore;
use crate::record::Collection;

/// Highest watermark successfully synchronized for one replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySessionBundle {
    /// Milliseconds since the epoch. Zero before the first successful sync.
    pub timestamp: i64,
}

impl RepositorySessionBundle {
    /// Create a bundle at `timestamp`.
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Raise the timestamp to `timestamp` if it is higher. Never lowers it.
    pub fn bump_timestamp(&mut self, timestamp: i64) {
        if timestamp > self.timestamp {
            self.timestamp = timestamp;
        }
    }

    /// Serialize to bincode bytes (for persistence).
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bincode bytes.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Which end of a synchronization a bundle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaSide {
    /// The shared server-side replica.
    Remote,
    /// The on-device replica.
    Local,
}

impl ReplicaSide {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

/// Loads and saves bundles through a host-provided key-value store.
#[derive(Clone)]
pub struct BundleStore {
    kv: Arc<dyn KeyValueStore>,
}

impl BundleStore {
    /// Create a bundle store over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> Arc<dyn KeyValueStore> {
        self.kv.clone()
    }

    fn key(collection: Collection, side: ReplicaSide) -> String {
        format!("bundle.{}.{}", collection.name(), side.as_str())
    }

    /// Load a bundle, or a zero bundle if none was saved yet.
    pub fn load_bundle(
        &self,
        collection: Collection,
        side: ReplicaSide,
    ) -> Result<RepositorySessionBundle> {
        match self.kv.get(&Self::key(collection, side))? {
            Some(bytes) => Ok(RepositorySessionBundle::from_bytes(&bytes)?),
            None => Ok(RepositorySessionBundle::default()),
        }
    }

    /// Persist a bundle.
    pub fn save_bundle(
        &self,
        collection: Collection,
        side: ReplicaSide,
        bundle: &RepositorySessionBundle,
    ) -> Result<()> {
        debug!(
            collection = %collection,
            side = side.as_str(),
            timestamp = bundle.timestamp,
            "saving bundle"
        );
        self.kv.put(&Self::key(collection, side), bundle.to_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKeyValueStore;

    mod bump {
        use super::*;

        #[test]
        fn test_bump_is_monotone() {
            let mut b = RepositorySessionBundle::new(10);
            b.bump_timestamp(5);
            assert_eq!(b.timestamp, 10);
            b.bump_timestamp(20);
            assert_eq!(b.timestamp, 20);
        }
    }

    mod store {
        use super::*;

        #[test]
        fn test_missing_bundle_is_zero() {
            let store = BundleStore::new(Arc::new(MemoryKeyValueStore::new()));
            let b = store.load_bundle(Collection::History, ReplicaSide::Remote).unwrap();
            assert_eq!(b.timestamp, 0);
        }

        #[test]
        fn test_sides_and_collections_are_independent() {
            let store = BundleStore::new(Arc::new(MemoryKeyValueStore::new()));
            store
                .save_bundle(
                    Collection::History,
                    ReplicaSide::Remote,
                    &RepositorySessionBundle::new(7),
                )
                .unwrap();
            store
                .save_bundle(
                    Collection::History,
                    ReplicaSide::Local,
                    &RepositorySessionBundle::new(9),
                )
                .unwrap();
            let loaded = store.load_bundle(Collection::History, ReplicaSide::Remote).unwrap();
            assert_eq!(loaded.timestamp, 7);
            let loaded = store.load_bundle(Collection::History, ReplicaSide::Local).unwrap();
            assert_eq!(loaded.timestamp, 9);
            let loaded = store.load_bundle(Collection::Bookmarks, ReplicaSide::Local).unwrap();
            assert_eq!(loaded.timestamp, 0);
        }

        #[test]
        fn test_corrupt_bundle_is_an_error() {
            let kv = Arc::new(MemoryKeyValueStore::new());
            kv.put("bundle.history.remote", vec![1]).unwrap();
            let store = BundleStore::new(kv);
            assert!(store.load_bundle(Collection::History, ReplicaSide::Remote).is_err());
        }
    }
}
