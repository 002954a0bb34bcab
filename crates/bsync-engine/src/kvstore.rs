//! Key-value store backing persisted sync state (bundles and outstanding GUIDs).
//!
//! The host provides the store; the engine only needs point reads and writes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Key-value store for persisted sync state.
pub trait KeyValueStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store. Does not persist across restarts.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON map file.
///
/// Every mutation rewrites the whole file through a sibling temp file and a
/// rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl FileKeyValueStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content).map_err(|e| SyncError::KeyValue {
                    msg: format!("corrupt state file {}: {}", path.display(), e),
                })?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), keys = data.len(), "opened key-value store");
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` to a temporary file, sync it, then move it over the store.
    fn persist(&self, data: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(data)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Apply `change` to a copy of the map and keep it only once it is on disk.
    fn commit(&self, change: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> bool) -> Result<()> {
        let mut data = self.data.write();
        let mut next = data.clone();
        if !change(&mut next) {
            return Ok(());
        }
        self.persist(&next)?;
        *data = next;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.commit(|data| {
            data.insert(key.to_string(), value);
            true
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.commit(|data| data.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_put_get_delete() {
        let kv = MemoryKeyValueStore::new();
        assert!(kv.is_empty());
        kv.put("a", vec![1, 2]).unwrap();
        assert_eq!(kv.get("a").unwrap(), Some(vec![1, 2]));
        kv.put("a", vec![3]).unwrap();
        assert_eq!(kv.get("a").unwrap(), Some(vec![3]));
        kv.delete("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
        kv.delete("missing").unwrap();
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let kv = FileKeyValueStore::open(&path).unwrap();
            kv.put("bundle", vec![7, 8, 9]).unwrap();
            kv.put("gone", vec![1]).unwrap();
            kv.delete("gone").unwrap();
        }
        let kv = FileKeyValueStore::open(&path).unwrap();
        assert_eq!(kv.get("bundle").unwrap(), Some(vec![7, 8, 9]));
        assert_eq!(kv.get("gone").unwrap(), None);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state");
        std::fs::create_dir(&nested).unwrap();
        let kv = FileKeyValueStore::open(nested.join("kv.json")).unwrap();
        kv.put("kept", vec![1]).unwrap();

        std::fs::remove_dir_all(&nested).unwrap();
        assert!(kv.put("lost", vec![2]).is_err());
        assert_eq!(kv.get("lost").unwrap(), None);
        assert!(kv.delete("kept").is_err());
        assert_eq!(kv.get("kept").unwrap(), Some(vec![1]));
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        let err = FileKeyValueStore::open(&path).unwrap_err();
        assert!(matches!(err, SyncError::KeyValue { .. }));
    }
}
