//! Engine configuration, loaded from TOML or JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::fingerprint::{FingerprintField, FingerprintSpec};
use crate::local::LocalOptions;
use crate::record::Collection;
use crate::session::SessionOptions;
use crate::synchronizer::SyncOptions;

/// Log output format for the `bsync` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Per-collection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Which collection.
    pub name: Collection,
    /// Fingerprint fields; `None` uses the collection default, empty disables matching.
    #[serde(default)]
    pub fingerprint_fields: Option<Vec<FingerprintField>>,
    /// Retry failed inbound stores in later cycles.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Ready-list size that triggers a reparenting flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

fn default_flush_threshold() -> usize {
    50
}

impl CollectionConfig {
    /// Defaults for `name`.
    pub fn new(name: Collection) -> Self {
        Self {
            name,
            fingerprint_fields: None,
            retry: None,
            flush_threshold: default_flush_threshold(),
        }
    }

    /// Effective fingerprint.
    pub fn fingerprint_spec(&self) -> FingerprintSpec {
        match &self.fingerprint_fields {
            Some(fields) => FingerprintSpec::new(fields.clone()),
            None => FingerprintSpec::for_collection(self.name),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// File holding bundles and outstanding-GUID sets.
    pub state_path: PathBuf,
    /// Directory of remote replica fixtures, one `<collection>.json` each.
    pub remote_dir: PathBuf,
    /// Directory of local replica fixtures, one `<collection>.json` each.
    pub local_dir: PathBuf,
    /// Capacity of each session's serial task queue.
    pub worker_queue_capacity: usize,
    /// Capacity of each fetch's record channel.
    pub fetch_buffer: usize,
    /// Skip cycles when neither side changed.
    pub skip_when_unchanged: bool,
    /// Log output format.
    pub log_format: LogFormat,
    /// Collections to synchronize, in order.
    pub collections: Vec<CollectionConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("bsync-state.json"),
            remote_dir: PathBuf::from("remote"),
            local_dir: PathBuf::from("local"),
            worker_queue_capacity: 64,
            fetch_buffer: 128,
            skip_when_unchanged: true,
            log_format: LogFormat::Text,
            collections: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Load from `path`, picking the format from the extension, then validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SyncConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SyncError::Config {
                msg: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(SyncError::Config {
                    msg: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_queue_capacity == 0 || self.fetch_buffer == 0 {
            return Err(SyncError::Config {
                msg: "worker_queue_capacity and fetch_buffer must be positive".to_string(),
            });
        }
        for (i, c) in self.collections.iter().enumerate() {
            if self.collections[..i].iter().any(|o| o.name == c.name) {
                return Err(SyncError::Config {
                    msg: format!("collection {} configured twice", c.name),
                });
            }
            if c.flush_threshold == 0 {
                return Err(SyncError::Config {
                    msg: format!("{}: flush_threshold must be positive", c.name),
                });
            }
            if let Some(retry) = &c.retry {
                if retry.batch_size == 0 || retry.max_retries == 0 {
                    return Err(SyncError::Config {
                        msg: format!(
                            "{}: retry batch_size and max_retries must be positive",
                            c.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Settings for `collection`, or its defaults if not listed.
    pub fn collection(&self, collection: Collection) -> CollectionConfig {
        self.collections
            .iter()
            .find(|c| c.name == collection)
            .cloned()
            .unwrap_or_else(|| CollectionConfig::new(collection))
    }

    /// Worker bounds shared by all sessions.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            worker_queue_capacity: self.worker_queue_capacity,
            fetch_buffer: self.fetch_buffer,
        }
    }

    /// Options for local sessions of `collection`.
    pub fn local_options(&self, collection: Collection) -> LocalOptions {
        let c = self.collection(collection);
        LocalOptions {
            fingerprint: c.fingerprint_spec(),
            flush_threshold: c.flush_threshold,
            session: self.session_options(),
        }
    }

    /// Synchronizer options for `collection`.
    pub fn sync_options(&self, collection: Collection) -> SyncOptions {
        SyncOptions {
            skip_when_unchanged: self.skip_when_unchanged,
            retry: self.collection(collection).retry,
        }
    }

    /// Remote fixture file for `collection`.
    pub fn remote_fixture(&self, collection: Collection) -> PathBuf {
        self.remote_dir.join(format!("{}.json", collection.name()))
    }

    /// Local fixture file for `collection`.
    pub fn local_fixture(&self, collection: Collection) -> PathBuf {
        self.local_dir.join(format!("{}.json", collection.name()))
    }
}
