//! Bidirectional synchronization of one collection between two replicas.
//!
//! A cycle loads both bundles, opens a session on each replica, runs the
//! remote-to-local flow and then the local-to-remote flow, finishes both
//! sessions and only then persists the advanced bundles. Anything short of
//! that leaves both bundles where they were, so the next cycle repeats the
//! work (at-least-once delivery).

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bundle::{BundleStore, ReplicaSide, RepositorySessionBundle};
use crate::channel::{FlowReport, GuidsManager, PersistentGuidsManager, RecordsChannel, RetryPolicy};
use crate::error::{Result, SyncError};
use crate::record::Collection;
use crate::session::{Repository, RepositorySession};

/// Per-synchronizer behaviour.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Skip the cycle when neither replica changed and nothing is outstanding.
    pub skip_when_unchanged: bool,
    /// Retry failed remote-to-local stores in later cycles. `None` drops them.
    pub retry: Option<RetryPolicy>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            skip_when_unchanged: true,
            retry: None,
        }
    }
}

/// Current state of a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronizerState {
    /// No cycle has run yet.
    Idle,
    /// A cycle is in progress.
    Synchronizing,
    /// The last cycle completed and advanced both bundles.
    Synchronized,
    /// The last cycle found nothing to do.
    Skipped,
    /// The last cycle failed; bundles were not advanced.
    Failed,
    /// The last cycle was cancelled; bundles were not advanced.
    Aborted,
}

/// Counts for one direction of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Records fetched from the source.
    pub fetched: usize,
    /// Records stored into the sink.
    pub stored: usize,
    /// GUIDs whose store failed.
    pub failed_guids: Vec<String>,
}

impl From<&FlowReport> for FlowStats {
    fn from(report: &FlowReport) -> Self {
        Self {
            fetched: report.records_fetched,
            stored: report.records_stored,
            failed_guids: report.failed_guids(),
        }
    }
}

/// Summary of a successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Remote to local direction.
    pub remote_to_local: FlowStats,
    /// Local to remote direction.
    pub local_to_remote: FlowStats,
    /// Remote bundle persisted at the end of the cycle.
    pub remote_bundle: RepositorySessionBundle,
    /// Local bundle persisted at the end of the cycle.
    pub local_bundle: RepositorySessionBundle,
}

/// Terminal result of one cycle.
#[derive(Debug)]
pub enum SynchronizeOutcome {
    /// Both flows ran and both bundles advanced.
    Synchronized(SyncStats),
    /// Nothing changed on either side.
    Skipped,
    /// The cycle failed; bundles are unchanged.
    Failed(SyncError),
    /// The cycle was cancelled; bundles are unchanged.
    Aborted,
}

impl SynchronizeOutcome {
    /// Stats of a successful cycle.
    pub fn stats(&self) -> Option<&SyncStats> {
        match self {
            Self::Synchronized(stats) => Some(stats),
            _ => None,
        }
    }

    /// True for `Synchronized` and `Skipped`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Synchronized(_) | Self::Skipped)
    }

    fn state(&self) -> SynchronizerState {
        match self {
            Self::Synchronized(_) => SynchronizerState::Synchronized,
            Self::Skipped => SynchronizerState::Skipped,
            Self::Failed(_) => SynchronizerState::Failed,
            Self::Aborted => SynchronizerState::Aborted,
        }
    }
}

/// Drives the two flows of a cycle and owns the bundle bookkeeping.
pub struct Synchronizer {
    collection: Collection,
    remote: Arc<dyn Repository>,
    local: Arc<dyn Repository>,
    bundles: BundleStore,
    options: SyncOptions,
    guids: Option<Arc<dyn GuidsManager>>,
    state: Mutex<SynchronizerState>,
}

impl Synchronizer {
    /// Create a synchronizer. Both repositories must hold the same collection.
    /// With a retry policy, the outstanding-GUID set is persisted next to the bundles.
    pub fn new(
        remote: Arc<dyn Repository>,
        local: Arc<dyn Repository>,
        bundles: BundleStore,
        options: SyncOptions,
    ) -> Result<Self> {
        let collection = remote.collection();
        if local.collection() != collection {
            return Err(SyncError::Config {
                msg: format!(
                    "remote holds {} but local holds {}",
                    collection,
                    local.collection()
                ),
            });
        }
        let guids = options.retry.map(|policy| {
            Arc::new(PersistentGuidsManager::new(bundles.kv(), collection, policy))
                as Arc<dyn GuidsManager>
        });
        Ok(Self {
            collection,
            remote,
            local,
            bundles,
            options,
            guids,
            state: Mutex::new(SynchronizerState::Idle),
        })
    }

    /// Use `manager` for the outstanding-GUID set instead of the default.
    pub fn with_guids_manager(mut self, manager: Arc<dyn GuidsManager>) -> Self {
        self.guids = Some(manager);
        self
    }

    /// The collection being synchronized.
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// The outstanding-GUID set, if retries are enabled.
    pub fn guids_manager(&self) -> Option<Arc<dyn GuidsManager>> {
        self.guids.clone()
    }

    /// Current state.
    pub async fn state(&self) -> SynchronizerState {
        *self.state.lock().await
    }

    /// Run one cycle.
    pub async fn synchronize(&self) -> SynchronizeOutcome {
        self.synchronize_with(CancellationToken::new()).await
    }

    /// Run one cycle on `handle`'s runtime.
    pub fn spawn_on(
        self: Arc<Self>,
        handle: &Handle,
        cancel: CancellationToken,
    ) -> JoinHandle<SynchronizeOutcome> {
        handle.spawn(async move { self.synchronize_with(cancel).await })
    }

    /// Run one cycle, stopping early if `cancel` fires. A cancelled cycle
    /// aborts both sessions and neither finishes them nor saves bundles.
    pub async fn synchronize_with(&self, cancel: CancellationToken) -> SynchronizeOutcome {
        {
            let mut state = self.state.lock().await;
            if *state == SynchronizerState::Synchronizing {
                return SynchronizeOutcome::Failed(SyncError::InvalidSessionTransition {
                    from: "synchronizing".to_string(),
                    to: "synchronizing".to_string(),
                });
            }
            *state = SynchronizerState::Synchronizing;
        }

        let outcome = self.cycle(cancel).await;
        match &outcome {
            SynchronizeOutcome::Synchronized(stats) => info!(
                collection = %self.collection,
                inbound = stats.remote_to_local.stored,
                outbound = stats.local_to_remote.stored,
                remote_bundle = stats.remote_bundle.timestamp,
                local_bundle = stats.local_bundle.timestamp,
                "synchronized"
            ),
            SynchronizeOutcome::Skipped => {
                info!(collection = %self.collection, "nothing to synchronize")
            }
            SynchronizeOutcome::Failed(e) => error!(
                collection = %self.collection,
                error = %e,
                retryable = e.is_retryable(),
                "synchronization failed"
            ),
            SynchronizeOutcome::Aborted => {
                warn!(collection = %self.collection, "synchronization aborted")
            }
        }
        *self.state.lock().await = outcome.state();
        outcome
    }

    async fn cycle(&self, cancel: CancellationToken) -> SynchronizeOutcome {
        let handle = Handle::current();
        let sessions = self
            .bundles
            .load_bundle(self.collection, ReplicaSide::Remote)
            .and_then(|remote_bundle| {
                let local_bundle = self.bundles.load_bundle(self.collection, ReplicaSide::Local)?;
                Ok((
                    self.remote.create_session(remote_bundle, &handle)?,
                    self.local.create_session(local_bundle, &handle)?,
                ))
            });
        let (remote, local) = match sessions {
            Ok(pair) => pair,
            Err(e) => return SynchronizeOutcome::Failed(e),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                remote.abort().await;
                local.abort().await;
                SynchronizeOutcome::Aborted
            }
            result = self.run(&remote, &local) => match result {
                Ok(Some(stats)) => SynchronizeOutcome::Synchronized(stats),
                Ok(None) => SynchronizeOutcome::Skipped,
                Err(e) => {
                    remote.abort().await;
                    local.abort().await;
                    SynchronizeOutcome::Failed(e)
                }
            },
        }
    }

    async fn run(
        &self,
        remote: &Arc<dyn RepositorySession>,
        local: &Arc<dyn RepositorySession>,
    ) -> Result<Option<SyncStats>> {
        remote.begin().await?;
        local.begin().await?;

        if self.options.skip_when_unchanged {
            let outstanding = match &self.guids {
                Some(manager) => manager.num_guids_remaining()?,
                None => 0,
            };
            if outstanding == 0
                && !remote.data_available().await?
                && !local.data_available().await?
            {
                remote.abort().await;
                local.abort().await;
                return Ok(None);
            }
        }

        let inbound = match &self.guids {
            Some(manager) => {
                RecordsChannel::filling(remote.clone(), local.clone(), manager.clone())
            }
            None => RecordsChannel::new(remote.clone(), local.clone()),
        };
        let remote_to_local = inbound.flow().await?;
        if let Some(e) = remote_to_local.fetch_failure {
            return Err(e);
        }

        let local_to_remote = RecordsChannel::new(local.clone(), remote.clone()).flow().await?;
        if let Some(e) = local_to_remote.fetch_failure {
            return Err(e);
        }

        // A store end only covers the sink's changes if nothing else wrote to
        // it after its fetch started. Writes made by this cycle are tracked and
        // never listed here.
        let remote_settled = unchanged_since(remote, remote_to_local.fetch_end).await?;
        let local_settled = unchanged_since(local, local_to_remote.fetch_end).await?;

        let mut remote_bundle = remote.finish().await?;
        let mut local_bundle = local.finish().await?;
        remote_bundle.bump_timestamp(remote_to_local.fetch_end);
        local_bundle.bump_timestamp(local_to_remote.fetch_end);
        if remote_settled {
            remote_bundle.bump_timestamp(local_to_remote.store_end);
        } else {
            info!(
                collection = %self.collection,
                "remote changed during the cycle, holding its watermark"
            );
        }
        if local_settled {
            local_bundle.bump_timestamp(remote_to_local.store_end);
        } else {
            info!(
                collection = %self.collection,
                "local changed during the cycle, holding its watermark"
            );
        }

        self.bundles
            .save_bundle(self.collection, ReplicaSide::Remote, &remote_bundle)?;
        self.bundles
            .save_bundle(self.collection, ReplicaSide::Local, &local_bundle)?;

        Ok(Some(SyncStats {
            remote_to_local: FlowStats::from(&remote_to_local),
            local_to_remote: FlowStats::from(&local_to_remote),
            remote_bundle,
            local_bundle,
        }))
    }
}

/// True if `session` lists no foreign change at or after `since`.
async fn unchanged_since(session: &Arc<dyn RepositorySession>, since: i64) -> Result<bool> {
    Ok(session.guids_since(since).await?.is_empty())
}
