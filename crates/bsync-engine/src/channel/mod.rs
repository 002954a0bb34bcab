//! Record channels: one direction of a sync.
//!
//! A channel fetches the changed set from a source session and stores each
//! record into a sink session as it arrives. Fetch and store are pipelined:
//! the source worker, the sink worker and this flow run independently and
//! only meet at individual record hand-offs. Per-record store failures are
//! collected, never fatal. The flow reports exactly one [`FlowReport`].

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::session::{FetchEvent, FetchStream, RepositorySession, StoreEvent, StoreSink};

pub mod accounting;
pub mod guids;

pub use accounting::StoreAccounting;
pub use guids::{GuidsManager, MemoryGuidsManager, PersistentGuidsManager, RetryPolicy};

/// Outcome of one flow.
#[derive(Debug, Default)]
pub struct FlowReport {
    /// Records delivered by the source.
    pub records_fetched: usize,
    /// Records the sink reported as stored.
    pub records_stored: usize,
    /// GUIDs the sink reported as stored.
    pub stored_guids: Vec<String>,
    /// Per-record store failures.
    pub store_failures: Vec<(String, SyncError)>,
    /// Set if the fetch failed part-way. Stores already made are kept.
    pub fetch_failure: Option<SyncError>,
    /// Source watermark for the next cycle: captured before the fetch started.
    /// Equals the input watermark if the fetch failed.
    pub fetch_end: i64,
    /// Time the sink processed `store_done`.
    pub store_end: i64,
}

impl FlowReport {
    /// GUIDs whose store failed.
    pub fn failed_guids(&self) -> Vec<String> {
        self.store_failures.iter().map(|(g, _)| g.clone()).collect()
    }

    /// True if the fetch completed and every store succeeded.
    pub fn is_clean(&self) -> bool {
        self.fetch_failure.is_none() && self.store_failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct Outcomes {
    stored: Vec<String>,
    failures: Vec<(String, SyncError)>,
}

/// Pumps records from a source session into a sink session.
pub struct RecordsChannel {
    source: Arc<dyn RepositorySession>,
    sink: Arc<dyn RepositorySession>,
    guids: Option<Arc<dyn GuidsManager>>,
}

impl RecordsChannel {
    /// Plain channel: fetch everything changed since the source watermark.
    pub fn new(source: Arc<dyn RepositorySession>, sink: Arc<dyn RepositorySession>) -> Self {
        Self {
            source,
            sink,
            guids: None,
        }
    }

    /// Retry-capable channel: fetch by GUID from the outstanding set, which is
    /// topped up from the source and drained by successful stores.
    pub fn filling(
        source: Arc<dyn RepositorySession>,
        sink: Arc<dyn RepositorySession>,
        guids: Arc<dyn GuidsManager>,
    ) -> Self {
        Self {
            source,
            sink,
            guids: Some(guids),
        }
    }

    /// Begin both sessions, then flow. A begin failure is returned as the error
    /// and no flow happens.
    pub async fn begin_and_flow(&self) -> Result<FlowReport> {
        if let Err(e) = self.source.begin().await {
            warn!(error = %e, "source session failed to begin");
            return Err(e);
        }
        if let Err(e) = self.sink.begin().await {
            warn!(error = %e, "sink session failed to begin");
            return Err(e);
        }
        self.flow().await
    }

    /// Run the flow on already active sessions.
    pub async fn flow(&self) -> Result<FlowReport> {
        let since = self.source.last_sync_timestamp();
        let collection = self.source.collection();
        debug!(collection = %collection, since, filling = self.guids.is_some(), "flow starting");

        let (mut stream, requested, listed_at) = match &self.guids {
            None => (self.source.fetch_since(since).await?, None, None),
            Some(manager) => {
                let (stream, requested, listed_at) = self.fill(manager.as_ref(), since).await?;
                (stream, Some(requested), Some(listed_at))
            }
        };

        let accounting = Arc::new(StoreAccounting::new());
        let outcomes = Arc::new(Mutex::new(Outcomes::default()));
        let (store_sink, mut store_events) = StoreSink::channel();

        let consumer = {
            let accounting = accounting.clone();
            let outcomes = outcomes.clone();
            tokio::spawn(async move {
                while let Some(event) = store_events.next().await {
                    match event {
                        StoreEvent::Stored { guid } => {
                            outcomes.lock().stored.push(guid);
                            accounting.settle();
                        }
                        StoreEvent::Failed { guid, error } => {
                            warn!(guid = %guid, error = %error, "record store failed");
                            outcomes.lock().failures.push((guid, error));
                            accounting.settle();
                        }
                        StoreEvent::Completed { store_end } => {
                            accounting.store_done(store_end);
                            break;
                        }
                    }
                }
            })
        };

        let mut fetched = Vec::new();
        let mut fetch_end = None;
        let mut fetch_failure = None;
        while let Some(event) = stream.next().await {
            match event {
                FetchEvent::Record(record) => {
                    let guid = record.guid.clone();
                    fetched.push(guid.clone());
                    accounting.issue();
                    if let Err(e) = self.sink.store(record, &store_sink).await {
                        warn!(guid = %guid, error = %e, "store could not be issued");
                        outcomes.lock().failures.push((guid, e));
                        accounting.settle();
                    }
                }
                FetchEvent::Failed(e) => {
                    warn!(
                        collection = %collection,
                        error = %e,
                        fetched = fetched.len(),
                        "fetch failed, keeping partial progress"
                    );
                    fetch_failure = Some(e);
                    break;
                }
                FetchEvent::Completed { end } => {
                    fetch_end = Some(listed_at.map_or(end, |listed| listed.min(end)));
                    break;
                }
            }
        }
        // Dropping the stream releases a source still blocked on a full buffer.
        drop(stream);
        if fetch_end.is_none() && fetch_failure.is_none() {
            fetch_failure = Some(SyncError::FetchFailed {
                msg: "fetch ended without completion".to_string(),
            });
        }

        if let Err(e) = self.sink.store_done(&store_sink).await {
            consumer.abort();
            return Err(e);
        }
        accounting.finish_issuing();
        let store_end = accounting.wait().await;
        let _ = consumer.await;

        let outcomes = std::mem::take(&mut *outcomes.lock());
        let report = FlowReport {
            records_fetched: fetched.len(),
            records_stored: outcomes.stored.len(),
            stored_guids: outcomes.stored,
            store_failures: outcomes.failures,
            fetch_failure,
            fetch_end: fetch_end.unwrap_or(since),
            store_end,
        };

        if let (Some(manager), Some(requested)) = (&self.guids, requested) {
            self.settle_guids(manager.as_ref(), &requested, &fetched, &report)?;
        }

        info!(
            collection = %collection,
            fetched = report.records_fetched,
            stored = report.records_stored,
            store_failures = report.store_failures.len(),
            fetch_failed = report.fetch_failure.is_some(),
            fetch_end = report.fetch_end,
            store_end = report.store_end,
            "flow completed"
        );
        Ok(report)
    }

    /// Open the fetch for the next batch of outstanding GUIDs. Also returns the
    /// batch and the source time read before listing, which bounds the flow's
    /// `fetch_end`: anything modified later may be missing from the listing.
    async fn fill(
        &self,
        manager: &dyn GuidsManager,
        since: i64,
    ) -> Result<(FetchStream, Vec<String>, i64)> {
        let listing = async {
            let listed_at = self.source.now_ms().await?;
            let fresh = self.source.guids_since(since).await?;
            Ok::<_, SyncError>((listed_at, fresh))
        };
        let (listed_at, fresh) = match listing.await {
            Ok(listed) => listed,
            Err(e) if e.is_session_state() => return Err(e),
            Err(e) => {
                let failure = SyncError::FetchFailed { msg: e.to_string() };
                return Ok((FetchStream::failed(failure), Vec::new(), since));
            }
        };
        manager.add_fresh_guids(&fresh)?;
        let batch = manager.next_guids()?;
        debug!(
            fresh = fresh.len(),
            batch = batch.len(),
            outstanding = manager.num_guids_remaining()?,
            listed_at,
            "filling fetch"
        );
        if batch.is_empty() {
            return Ok((FetchStream::completed(since), batch, listed_at));
        }
        let stream = self.source.fetch(batch.clone()).await?;
        Ok((stream, batch, listed_at))
    }

    fn settle_guids(
        &self,
        manager: &dyn GuidsManager,
        requested: &[String],
        fetched: &[String],
        report: &FlowReport,
    ) -> Result<()> {
        manager.remove_guids(&report.stored_guids)?;
        manager.retry_guids(&report.failed_guids())?;
        if report.fetch_failure.is_none() {
            let returned: HashSet<&str> = fetched.iter().map(String::as_str).collect();
            let orphans: Vec<String> = requested
                .iter()
                .filter(|g| !returned.contains(g.as_str()))
                .cloned()
                .collect();
            if !orphans.is_empty() {
                warn!(
                    count = orphans.len(),
                    "source no longer has requested records, dropping them"
                );
                manager.remove_guids(&orphans)?;
            }
        }
        Ok(())
    }
}
