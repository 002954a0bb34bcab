//! Single-threaded serial executor owning a session's state.
//!
//! Jobs are queued on a bounded channel and run one after another on a
//! blocking thread of the runtime the worker was spawned on. The state `S` is
//! owned by that thread; nothing else can touch it. The thread exits once
//! every handle to the worker is dropped.

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{Result, SyncError};

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Handle to a serial worker running jobs against state `S`.
pub struct SerialWorker<S> {
    label: String,
    tx: mpsc::Sender<Job<S>>,
}

impl<S: Send + 'static> SerialWorker<S> {
    /// Spawn the worker on `handle`, taking ownership of `state`.
    pub fn spawn(label: impl Into<String>, mut state: S, capacity: usize, handle: &Handle) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::channel::<Job<S>>(capacity.max(1));
        let thread_label = label.clone();
        handle.spawn_blocking(move || {
            debug!(worker = %thread_label, "session worker started");
            while let Some(job) = rx.blocking_recv() {
                job(&mut state);
            }
            debug!(worker = %thread_label, "session worker stopped");
        });
        Self { label, tx }
    }

    /// Worker label, used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue a job without waiting for it to run. Waits for queue capacity.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        trace!(worker = %self.label, "job queued");
        self.tx
            .send(Box::new(job))
            .await
            .map_err(|_| SyncError::WorkerClosed)
    }

    /// Run a job and wait for its result.
    pub async fn call<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(move |state| {
            let _ = reply_tx.send(job(state));
        })
        .await?;
        reply_rx.await.map_err(|_| SyncError::WorkerClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let worker = SerialWorker::spawn("order", Vec::<u32>::new(), 4, &Handle::current());
        for i in 0..20 {
            worker.submit(move |v| v.push(i)).await.unwrap();
        }
        let seen = worker.call(|v| v.clone()).await.unwrap();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jobs_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(SerialWorker::spawn("overlap", 0usize, 8, &Handle::current()));
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let worker = worker.clone();
            let active = active.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let active = active.clone();
                    worker
                        .call(move |count| {
                            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                            *count += 1;
                            std::thread::sleep(std::time::Duration::from_micros(50));
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(worker.call(|count| *count).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_label() {
        let worker = SerialWorker::spawn("history/local", (), 1, &Handle::current());
        assert_eq!(worker.label(), "history/local");
    }
}
