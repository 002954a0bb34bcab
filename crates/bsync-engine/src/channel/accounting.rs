//! Store-completion detection for one flow.
//!
//! The flow issues stores while the sink reports outcomes concurrently, and an
//! outcome can arrive before the call that issued it returns. Completion
//! fires exactly once, when all three hold: no more stores will be issued,
//! every issued store has settled, and the sink has reported its store end.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Counters shared between the issuing flow and the outcome consumer.
#[derive(Debug, Default)]
pub struct StoreAccounting {
    outstanding: AtomicUsize,
    issued_total: AtomicUsize,
    all_issued: AtomicBool,
    completed: AtomicBool,
    store_end: Mutex<Option<i64>>,
    notify: Notify,
}

impl StoreAccounting {
    /// Fresh accounting with nothing issued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a store about to be issued. Call before handing the record to the sink.
    pub fn issue(&self) {
        self.issued_total.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one settled store (success or failure).
    pub fn settle(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "settled more stores than were issued");
        self.check();
    }

    /// No more stores will be issued.
    pub fn finish_issuing(&self) {
        self.all_issued.store(true, Ordering::SeqCst);
        self.check();
    }

    /// The sink reported its store end.
    pub fn store_done(&self, store_end: i64) {
        *self.store_end.lock() = Some(store_end);
        self.check();
    }

    /// Stores issued so far.
    pub fn issued(&self) -> usize {
        self.issued_total.load(Ordering::SeqCst)
    }

    /// Stores issued but not yet settled.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// True once completion has fired.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Wait for completion and return the sink's store end.
    pub async fn wait(&self) -> i64 {
        loop {
            let notified = self.notify.notified();
            if self.is_complete() {
                return self.store_end.lock().unwrap_or_default();
            }
            notified.await;
        }
    }

    fn check(&self) {
        if !self.all_issued.load(Ordering::SeqCst) || self.outstanding.load(Ordering::SeqCst) != 0 {
            return;
        }
        if self.store_end.lock().is_none() {
            return;
        }
        if !self.completed.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }
}
