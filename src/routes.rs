//! In-flight request tracking for the gateway.
//!
//! Each relayed request registers a pending entry keyed by its agent label;
//! the broker dispatch task completes the entry when a response payload shows
//! up on the label's topic. One entry per label: a newer registration
//! displaces the older one, whose waiter then resolves empty-handed.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

/// Map from agent label to the single in-flight response sink.
#[derive(Debug, Default)]
pub(crate) struct RoutingTable {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_id: u64,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    tx: oneshot::Sender<Bytes>,
    created: Instant,
}

/// A registered wait for one response, handed back to the relay handler.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    label: String,
    id: u64,
    rx: oneshot::Receiver<Bytes>,
}

impl PendingRequest {
    /// Resolves once the response arrives; `None` when this entry was
    /// displaced by a newer request for the same label.
    pub async fn response(&mut self) -> Option<Bytes> {
        (&mut self.rx).await.ok()
    }
}

impl RoutingTable {
    /// Creates a pending entry for `label`, displacing any existing one.
    pub fn register(&self, label: &str) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let previous = inner.entries.insert(
            label.to_string(),
            Entry {
                id,
                tx,
                created: Instant::now(),
            },
        );
        if previous.is_some() {
            debug!(%label, "displaced an in-flight request for the same label");
        }
        PendingRequest {
            label: label.to_string(),
            id,
            rx,
        }
    }

    /// Delivers a response to the waiter registered for `label`.
    ///
    /// Returns false when no entry exists or the waiter already gave up.
    pub fn complete(&self, label: &str, response: Bytes) -> bool {
        let entry = self.lock().entries.remove(label);
        match entry {
            Some(entry) => {
                debug!(%label, elapsed = ?entry.created.elapsed(), "response received");
                entry.tx.send(response).is_ok()
            }
            None => false,
        }
    }

    /// Drops the pending entry, unless a newer registration replaced it.
    pub fn release(&self, pending: &PendingRequest) {
        let mut inner = self.lock();
        if inner
            .entries
            .get(&pending.label)
            .is_some_and(|entry| entry.id == pending.id)
        {
            inner.entries.remove(&pending.label);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
