//! Pending-request table correlating forwarded requests with responses.
//!
//! The reader loop delivers into single-slot sinks owned by adapter tasks;
//! delivery never blocks and happens at most once per id.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use porthole_shared::protocol::Frame;
use porthole_shared::{Error, Result};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
pub struct PendingRequests {
    sinks: DashMap<String, oneshot::Sender<Frame>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a response sink under `id`. A duplicate id is rejected; the
    /// caller generates a fresh one and retries.
    pub fn insert(&self, id: &str, sink: oneshot::Sender<Frame>) -> Result<()> {
        match self.sinks.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateRequestId(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(sink);
                Ok(())
            }
        }
    }

    /// Hand a response frame to the adapter waiting on `id`. A frame nobody
    /// is waiting for is dropped with a log entry.
    pub fn deliver(&self, id: &str, frame: Frame) {
        match self.sinks.remove(id) {
            Some((_, sink)) => {
                if sink.send(frame).is_err() {
                    debug!("Adapter for request {id} left before delivery");
                }
            }
            None => debug!("No pending request for id {id}"),
        }
    }

    /// Drop the entry for `id` if it is still present. Idempotent.
    pub fn remove(&self, id: &str) {
        self.sinks.remove(id);
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.sinks.contains_key(id)
    }
}

/// Scope-bound cleanup for a pending entry. The adapter holds one of these
/// for the lifetime of its wait so the entry disappears on every exit path:
/// delivery, timeout, and caller disconnect (which drops the adapter future).
pub struct PendingGuard {
    table: Arc<PendingRequests>,
    id: String,
}

impl PendingGuard {
    pub fn new(table: Arc<PendingRequests>, id: String) -> Self {
        Self { table, id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: &str) -> Frame {
        Frame::HttpResponse {
            id: id.into(),
            status: 200,
            headers: Default::default(),
            body: "hi".into(),
        }
    }

    #[test]
    fn test_insert_deliver_remove() {
        let table = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();

        table.deliver("r1", response("r1"));
        assert_eq!(rx.try_recv().unwrap(), response("r1"));
        assert!(!table.contains("r1"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingRequests::new();
        let (tx, _rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();

        let (tx, _rx) = oneshot::channel();
        assert!(table.insert("r1", tx).is_err());
    }

    #[test]
    fn test_deliver_without_sink_is_dropped() {
        let table = PendingRequests::new();
        table.deliver("ghost", response("ghost"));
    }

    #[test]
    fn test_deliver_after_adapter_departed() {
        let table = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();
        drop(rx);

        table.deliver("r1", response("r1"));
        assert!(!table.contains("r1"));
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let table = Arc::new(PendingRequests::new());
        let (tx, _rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();

        let guard = PendingGuard::new(table.clone(), "r1".into());
        assert!(table.contains("r1"));
        drop(guard);
        assert!(!table.contains("r1"));
    }

    #[test]
    fn test_delivery_is_at_most_once() {
        let table = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();

        table.deliver("r1", response("r1"));
        table.deliver("r1", response("r1"));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
