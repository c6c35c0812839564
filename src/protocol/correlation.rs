//! # Request/Response Correlation
//!
//! A request is matched to its response by tag alone, so at most one request per tag
//! may be in flight on a session. [`RequestTracker::begin`] reserves the tag and
//! hands back a [`PendingReply`]; the session's reader calls
//! [`RequestTracker::resolve`] when a `Response` packet arrives.
//!
//! The reservation is released when the reply arrives, when the wait times out, or
//! when the `PendingReply` is dropped (for example because the caller's future was
//! cancelled). A response that arrives after its waiter gave up finds no entry and is
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{NetError, Result};

struct Pending {
    id: u64,
    sender: oneshot::Sender<Option<Bytes>>,
}

#[derive(Default)]
struct TrackerInner {
    pending: Mutex<HashMap<String, Pending>>,
    next_id: AtomicU64,
}

impl TrackerInner {
    // Entries are plain data, a poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-session table of in-flight requests
#[derive(Clone, Default)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `tag` for one outstanding request.
    ///
    /// Fails with [`NetError::DuplicateRequest`] when the tag is already waiting.
    pub fn begin(&self, tag: &str) -> Result<PendingReply> {
        let (sender, receiver) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.inner.lock();
        if pending.contains_key(tag) {
            return Err(NetError::DuplicateRequest(tag.to_string()));
        }
        pending.insert(tag.to_string(), Pending { id, sender });

        Ok(PendingReply {
            tracker: self.inner.clone(),
            tag: tag.to_string(),
            id,
            receiver,
        })
    }

    /// Complete the request waiting on `tag`.
    ///
    /// Returns `false` when nobody was waiting.
    pub fn resolve(&self, tag: &str, payload: Option<Bytes>) -> bool {
        let entry = self.inner.lock().remove(tag);
        match entry {
            Some(pending) => {
                // The waiter may have been dropped between removal and send; nothing to do then.
                let _ = pending.sender.send(payload);
                true
            }
            None => {
                trace!(tag, "Response with no pending request dropped");
                false
            }
        }
    }

    /// Fail every outstanding request with [`NetError::Cancelled`]
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.inner.lock().drain().collect();
        drained.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_pending(&self, tag: &str) -> bool {
        self.inner.lock().contains_key(tag)
    }
}

/// Reservation for one in-flight request
pub struct PendingReply {
    tracker: Arc<TrackerInner>,
    tag: String,
    id: u64,
    receiver: oneshot::Receiver<Option<Bytes>>,
}

impl PendingReply {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wait for the response payload.
    ///
    /// `Ok(None)` is a valid reply carrying no payload.
    pub async fn wait(mut self, timeout: Duration) -> Result<Option<Bytes>> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(NetError::Cancelled(self.tag.clone())),
            Err(_) => Err(NetError::Timeout(self.tag.clone())),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let mut pending = self.tracker.lock();
        // A later request may already own the tag; only remove our own entry.
        if pending.get(&self.tag).is_some_and(|p| p.id == self.id) {
            pending.remove(&self.tag);
        }
    }
}
