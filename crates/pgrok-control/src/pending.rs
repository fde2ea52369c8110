//! Pending-request correlator
//!
//! Concurrent table of in-flight requests keyed by request id. Each entry is
//! a oneshot completion handle; whoever awaits the receiver applies its own
//! deadline with `tokio::time::timeout`. A given id completes at most once —
//! late or duplicate responses are reported back to the caller, which logs
//! and discards them.

use dashmap::DashMap;
use pgrok_proto::HttpResponseEnvelope;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Correlator errors
#[derive(Debug, Error)]
pub enum CorrelatorError {
    /// Two inserts for the same id. Ids are random UUIDs, so this is an
    /// invariant violation, fatal for the tunnel that produced it.
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(String),
}

/// Concurrent table of pending requests
#[derive(Clone)]
pub struct PendingRequests {
    requests: Arc<DashMap<String, oneshot::Sender<HttpResponseEnvelope>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request; the returned receiver resolves with
    /// the response envelope.
    pub fn insert(
        &self,
        request_id: &str,
    ) -> Result<oneshot::Receiver<HttpResponseEnvelope>, CorrelatorError> {
        let (tx, rx) = oneshot::channel();
        match self.requests.entry(request_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CorrelatorError::DuplicateRequestId(request_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                debug!(request_id, "registered pending request");
                Ok(rx)
            }
        }
    }

    /// Deliver a response. Returns true if the id was present and unseen;
    /// false for an unknown or already-completed id.
    pub fn complete(&self, response: HttpResponseEnvelope) -> bool {
        let request_id = response.request_id.clone();
        if let Some((_, tx)) = self.requests.remove(&request_id) {
            if tx.send(response).is_err() {
                debug!(request_id, "response arrived after caller gave up");
                return false;
            }
            true
        } else {
            warn!(request_id, "discarding response for unknown request id");
            false
        }
    }

    /// Fail one request with an error envelope
    pub fn fail(&self, request_id: &str, status_code: u16, error: &str, message: &str) {
        if let Some((_, tx)) = self.requests.remove(request_id) {
            let _ = tx.send(HttpResponseEnvelope::error(
                request_id,
                status_code,
                error,
                message,
            ));
        }
    }

    /// Drop an entry without completing it (caller timed out or went away)
    pub fn cancel(&self, request_id: &str) {
        if self.requests.remove(request_id).is_some() {
            debug!(request_id, "cancelled pending request");
        }
    }

    /// Fail every pending request, e.g. when the tunnel dies
    pub fn drain(&self, status_code: u16, error: &str, message: &str) {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.fail(&id, status_code, error, message);
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
