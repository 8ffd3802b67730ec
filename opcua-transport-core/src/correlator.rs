//! Assigns request ids on send and resolves the matching pending future on receive.
//! Grounded on the `pending`-map idiom described for the secure channel and on
//! `opcua_client::transport::channel::AsyncSecureChannel`'s per-request `oneshot` promises.

use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use opcua_transport_types::{Error, StatusCode};

use crate::comms::chunker::DecodedMessage;

/// Outcome of one in-flight request: the reassembled response body, an application-level
/// abort, or a transport failure (channel loss, timeout).
pub type RequestOutcome = Result<DecodedMessage, Error>;

struct PendingRequest {
    request_handle: u32,
    submitted_at: Instant,
    promise: oneshot::Sender<RequestOutcome>,
}

/// Tracks requests awaiting a response on one secure channel. Bounds its own growth: every
/// entry is removed exactly once, whether by a matching response, an abort, a timeout, or a
/// channel-wide failure.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

/// A handle the caller awaits for the eventual response.
pub struct PendingReceipt {
    pub request_id: u32,
    pub receiver: oneshot::Receiver<RequestOutcome>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request about to be sent under `request_id`, returning the receiver half
    /// the caller awaits.
    pub fn register(&self, request_id: u32, request_handle: u32) -> PendingReceipt {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id,
            PendingRequest {
                request_handle,
                submitted_at: Instant::now(),
                promise: tx,
            },
        );
        PendingReceipt {
            request_id,
            receiver: rx,
        }
    }

    /// Complete the pending request matching `request_id` with `outcome`. A miss (no such
    /// request, or a request already completed) is reported, not treated as fatal: the
    /// caller logs and drops late responses.
    pub fn complete(&self, request_id: u32, outcome: RequestOutcome) -> Result<(), RequestOutcome> {
        let pending = self.pending.lock().remove(&request_id);
        match pending {
            Some(pending) => pending.promise.send(outcome).map_err(Err).unwrap_or(Ok(())),
            None => Err(outcome),
        }
    }

    /// Remove and fail every outstanding request, e.g. on channel loss.
    pub fn fail_all(&self, status: StatusCode) {
        let mut pending = self.pending.lock();
        for (_, entry) in pending.drain() {
            let _ = entry.promise.send(Err(Error::new(
                status,
                "the secure channel was closed before a response arrived",
            )));
        }
    }

    /// Remove and fail a single pending request, used by upper-layer timeouts.
    pub fn fail(&self, request_id: u32, status: StatusCode) {
        if let Some(entry) = self.pending.lock().remove(&request_id) {
            let _ = entry.promise.send(Err(Error::new(status, "request timed out")));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `request_handle` of a still-pending request, if it exists; used for diagnostics.
    pub fn request_handle_of(&self, request_id: u32) -> Option<u32> {
        self.pending.lock().get(&request_id).map(|p| p.request_handle)
    }

    #[cfg(test)]
    fn oldest_submitted_at(&self, request_id: u32) -> Option<Instant> {
        self.pending.lock().get(&request_id).map(|p| p.submitted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(n: u8) -> DecodedMessage {
        DecodedMessage {
            request_id: n as u32,
            body: vec![n],
        }
    }

    #[tokio::test]
    async fn a_registered_request_resolves_on_matching_completion() {
        let correlator = Correlator::new();
        let receipt = correlator.register(1, 10);
        correlator.complete(1, Ok(body(7))).unwrap();
        let outcome = receipt.receiver.await.unwrap().unwrap();
        assert_eq!(outcome.body, vec![7]);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn completing_an_unknown_request_id_is_reported_not_panicked() {
        let correlator = Correlator::new();
        assert!(correlator.complete(42, Ok(body(1))).is_err());
    }

    #[tokio::test]
    async fn fail_all_drains_the_map_and_fails_every_receiver() {
        let correlator = Correlator::new();
        let a = correlator.register(1, 1);
        let b = correlator.register(2, 2);
        correlator.fail_all(StatusCode::BadConnectionClosed);
        assert!(correlator.is_empty());
        assert!(a.receiver.await.unwrap().is_err());
        assert!(b.receiver.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn the_pending_map_never_exceeds_outstanding_requests() {
        let correlator = Correlator::new();
        let _ = correlator.register(1, 1);
        let _ = correlator.register(2, 2);
        assert_eq!(correlator.len(), 2);
        correlator.complete(1, Ok(body(1))).unwrap();
        assert_eq!(correlator.len(), 1);
        correlator.fail(2, StatusCode::BadTimeout);
        assert_eq!(correlator.len(), 0);
    }

    #[tokio::test]
    async fn a_late_response_after_external_failure_is_not_delivered_twice() {
        let correlator = Correlator::new();
        let receipt = correlator.register(1, 1);
        correlator.fail(1, StatusCode::BadTimeout);
        // The entry is already gone; a late decode completing the same id is a harmless miss.
        assert!(correlator.complete(1, Ok(body(1))).is_err());
        assert!(receipt.receiver.await.unwrap().is_err());
    }
}
