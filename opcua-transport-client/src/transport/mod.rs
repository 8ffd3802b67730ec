//! Connection-level transport: the TCP connector, the per-connection poll loop, and the
//! traits that keep both swappable in tests.

pub mod connect;
pub mod tcp;

use opcua_transport_types::StatusCode;

/// One message handed from the channel wrapper to the transport's write side: already
/// chunk-encoded bytes for a single request, plus the id the response will carry.
#[derive(Debug)]
pub struct OutgoingMessage {
    pub request_id: u32,
    pub chunks: Vec<Vec<u8>>,
}

/// Outcome of one iteration of the transport's poll loop, mirroring the teacher's
/// `TransportPollResult` used to drive the connection's own event loop. Writes go through
/// the secure channel's own [`opcua_transport_core::QueueHandle`] rather than this loop, so
/// polling only ever observes the read side.
#[derive(Debug)]
pub enum TransportPollResult {
    IncomingChunk,
    /// A single request failed without taking the whole connection down (e.g. the request
    /// was too large to send).
    RecoverableError(StatusCode),
    /// The connection is no longer usable; `Good` means it closed cleanly.
    Closed(StatusCode),
}
