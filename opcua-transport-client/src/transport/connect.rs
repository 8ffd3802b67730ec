//! Traits implemented by the thing that establishes a connection and the thing that then
//! drives it, grounded on `async_opcua_client::transport::connect`.

use std::sync::Arc;

use async_trait::async_trait;
use opcua_transport_core::{QueueHandle, SecureChannel};
use opcua_transport_types::StatusCode;
use parking_lot::RwLock;

use super::tcp::{TcpTransport, TransportConfiguration};
use super::TransportPollResult;

/// A freshly connected transport plus the handle callers use to queue writes onto it. Kept
/// as a pair rather than folding `outgoing` into [`TcpTransport`] itself: the writer task the
/// queue drains owns the socket's write half independently of whatever polls the read half.
pub struct ConnectedTransport {
    pub transport: TcpTransport,
    pub outgoing: QueueHandle,
}

/// Establishes a connection up to and including the HEL/ACK exchange. Implementors must not
/// retry; retry policy lives in the connection FSM.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        secure_channel: Arc<RwLock<SecureChannel>>,
        config: TransportConfiguration,
        endpoint_url: &str,
    ) -> Result<ConnectedTransport, StatusCode>;
}

/// Drives an already-connected transport one step. `poll` must be cancellation safe: each
/// call awaits exactly one future, so dropping the call in flight never loses a chunk.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn poll(&mut self) -> TransportPollResult;
}
