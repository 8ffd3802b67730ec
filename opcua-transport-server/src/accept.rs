//! One accepted TCP connection's lifecycle: HELLO/ACK, OpenSecureChannel, then a steady
//! state that accepts MSG (dispatch), CLO (close) and further OPN (token renewal) chunks.
//! Grounded on `opcua_server::transport::tcp::{TcpConnector, TcpTransport}`.

use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, trace, warn};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use opcua_transport_core::comms::message_chunk::{
    MessageChunkHeader, MessageChunkType, MessageIsFinalType,
};
use opcua_transport_core::{
    chunker, negotiate, queue_channel, AcknowledgeMessage, HelloMessage, QueueHandle, Role,
    SecureChannel, SerializationQueue, TransportCodec, TransportConfig,
};
use opcua_transport_crypto::{MessageSecurityMode, SecurityPolicy};
use opcua_transport_types::{read_u32, Error, StatusCode};

use crate::channel_opener::ChannelOpener;
use crate::dispatch::{self, dispatch as dispatch_request};
use crate::handler_registry::HandlerRegistry;

/// How many outbound messages one connection's serialization queue holds before `submit`
/// applies backpressure, mirroring the client's `opcua_transport_client::transport::tcp`.
const OUTGOING_QUEUE_CAPACITY: usize = 64;

/// Drains `queue` onto `write` in submission order, the server-side counterpart of
/// `opcua_transport_client::transport::tcp::run_write_queue`.
async fn run_write_queue(mut write: WriteHalf<TcpStream>, queue: SerializationQueue) {
    queue
        .run(move |payload: Vec<u8>| {
            let write = &mut write;
            async move {
                write
                    .write_all(&payload)
                    .await
                    .map_err(|err| Error::new(StatusCode::BadConnectionClosed, err.to_string()))
            }
        })
        .await;
}

/// Aborts the write-queue task once the connection's handling function returns, whichever
/// path it returns through.
struct WriteTaskGuard(JoinHandle<()>);

impl Drop for WriteTaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Monotonic channel id source shared by every connection a listener accepts, skipping the
/// reserved value zero the way `opcua_server`'s `SecureChannelManager` does.
#[derive(Debug, Default)]
pub struct ChannelIdAllocator(AtomicU32);

impl ChannelIdAllocator {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn next(&self) -> u32 {
        loop {
            let previous = self.0.fetch_add(1, Ordering::Relaxed);
            let id = previous.wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Immutable per-connection settings resolved once at `addEndpoint` time.
#[derive(Clone)]
pub struct EndpointConfig {
    pub endpoint_url: String,
    pub security_policy: SecurityPolicy,
    pub security_mode: MessageSecurityMode,
    pub transport: TransportConfig,
    pub hello_timeout: Duration,
}

fn encode_ack(ack: &AcknowledgeMessage) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(8 + ack.byte_len());
    buf.extend_from_slice(b"ACK");
    buf.push(b'F');
    buf.extend_from_slice(&((ack.byte_len() + 8) as u32).to_le_bytes());
    ack.encode(&mut buf).map_err(|_| {
        Error::new(StatusCode::BadEncodingError, "failed to encode acknowledge message")
    })?;
    Ok(buf)
}

fn encode_err(status: StatusCode, reason: &str) -> Vec<u8> {
    let mut body = Vec::new();
    let _ = opcua_transport_types::write_u32(&mut body, status.as_u32());
    let _ = opcua_transport_types::write_string(&mut body, Some(reason));
    let mut buf = Vec::with_capacity(8 + body.len());
    buf.extend_from_slice(b"ERR");
    buf.push(b'F');
    buf.extend_from_slice(&((body.len() + 8) as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Reads chunks off `read` and reassembles the next complete message, reporting which chunk
/// family it belonged to (taken from the first chunk of the run; all chunks in one run share
/// a message type by construction of the sender).
async fn read_message(
    read: &mut FramedRead<ReadHalf<TcpStream>, TransportCodec>,
    secure_channel: &SecureChannel,
    last_sequence_number: &mut Option<u32>,
    decoding_options: &opcua_transport_types::DecodingOptions,
) -> Result<(MessageChunkType, chunker::DecodedMessage), Error> {
    let mut pending = Vec::new();
    let mut message_type = None;

    loop {
        let raw = read
            .next()
            .await
            .ok_or_else(|| Error::new(StatusCode::BadConnectionClosed, "peer closed the connection"))??;
        let raw = raw.to_vec();

        let header = MessageChunkHeader::decode(&mut Cursor::new(raw.as_slice()))?;
        if message_type.is_none() {
            message_type = Some(header.message_type);
        }
        let is_final = header.is_final;
        pending.push(raw);

        if is_final != MessageIsFinalType::Intermediate {
            let decoded = chunker::decode(&pending, secure_channel, last_sequence_number, decoding_options)?;
            return Ok((message_type.unwrap(), decoded));
        }
    }
}

/// Drive one accepted socket through HELLO/ACK, OpenSecureChannel, and the running phase
/// until the peer closes the channel or a fatal framing/security error occurs.
pub async fn run_connection(
    stream: TcpStream,
    endpoint: EndpointConfig,
    channel_ids: Arc<ChannelIdAllocator>,
    channel_opener: Arc<dyn ChannelOpener>,
    handlers: Arc<HandlerRegistry>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    if let Err(err) = run_connection_inner(stream, &endpoint, &channel_ids, &channel_opener, &handlers).await {
        error!("connection from {peer} closed: {err}");
    }
}

async fn run_connection_inner(
    stream: TcpStream,
    endpoint: &EndpointConfig,
    channel_ids: &ChannelIdAllocator,
    channel_opener: &Arc<dyn ChannelOpener>,
    handlers: &HandlerRegistry,
) -> Result<(), Error> {
    let (reader, write) = tokio::io::split(stream);
    let max_chunk_size = endpoint.transport.max_chunk_size.max(8192) as usize;
    let mut read = FramedRead::new(reader, TransportCodec::new(max_chunk_size));
    let decoding_options = opcua_transport_types::DecodingOptions::default();

    let (outgoing, serialization_queue) = queue_channel(OUTGOING_QUEUE_CAPACITY);
    let _write_task = WriteTaskGuard(tokio::task::spawn(run_write_queue(write, serialization_queue)));

    let hello_raw = tokio::time::timeout(endpoint.hello_timeout, read.next())
        .await
        .map_err(|_| Error::new(StatusCode::BadTimeout, "peer did not send HELLO in time"))?
        .ok_or_else(|| Error::new(StatusCode::BadConnectionClosed, "peer closed before HELLO"))??;
    if &hello_raw[0..3] != &b"HEL"[..] {
        let err_bytes = encode_err(StatusCode::BadCommunicationError, "expected HELLO as the first message");
        let _ = outgoing.submit(err_bytes).await;
        return Err(Error::new(StatusCode::BadCommunicationError, "first message was not HELLO"));
    }
    let hello = HelloMessage::decode(&mut Cursor::new(&hello_raw[8..]), &decoding_options)?;
    trace!("received hello: {hello:?}");

    if hello.endpoint_url != endpoint.endpoint_url {
        let err_bytes = encode_err(
            StatusCode::BadTcpEndpointUrlInvalid,
            &format!(
                "hello requested endpoint url {:?}, this listener serves {:?}",
                hello.endpoint_url, endpoint.endpoint_url
            ),
        );
        let _ = outgoing.submit(err_bytes).await;
        return Err(Error::new(
            StatusCode::BadTcpEndpointUrlInvalid,
            "hello's endpoint url does not match this listener's registered endpoint",
        ));
    }

    let params = match negotiate(&hello, &endpoint.transport) {
        Ok(params) => params,
        Err(err) => {
            let err_bytes = encode_err(err.status(), &err.to_string());
            let _ = outgoing.submit(err_bytes).await;
            return Err(err);
        }
    };
    let ack = params.to_acknowledge();
    outgoing.submit(encode_ack(&ack)?).await?;
    debug!("negotiated channel parameters: {params:?}");

    let mut secure_channel = SecureChannel::new(Role::Server, endpoint.security_policy, endpoint.security_mode);
    let channel_id = channel_ids.next();
    secure_channel.set_secure_channel_id(channel_id);
    let mut last_sequence_number = None;

    loop {
        let (message_type, decoded) =
            read_message(&mut read, &secure_channel, &mut last_sequence_number, &decoding_options).await?;

        match message_type {
            MessageChunkType::OpenSecureChannel => {
                let response_body = channel_opener.open(&mut secure_channel, &decoded.body).await?;
                let chunks = chunker::encode(
                    &response_body,
                    MessageChunkType::OpenSecureChannel,
                    decoded.request_id,
                    &mut secure_channel,
                    max_chunk_size,
                )?;
                submit_chunks(&outgoing, chunks).await?;
            }
            MessageChunkType::CloseSecureChannel => {
                debug!("channel {channel_id} closed by peer");
                return Ok(());
            }
            MessageChunkType::Message => {
                let type_id = decoded.body.get(..4).map(|b| {
                    let mut cursor = Cursor::new(b);
                    read_u32(&mut cursor).unwrap_or(0)
                });
                let handler = type_id.and_then(|id| handlers.get(id)).or_else(|| handlers.default_handler());
                let Some(handler) = handler else {
                    warn!("no request handler registered for an incoming message; dropping it");
                    continue;
                };

                let request_id = decoded.request_id;
                let request_handle = decoded
                    .body
                    .get(4..8)
                    .map(|b| {
                        let mut cursor = Cursor::new(b);
                        read_u32(&mut cursor).unwrap_or(0)
                    })
                    .unwrap_or(0);
                let join = dispatch_request(handler, request_id, request_handle, decoded.body);

                match join.await {
                    Ok((request_id, response_body)) => {
                        let chunks = chunker::encode(
                            &response_body,
                            MessageChunkType::Message,
                            request_id,
                            &mut secure_channel,
                            max_chunk_size,
                        )?;
                        submit_chunks(&outgoing, chunks).await?;
                    }
                    Err(join_err) => {
                        warn!("request handler task for request {request_id} failed: {join_err}");
                        let (request_id, response_body) =
                            dispatch::fallback_on_join_error(request_id, StatusCode::BadInternalError);
                        let chunks = chunker::encode(
                            &response_body,
                            MessageChunkType::Message,
                            request_id,
                            &mut secure_channel,
                            max_chunk_size,
                        )?;
                        submit_chunks(&outgoing, chunks).await?;
                    }
                }
            }
        }
    }
}

/// Flattens a message's chunks into the single payload the serialization queue writes as
/// one unit and submits it.
async fn submit_chunks(outgoing: &QueueHandle, chunks: Vec<Vec<u8>>) -> Result<(), Error> {
    outgoing.submit(chunks.into_iter().flatten().collect()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct NoopOpener;

    #[async_trait]
    impl ChannelOpener for NoopOpener {
        async fn open(&self, _secure_channel: &mut SecureChannel, _request_body: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }
    }

    fn endpoint(endpoint_url: &str) -> EndpointConfig {
        EndpointConfig {
            endpoint_url: endpoint_url.to_string(),
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            transport: TransportConfig::default(),
            hello_timeout: Duration::from_secs(5),
        }
    }

    fn hello_bytes(endpoint_url: &str) -> Vec<u8> {
        let hello = HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 65535,
            send_buffer_size: 65535,
            max_message_size: 2_097_152,
            max_chunk_count: 65535,
            endpoint_url: endpoint_url.to_string(),
        };
        let mut body = Vec::new();
        hello.encode(&mut body).unwrap();
        let mut buf = Vec::with_capacity(8 + body.len());
        buf.extend_from_slice(b"HEL");
        buf.push(b'F');
        buf.extend_from_slice(&((body.len() + 8) as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    #[tokio::test]
    async fn a_hello_for_the_wrong_endpoint_url_is_rejected_with_bad_tcp_endpoint_url_invalid() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let endpoint = endpoint("opc.tcp://127.0.0.1:4840/registered");
            let channel_ids = ChannelIdAllocator::new();
            let channel_opener: Arc<dyn ChannelOpener> = Arc::new(NoopOpener);
            let handlers = HandlerRegistry::new();
            run_connection_inner(stream, &endpoint, &channel_ids, &channel_opener, &handlers).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&hello_bytes("opc.tcp://127.0.0.1:4840/wrong"))
            .await
            .unwrap();

        let mut response = vec![0u8; 256];
        client.read(&mut response).await.unwrap();
        assert_eq!(&response[0..3], b"ERR");
        let status = u32::from_le_bytes(response[8..12].try_into().unwrap());
        assert_eq!(status, StatusCode::BadTcpEndpointUrlInvalid.as_u32());

        let result = server.await.unwrap();
        assert_eq!(result.unwrap_err().status(), StatusCode::BadTcpEndpointUrlInvalid);
    }
}
