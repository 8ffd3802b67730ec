//! TCP socket connector and the per-connection poll loop: the HEL/ACK bootstrap plus the
//! steady-state "write whatever is queued, read whatever arrives" loop, grounded on
//! `opcua_client::transport::tcp::{TcpConnector, TcpTransport}`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, trace, warn};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use opcua_transport_core::comms::chunk_info::ChunkInfo;
use opcua_transport_core::comms::message_chunk::MessageIsFinalType;
use opcua_transport_core::{
    chunker, queue_channel, AcknowledgeMessage, Correlator, HelloMessage, SecureChannel,
    SerializationQueue, TransportCodec,
};
use opcua_transport_types::{DecodingOptions, Error, StatusCode};
use parking_lot::RwLock;

use super::connect::{Connector, ConnectedTransport, Transport};
use super::TransportPollResult;

/// How many outbound messages the serialization queue backing one connection will hold
/// before `submit` starts applying backpressure to callers.
const OUTGOING_QUEUE_CAPACITY: usize = 64;

/// Local capacity knobs for one connection attempt, the client-side counterpart of
/// `opcua_transport_core::TransportConfig` resolved to concrete numbers for this connect.
#[derive(Debug, Clone)]
pub struct TransportConfiguration {
    pub send_buffer_size: u32,
    pub receive_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub decoding_options: DecodingOptions,
}

/// Split an `opc.tcp://host:port/path` endpoint url into its host and port, defaulting to
/// the well-known OPC UA TCP port when none is given.
pub fn hostname_port_from_url(endpoint_url: &str) -> Result<(String, u16), StatusCode> {
    const DEFAULT_OPC_UA_PORT: u16 = 4840;
    let parsed = url::Url::parse(endpoint_url).map_err(|_| StatusCode::BadTcpEndpointUrlInvalid)?;
    let host = parsed
        .host_str()
        .ok_or(StatusCode::BadTcpEndpointUrlInvalid)?
        .to_string();
    let port = parsed.port().unwrap_or(DEFAULT_OPC_UA_PORT);
    Ok((host, port))
}

pub struct TcpTransport {
    secure_channel: Arc<RwLock<SecureChannel>>,
    correlator: Arc<Correlator>,
    read: FramedRead<ReadHalf<TcpStream>, TransportCodec>,
    decoding_options: DecodingOptions,
    pending_chunks: Vec<Vec<u8>>,
    last_sequence_number: Option<u32>,
    /// The task draining this connection's serialization queue onto the socket's write half.
    /// Kept only to be joined/aborted alongside the read side; `TcpTransport` does not poll it.
    write_task: JoinHandle<()>,
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.write_task.abort();
    }
}

/// Drains `queue`, writing each submitted payload to `write` in submission order. Runs until
/// every [`opcua_transport_core::QueueHandle`] referencing `queue` is dropped or a write fails.
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

pub struct TcpConnector;

impl TcpConnector {
    /// Establish the TCP socket and run the HEL/ACK bootstrap. Does not touch the secure
    /// channel: this crate's secure channel state only comes alive once `Connector::connect`'s
    /// caller drives an OpenSecureChannel exchange over the transport this returns (see
    /// `opcua_transport_client::connection::Client`).
    async fn connect_inner(
        config: &TransportConfiguration,
        endpoint_url: &str,
    ) -> Result<
        (
            FramedRead<ReadHalf<TcpStream>, TransportCodec>,
            WriteHalf<TcpStream>,
            AcknowledgeMessage,
        ),
        StatusCode,
    > {
        let (host, port) = hostname_port_from_url(endpoint_url)?;
        let addr = format!("{host}:{port}");

        debug!("connecting to {addr} with url {endpoint_url}");
        let socket = TcpStream::connect(&addr).await.map_err(|err| {
            error!("could not connect to host {addr}: {err}");
            StatusCode::BadCommunicationError
        })?;
        let (reader, mut writer) = tokio::io::split(socket);

        let hello = HelloMessage {
            protocol_version: opcua_transport_core::PROTOCOL_VERSION,
            receive_buffer_size: config.receive_buffer_size,
            send_buffer_size: config.send_buffer_size,
            max_message_size: config.max_message_size,
            max_chunk_count: config.max_chunk_count,
            endpoint_url: endpoint_url.to_string(),
        };
        trace!("sending hello: {hello:?}");

        let mut hello_bytes = Vec::with_capacity(hello.byte_len() + 8);
        encode_hel_or_ack(&mut hello_bytes, b"HEL", hello.byte_len(), |buf| {
            hello.encode(buf)
        })
        .map_err(|_| StatusCode::BadEncodingError)?;
        writer.write_all(&hello_bytes).await.map_err(|err| {
            error!("failed to send hello to server: {err}");
            StatusCode::BadCommunicationError
        })?;

        let max_chunk_size = config.receive_buffer_size.max(8192) as usize;
        let mut framed_read = FramedRead::new(reader, TransportCodec::new(max_chunk_size));
        let raw = framed_read.next().await.ok_or(StatusCode::BadConnectionClosed)?;
        let raw = raw.map_err(|e| e.status())?;
        if &raw[0..3] != &b"ACK"[..] {
            error!("expected ACK, got a different first message from server");
            return Err(StatusCode::BadConnectionClosed);
        }
        let mut cursor = std::io::Cursor::new(&raw[8..]);
        let ack = AcknowledgeMessage::decode(&mut cursor).map_err(|_| StatusCode::BadDecodingError)?;
        trace!("received acknowledgement: {ack:?}");

        Ok((framed_read, writer, ack))
    }
}

fn encode_hel_or_ack(
    buf: &mut Vec<u8>,
    tag: &[u8; 3],
    body_len: usize,
    write_body: impl FnOnce(&mut Vec<u8>) -> opcua_transport_types::EncodingResult<()>,
) -> opcua_transport_types::EncodingResult<()> {
    buf.extend_from_slice(tag);
    buf.push(b'F');
    buf.extend_from_slice(&((body_len + 8) as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    write_body(buf)
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        secure_channel: Arc<RwLock<SecureChannel>>,
        config: TransportConfiguration,
        endpoint_url: &str,
    ) -> Result<ConnectedTransport, StatusCode> {
        let (read, write, ack) = Self::connect_inner(&config, endpoint_url).await?;
        if ack.send_buffer_size > config.receive_buffer_size {
            warn!("server's send buffer is larger than our receive buffer advertisement");
        }
        let (outgoing, serialization_queue) = queue_channel(OUTGOING_QUEUE_CAPACITY);
        let write_task = tokio::task::spawn(run_write_queue(write, serialization_queue));
        Ok(ConnectedTransport {
            transport: TcpTransport {
                secure_channel,
                correlator: Arc::new(Correlator::new()),
                read,
                decoding_options: config.decoding_options,
                pending_chunks: Vec::new(),
                last_sequence_number: None,
                write_task,
            },
            outgoing,
        })
    }
}

impl TcpTransport {
    pub fn correlator(&self) -> Arc<Correlator> {
        self.correlator.clone()
    }

    fn handle_incoming_chunk(&mut self, raw: Vec<u8>) -> TransportPollResult {
        let secure_channel = self.secure_channel.read();
        let is_final = match ChunkInfo::new(&raw, &secure_channel, &self.decoding_options) {
            Ok(info) => info.message_header.is_final,
            Err(e) => return TransportPollResult::Closed(e.status()),
        };
        drop(secure_channel);

        self.pending_chunks.push(raw);
        if is_final == MessageIsFinalType::Intermediate {
            return TransportPollResult::IncomingChunk;
        }

        let secure_channel = self.secure_channel.read();
        let decoded = chunker::decode(
            &self.pending_chunks,
            &secure_channel,
            &mut self.last_sequence_number,
            &self.decoding_options,
        );
        drop(secure_channel);
        self.pending_chunks.clear();

        match decoded {
            Ok(message) => {
                let request_id = message.request_id;
                let _ = self.correlator.complete(request_id, Ok(message));
                TransportPollResult::IncomingChunk
            }
            Err(e) => {
                error!("failed to decode an incoming message: {e}");
                TransportPollResult::Closed(e.status())
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn poll(&mut self) -> TransportPollResult {
        match self.read.next().await {
            Some(Ok(raw)) => self.handle_incoming_chunk(raw.to_vec()),
            Some(Err(e)) => TransportPollResult::Closed(e.status()),
            None => TransportPollResult::Closed(StatusCode::BadConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_url_without_a_port_defaults_to_the_well_known_opc_ua_port() {
        let (host, port) = hostname_port_from_url("opc.tcp://localhost/test").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 4840);
    }

    #[test]
    fn an_explicit_port_overrides_the_default() {
        let (host, port) = hostname_port_from_url("opc.tcp://127.0.0.1:12685/test").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 12685);
    }

    #[test]
    fn an_unparseable_url_is_rejected() {
        let err = hostname_port_from_url("not a url").unwrap_err();
        assert_eq!(err, StatusCode::BadTcpEndpointUrlInvalid);
    }
}
