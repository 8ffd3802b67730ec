//! The client-facing secure channel wrapper: assigns request ids, renews the security token
//! before it expires, and hands encoded chunks to the transport's outgoing queue. Grounded on
//! `opcua_client::transport::channel::AsyncSecureChannel::send`/`should_renew_security_token`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use opcua_transport_core::comms::message_chunk::MessageChunkType;
use opcua_transport_core::{chunker, Correlator, QueueHandle, SecureChannel, TransportConfig};
use opcua_transport_types::{Error, Message, StatusCode};

/// Flattens a chunk-encoded message into the single payload the outgoing queue writes as one
/// unit; the wire format is just the concatenation of a message's chunks.
fn flatten_chunks(chunks: Vec<Vec<u8>>) -> Vec<u8> {
    chunks.into_iter().flatten().collect()
}

/// Issues a fresh security token by whatever OpenSecureChannel request/response exchange
/// the data-model layer above this crate implements. This transport layer hands it a
/// [`RawChannel`] so it can actually perform that exchange (encode the request body it builds
/// as an OPN chunk, submit it, and await the matching OPN response chunk) without needing its
/// own transport plumbing; what it does with the decoded response bytes — and how it calls
/// `secure_channel.set_security_token`/`derive_keys` from them — stays its own business.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn open(
        &self,
        secure_channel: &Arc<RwLock<SecureChannel>>,
        requested_lifetime_ms: u32,
        raw_channel: &RawChannel,
    ) -> Result<(), Error>;
}

/// Lets a [`TokenIssuer`] send an OpenSecureChannel/CloseSecureChannel request body as a chunk
/// on the connection currently being bootstrapped and await the matching response, the same
/// way [`ChannelHandle::send`] does for ordinary MSG requests but keyed to the asymmetric
/// chunk types used only during the handshake.
#[derive(Clone)]
pub struct RawChannel {
    secure_channel: Arc<RwLock<SecureChannel>>,
    correlator: Arc<Correlator>,
    outgoing: QueueHandle,
    max_chunk_size: usize,
}

impl RawChannel {
    pub fn new(
        secure_channel: Arc<RwLock<SecureChannel>>,
        correlator: Arc<Correlator>,
        outgoing: QueueHandle,
        max_chunk_size: usize,
    ) -> Self {
        Self {
            secure_channel,
            correlator,
            outgoing,
            max_chunk_size,
        }
    }

    /// Encode `body` as an OpenSecureChannel chunk, submit it, and await the decoded response
    /// body the server sends back under the same request id.
    pub async fn open_secure_channel(&self, body: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
        self.exchange(body, MessageChunkType::OpenSecureChannel, timeout).await
    }

    /// Encode `body` as a CloseSecureChannel chunk and submit it; the server does not reply to
    /// a close, so this does not wait for one.
    pub async fn close_secure_channel(&self, body: &[u8]) -> Result<(), Error> {
        let chunks = {
            let mut secure_channel = self.secure_channel.write();
            let request_id = secure_channel.next_request_id();
            chunker::encode(
                body,
                MessageChunkType::CloseSecureChannel,
                request_id,
                &mut secure_channel,
                self.max_chunk_size,
            )?
        };
        self.outgoing.submit(flatten_chunks(chunks)).await
    }

    async fn exchange(
        &self,
        body: &[u8],
        message_type: MessageChunkType,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let (request_id, chunks) = {
            let mut secure_channel = self.secure_channel.write();
            let request_id = secure_channel.next_request_id();
            let chunks = chunker::encode(body, message_type, request_id, &mut secure_channel, self.max_chunk_size)?;
            (request_id, chunks)
        };

        let receipt = self.correlator.register(request_id, request_id);
        self.outgoing.submit(flatten_chunks(chunks)).await?;

        match tokio::time::timeout(timeout, receipt.receiver).await {
            Ok(Ok(Ok(decoded))) => Ok(decoded.body),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::new(
                StatusCode::BadConnectionClosed,
                "the pending request's promise was dropped before completion",
            )),
            Err(_) => {
                self.correlator.fail(request_id, StatusCode::BadTimeout);
                Err(Error::new(StatusCode::BadTimeout, "request timed out"))
            }
        }
    }
}

/// A handle callers use to send requests and await responses on one secure channel.
/// Cheap to clone: every field is an `Arc` or a `Sender`.
#[derive(Clone)]
pub struct ChannelHandle {
    secure_channel: Arc<RwLock<SecureChannel>>,
    correlator: Arc<Correlator>,
    outgoing: QueueHandle,
    renew_lock: Arc<Mutex<()>>,
    token_issuer: Arc<dyn TokenIssuer>,
    config: TransportConfig,
}

impl ChannelHandle {
    pub fn new(
        secure_channel: Arc<RwLock<SecureChannel>>,
        correlator: Arc<Correlator>,
        outgoing: QueueHandle,
        token_issuer: Arc<dyn TokenIssuer>,
        config: TransportConfig,
    ) -> Self {
        Self {
            secure_channel,
            correlator,
            outgoing,
            renew_lock: Arc::new(Mutex::new(())),
            token_issuer,
            config,
        }
    }

    /// Send `request` and await its matching response body, renewing the security token
    /// first if it has aged past the configured renewal fraction.
    pub async fn send<M: Message>(&self, request: M, timeout: Duration) -> Result<Vec<u8>, Error> {
        self.maybe_renew_token().await?;

        let request_handle = request.request_handle();
        let mut body = Vec::with_capacity(request.byte_len());
        request.encode(&mut body)?;

        let (request_id, chunks) = {
            let mut secure_channel = self.secure_channel.write();
            let request_id = secure_channel.next_request_id();
            let chunks = chunker::encode(
                &body,
                MessageChunkType::Message,
                request_id,
                &mut secure_channel,
                self.config.max_chunk_size as usize,
            )?;
            (request_id, chunks)
        };

        let receipt = self.correlator.register(request_id, request_handle);
        self.outgoing.submit(flatten_chunks(chunks)).await?;

        match tokio::time::timeout(timeout, receipt.receiver).await {
            Ok(Ok(Ok(decoded))) => Ok(decoded.body),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::new(
                StatusCode::BadConnectionClosed,
                "the pending request's promise was dropped before completion",
            )),
            Err(_) => {
                self.correlator.fail(request_id, StatusCode::BadTimeout);
                Err(Error::new(StatusCode::BadTimeout, "request timed out"))
            }
        }
    }

    async fn maybe_renew_token(&self) -> Result<(), Error> {
        let should_renew = self
            .secure_channel
            .read()
            .should_renew_security_token(self.config.security_token_renewal_fraction);
        if !should_renew {
            return Ok(());
        }

        // Double-checked under the renew lock: the first sender through does the renewal,
        // everyone else queued behind the lock finds it already done.
        let _guard = self.renew_lock.lock().await;
        let still_should_renew = self
            .secure_channel
            .read()
            .should_renew_security_token(self.config.security_token_renewal_fraction);
        if !still_should_renew {
            return Ok(());
        }
        let raw_channel = RawChannel::new(
            self.secure_channel.clone(),
            self.correlator.clone(),
            self.outgoing.clone(),
            self.config.max_chunk_size as usize,
        );
        self.token_issuer
            .open(&self.secure_channel, self.config.channel_lifetime_ms, &raw_channel)
            .await
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn secure_channel(&self) -> &Arc<RwLock<SecureChannel>> {
        &self.secure_channel
    }

    pub(crate) fn outgoing(&self) -> &QueueHandle {
        &self.outgoing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcua_transport_core::Role;
    use opcua_transport_crypto::{MessageSecurityMode, SecurityPolicy};
    use opcua_transport_types::TestStackRequest;

    struct NoopIssuer;

    #[async_trait]
    impl TokenIssuer for NoopIssuer {
        async fn open(
            &self,
            secure_channel: &Arc<RwLock<SecureChannel>>,
            requested_lifetime_ms: u32,
            _raw_channel: &RawChannel,
        ) -> Result<(), Error> {
            let mut sc = secure_channel.write();
            sc.create_random_nonce();
            sc.set_security_token(sc.current_token_id().unwrap_or(0) + 1, requested_lifetime_ms);
            Ok(())
        }
    }

    fn handle() -> (ChannelHandle, opcua_transport_core::SerializationQueue) {
        let secure_channel = Arc::new(RwLock::new(SecureChannel::new(
            Role::Client,
            SecurityPolicy::None,
            MessageSecurityMode::None,
        )));
        let (outgoing, queue) = opcua_transport_core::queue_channel(8);
        let handle = ChannelHandle::new(
            secure_channel,
            Arc::new(Correlator::new()),
            outgoing,
            Arc::new(NoopIssuer),
            TransportConfig::default(),
        );
        (handle, queue)
    }

    #[tokio::test]
    async fn sending_a_request_submits_exactly_one_outgoing_message_awaiting_a_response() {
        let (handle, queue) = handle();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let drain = tokio::spawn(queue.run(move |payload: Vec<u8>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload).await;
                Ok(())
            }
        }));

        let send = tokio::spawn(async move {
            handle
                .send(
                    TestStackRequest {
                        request_handle: 1,
                        payload: vec![9],
                    },
                    Duration::from_secs(5),
                )
                .await
        });

        let payload = rx.recv().await.unwrap();
        assert!(!payload.is_empty());

        // simulate the transport completing the request immediately.
        drop(send);
        drain.abort();
    }

    #[tokio::test]
    async fn a_request_that_never_completes_times_out() {
        let (handle, _rx) = handle();
        let result = handle
            .send(
                TestStackRequest {
                    request_handle: 1,
                    payload: vec![],
                },
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(result.unwrap_err().status(), StatusCode::BadTimeout);
    }
}
