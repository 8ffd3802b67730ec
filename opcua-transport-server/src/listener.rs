//! The server's exposed surface: register endpoints and request handlers, then run an accept
//! loop that spawns [`accept::run_connection`] per socket until asked to shut down. Grounded
//! on `opcua_server::server::Server`'s accept loop and cancellation token usage.

use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use opcua_transport_core::TransportConfig;
use opcua_transport_crypto::{MessageSecurityMode, SecurityPolicy};
use opcua_transport_types::{Error, StatusCode};

use crate::accept::{self, ChannelIdAllocator, EndpointConfig};
use crate::channel_opener::ChannelOpener;
use crate::dispatch::RequestHandler;
use crate::handler_registry::HandlerRegistry;

/// One endpoint registered via `addEndpoint`: the address a listener binds and the security
/// settings every connection on it is negotiated under.
struct Endpoint {
    bind_addr: String,
    config: EndpointConfig,
}

/// Accepts connections for every registered endpoint and dispatches their requests to
/// registered handlers. Consumed by [`TransportServer::startup`]; what comes back is a
/// [`ServerHandle`] for shutdown, the teacher's `Server`/`ServerHandle` split.
pub struct TransportServer {
    endpoints: Vec<Endpoint>,
    handlers: Arc<HandlerRegistry>,
    channel_opener: Arc<dyn ChannelOpener>,
    transport: TransportConfig,
}

/// A running server's handle: the only thing callers need to ask it to stop, plus the
/// addresses each endpoint actually bound (useful when `addEndpoint` was given port `0`).
pub struct ServerHandle {
    token: CancellationToken,
    accept_loops: Vec<JoinHandle<()>>,
    local_addrs: Vec<std::net::SocketAddr>,
}

impl TransportServer {
    pub fn new(channel_opener: Arc<dyn ChannelOpener>, transport: TransportConfig) -> Self {
        Self {
            endpoints: Vec::new(),
            handlers: Arc::new(HandlerRegistry::new()),
            channel_opener,
            transport,
        }
    }

    /// Register an endpoint this server will accept connections on once started.
    /// `endpoint_url` is the URL clients must send in HELLO to be accepted here; a mismatch
    /// is rejected with `BadTcpEndpointUrlInvalid` rather than negotiated.
    pub fn add_endpoint(
        &mut self,
        bind_addr: impl Into<String>,
        endpoint_url: impl Into<String>,
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
    ) {
        self.endpoints.push(Endpoint {
            bind_addr: bind_addr.into(),
            config: EndpointConfig {
                endpoint_url: endpoint_url.into(),
                security_policy: policy,
                security_mode: mode,
                transport: self.transport,
                hello_timeout: std::time::Duration::from_secs(5),
            },
        });
    }

    /// Register a handler for requests whose leading type identifier is `type_id`.
    pub fn add_request_handler(&self, type_id: u32, handler: Arc<dyn RequestHandler>) {
        self.handlers.register(type_id, handler);
    }

    /// Register the handler used for any request type with no specific registration, e.g. a
    /// `GetEndpoints` responder servicing the discovery convenience path.
    pub fn set_default_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.handlers.set_default(handler);
    }

    /// Bind every registered endpoint and start accepting connections on each.
    pub async fn startup(self) -> Result<ServerHandle, Error> {
        if self.endpoints.is_empty() {
            return Err(Error::new(
                StatusCode::BadInvalidState,
                "server has no endpoints registered",
            ));
        }

        let token = CancellationToken::new();
        let channel_ids = Arc::new(ChannelIdAllocator::new());
        let mut accept_loops = Vec::with_capacity(self.endpoints.len());
        let mut local_addrs = Vec::with_capacity(self.endpoints.len());

        for endpoint in self.endpoints {
            let listener = TcpListener::bind(&endpoint.bind_addr).await.map_err(|err| {
                Error::new(
                    StatusCode::BadResourceUnavailable,
                    format!("failed to bind {}: {err}", endpoint.bind_addr),
                )
            })?;
            let local_addr = listener.local_addr().map_err(|err| {
                Error::new(StatusCode::BadResourceUnavailable, format!("failed to read bound address: {err}"))
            })?;
            local_addrs.push(local_addr);
            info!("listening on {local_addr}");

            let handlers = self.handlers.clone();
            let channel_opener = self.channel_opener.clone();
            let channel_ids = channel_ids.clone();
            let endpoint_config = endpoint.config;
            let token = token.clone();

            accept_loops.push(tokio::task::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            info!("endpoint shutting down");
                            return;
                        }
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => {
                                    info!("accepted connection from {peer}");
                                    tokio::task::spawn(accept::run_connection(
                                        stream,
                                        endpoint_config.clone(),
                                        channel_ids.clone(),
                                        channel_opener.clone(),
                                        handlers.clone(),
                                    ));
                                }
                                Err(err) => {
                                    error!("accept failed: {err}");
                                }
                            }
                        }
                    }
                }
            }));
        }

        Ok(ServerHandle { token, accept_loops, local_addrs })
    }
}

impl ServerHandle {
    /// The address each registered endpoint actually bound, in registration order. Reading
    /// this back is how a caller that registered port `0` finds the port the OS picked.
    pub fn local_addrs(&self) -> &[std::net::SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting new connections on every endpoint. In-flight connections finish on
    /// their own; this does not forcibly close established sockets.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.accept_loops {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opcua_transport_core::SecureChannel;

    struct NoopOpener;

    #[async_trait]
    impl ChannelOpener for NoopOpener {
        async fn open(&self, _secure_channel: &mut SecureChannel, _request_body: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn startup_without_any_endpoint_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let server = TransportServer::new(Arc::new(NoopOpener), TransportConfig::default());
        let err = rt.block_on(server.startup()).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadInvalidState);
    }

    #[tokio::test]
    async fn a_registered_endpoint_binds_and_can_be_shut_down() {
        let mut server = TransportServer::new(Arc::new(NoopOpener), TransportConfig::default());
        server.add_endpoint(
            "127.0.0.1:0",
            "opc.tcp://127.0.0.1:0",
            SecurityPolicy::None,
            MessageSecurityMode::None,
        );
        let handle = server.startup().await.unwrap();
        handle.shutdown().await;
    }
}
