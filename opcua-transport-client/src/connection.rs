//! The actual connect/reconnect/disconnect/send lifecycle: a background task that drives
//! [`fsm::transition`] from caller commands and transport events, dispatching each
//! [`Action`] against a real [`Connector`] and [`TokenIssuer`]. Grounded on
//! `async_opcua_client::session::Session`'s event loop and reconnect handling, and on
//! `opcua_client::transport::channel::AsyncSecureChannel`'s `ArcSwapOption`-published send
//! half.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use log::{debug, warn};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use opcua_transport_core::{Role, SecureChannel, TransportConfig};
use opcua_transport_crypto::{MessageSecurityMode, SecurityPolicy};
use opcua_transport_types::{Error, Message, StatusCode};

use crate::channel::{ChannelHandle, RawChannel, TokenIssuer};
use crate::fsm::{self, Action, ConnectionState, Event, FailureKind, QueuedRequest};
use crate::transport::connect::{ConnectedTransport, Connector, Transport};
use crate::transport::tcp::TransportConfiguration;
use crate::transport::TransportPollResult;

/// Commands/events fed to the driver task, both the caller-originated ones and the
/// transport-originated ones the poll loop reports back.
enum DriverMessage {
    Connect(oneshot::Sender<Result<(), Error>>),
    Disconnect(oneshot::Sender<()>),
    Internal(Event),
}

/// How many in-flight driver messages (commands plus reported transport events) may queue
/// up before a caller or the poll loop has to wait.
const INBOX_CAPACITY: usize = 32;

/// Maps a connect failure onto the FSM's stale-channel/other distinction: a server that no
/// longer recognizes the channel id a fresh OPN request is eligible for exactly one retry
/// with a brand-new `SecureChannel`.
fn failure_kind(status: StatusCode) -> FailureKind {
    if status == StatusCode::BadSecureChannelIdInvalid {
        FailureKind::StaleChannel
    } else {
        FailureKind::Other(status)
    }
}

/// The client surface: `connect`, `send_request`, `disconnect`. Cheap to clone — every
/// field is either an `Arc` or a channel sender.
#[derive(Clone)]
pub struct Client {
    current: Arc<ArcSwapOption<ChannelHandle>>,
    inbox: mpsc::Sender<DriverMessage>,
}

impl Client {
    pub fn new(
        endpoint_url: impl Into<String>,
        security_policy: SecurityPolicy,
        security_mode: MessageSecurityMode,
        connector: Arc<dyn Connector>,
        token_issuer: Arc<dyn TokenIssuer>,
        transport_configuration: TransportConfiguration,
        config: TransportConfig,
    ) -> Self {
        let current: Arc<ArcSwapOption<ChannelHandle>> = Arc::new(ArcSwapOption::default());
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let secure_channel = Arc::new(RwLock::new(SecureChannel::new(
            Role::Client,
            security_policy,
            security_mode,
        )));

        let driver = Driver {
            state: ConnectionState::Idle,
            current: current.clone(),
            inbox: inbox_tx.clone(),
            poll_task: None,
            pending_connect: None,
            pending_disconnect: None,
            secure_channel,
            connector,
            token_issuer,
            endpoint_url: endpoint_url.into(),
            transport_configuration,
            config,
        };
        tokio::task::spawn(driver.run(inbox_rx));

        Self {
            current,
            inbox: inbox_tx,
        }
    }

    /// Connect if idle, or wait for whatever connect attempt is already underway. Resolves
    /// once the channel reaches `Connected` or the attempt gives up and returns to `Idle`.
    pub async fn connect(&self) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbox
            .send(DriverMessage::Connect(reply_tx))
            .await
            .map_err(|_| Error::new(StatusCode::BadNotConnected, "the connection driver has shut down"))?;
        reply_rx
            .await
            .map_err(|_| Error::new(StatusCode::BadNotConnected, "the connection driver dropped the connect request"))?
    }

    /// Send `request` on whatever channel is currently live and await its matching response.
    /// Returns `BadNotConnected` immediately rather than queueing if no channel is up.
    pub async fn send_request<M: Message>(&self, request: M, timeout: Duration) -> Result<Vec<u8>, Error> {
        let handle = self.current.load_full().ok_or_else(|| {
            Error::new(StatusCode::BadNotConnected, "no secure channel is currently connected")
        })?;
        handle.send(request, timeout).await
    }

    /// Send CloseSecureChannel and tear the connection down. Returns once the driver has
    /// reached `Disconnected`; a no-op if already disconnected.
    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.inbox.send(DriverMessage::Disconnect(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// Owns the FSM state and everything needed to carry out its actions: the secure channel
/// shared with whatever `ChannelHandle` is currently published, the connector used to
/// (re)establish a transport, and the token issuer that performs the OPN handshake itself.
struct Driver {
    state: ConnectionState,
    current: Arc<ArcSwapOption<ChannelHandle>>,
    inbox: mpsc::Sender<DriverMessage>,
    poll_task: Option<JoinHandle<()>>,
    pending_connect: Option<oneshot::Sender<Result<(), Error>>>,
    pending_disconnect: Option<oneshot::Sender<()>>,
    secure_channel: Arc<RwLock<SecureChannel>>,
    connector: Arc<dyn Connector>,
    token_issuer: Arc<dyn TokenIssuer>,
    endpoint_url: String,
    transport_configuration: TransportConfiguration,
    config: TransportConfig,
}

impl Driver {
    async fn run(mut self, mut inbox: mpsc::Receiver<DriverMessage>) {
        while let Some(message) = inbox.recv().await {
            let event = match message {
                DriverMessage::Connect(reply) => {
                    self.pending_connect = Some(reply);
                    Event::Connect
                }
                DriverMessage::Disconnect(reply) => {
                    self.pending_disconnect = Some(reply);
                    Event::Disconnect
                }
                DriverMessage::Internal(event) => event,
            };
            self.advance(event).await;
        }
    }

    /// Apply one event, run whatever action it produces, then answer any caller waiting on
    /// the outcome if the resulting state is terminal for their request. A `Bootstrap`
    /// action resolves asynchronously: it reports its own `ConnectSucceeded`/`ConnectFailed`
    /// back through the inbox rather than recursing, so this never needs to wait on itself.
    async fn advance(&mut self, event: Event) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Idle);
        let (next_state, action) = fsm::transition(state, event);
        self.state = next_state;
        self.run_action(action).await;

        match &self.state {
            ConnectionState::Connected => {
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            ConnectionState::Idle => {
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Err(Error::new(
                        StatusCode::BadCommunicationError,
                        "failed to establish a secure channel",
                    )));
                }
            }
            ConnectionState::Disconnected(_) => {
                if let Some(reply) = self.pending_disconnect.take() {
                    let _ = reply.send(());
                }
            }
            _ => {}
        }
    }

    async fn run_action(&mut self, action: Action) {
        match action {
            Action::Bootstrap { fresh_channel } => self.bootstrap(fresh_channel).await,
            Action::FlushQueue(queued) => self.flush_queue(queued).await,
            Action::FailAll(status) => {
                if let Some(old) = self.current.swap(None) {
                    old.correlator().fail_all(status);
                }
            }
            // No separate resend cache exists once a request has been handed to a
            // transport's write queue, so a channel that goes away while requests are
            // in flight fails them outright rather than replaying them on the next one.
            Action::ResendInFlight => {
                if let Some(handle) = self.current.load_full() {
                    handle.correlator().fail_all(StatusCode::BadConnectionClosed);
                }
            }
            Action::SendCloseAndClose => self.send_close_and_close().await,
            Action::None => {}
        }
    }

    async fn bootstrap(&mut self, fresh_channel: bool) {
        if let Some(old) = self.current.swap(None) {
            old.correlator().fail_all(StatusCode::BadConnectionClosed);
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }

        if fresh_channel {
            let (policy, mode) = {
                let sc = self.secure_channel.read();
                (sc.security_policy(), sc.security_mode())
            };
            *self.secure_channel.write() = SecureChannel::new(Role::Client, policy, mode);
        }

        let connected = match self
            .connector
            .connect(self.secure_channel.clone(), self.transport_configuration.clone(), &self.endpoint_url)
            .await
        {
            Ok(connected) => connected,
            Err(status) => {
                self.report(Event::ConnectFailed(failure_kind(status))).await;
                return;
            }
        };

        let ConnectedTransport { mut transport, outgoing } = connected;
        let correlator = transport.correlator();
        let raw_channel = RawChannel::new(
            self.secure_channel.clone(),
            correlator.clone(),
            outgoing.clone(),
            self.config.max_chunk_size as usize,
        );

        // The poll loop has to be running before the OPN exchange below: it is the only
        // thing that reads the socket and completes the correlator entry `raw_channel`'s
        // request is waiting on, including the OPN response itself.
        let inbox = self.inbox.clone();
        self.poll_task = Some(tokio::task::spawn(async move {
            loop {
                match transport.poll().await {
                    TransportPollResult::IncomingChunk => continue,
                    TransportPollResult::RecoverableError(status) => {
                        warn!("recoverable transport error: {status:?}");
                        continue;
                    }
                    TransportPollResult::Closed(status) => {
                        debug!("transport closed: {status:?}");
                        let _ = inbox.send(DriverMessage::Internal(Event::ChannelInactive)).await;
                        return;
                    }
                }
            }
        }));

        if let Err(err) = self
            .token_issuer
            .open(&self.secure_channel, self.config.channel_lifetime_ms, &raw_channel)
            .await
        {
            if let Some(task) = self.poll_task.take() {
                task.abort();
            }
            self.report(Event::ConnectFailed(failure_kind(err.status()))).await;
            return;
        }

        let handle = ChannelHandle::new(
            self.secure_channel.clone(),
            correlator,
            outgoing,
            self.token_issuer.clone(),
            self.config,
        );
        self.current.store(Some(Arc::new(handle)));

        self.report(Event::ConnectSucceeded).await;
    }

    async fn flush_queue(&mut self, queued: Vec<QueuedRequest>) {
        let Some(handle) = self.current.load_full() else {
            return;
        };
        for request in queued {
            let payload: Vec<u8> = request.outgoing.chunks.into_iter().flatten().collect();
            if let Err(err) = handle.outgoing().submit(payload).await {
                warn!("failed to flush a queued request: {err}");
            }
        }
    }

    async fn send_close_and_close(&mut self) {
        if let Some(handle) = self.current.swap(None) {
            let raw_channel = RawChannel::new(
                handle.secure_channel().clone(),
                handle.correlator().clone(),
                handle.outgoing().clone(),
                self.config.max_chunk_size as usize,
            );
            if let Err(err) = raw_channel.close_secure_channel(&[]).await {
                warn!("failed to send CloseSecureChannel: {err}");
            }
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.report(Event::ChannelInactive).await;
    }

    /// Feed an event back through the inbox rather than recursing into `advance` directly:
    /// `bootstrap`/`send_close_and_close` run inside `run_action`, which `advance` is still
    /// on the stack of, and an async function cannot call itself without boxing its future.
    async fn report(&self, event: Event) {
        let _ = self.inbox.send(DriverMessage::Internal(event)).await;
    }
}
