//! The client half of the transport layer: a secure channel wrapper that renews its own
//! security token, a pluggable TCP connector, and the connection state machine that drives
//! connect/reconnect/disconnect around them.

pub mod channel;
pub mod connection;
pub mod fsm;
pub mod transport;

pub use channel::{ChannelHandle, RawChannel, TokenIssuer};
pub use connection::Client;
pub use fsm::{transition, Action, ConnectionState, Event, FailureKind, QueuedRequest};
pub use transport::connect::{Connector, Transport};
pub use transport::tcp::{TcpConnector, TcpTransport, TransportConfiguration};
pub use transport::{OutgoingMessage, TransportPollResult};
