//! Chunk framing, secure channel state, HELLO/ACK negotiation, request correlation and the
//! serialization queue: everything a client or server transport needs that isn't specific to
//! which side of the socket it's on.

pub mod comms;
pub mod config;
pub mod correlator;
pub mod hello;
pub mod queue;

pub use comms::chunk_info::ChunkInfo;
pub use comms::chunker::{self, DecodedMessage};
pub use comms::codec::TransportCodec;
pub use comms::secure_channel::{Role, SecureChannel, SecurityToken, SEQUENCE_NUMBER_WRAP_AT};
pub use comms::security_header::{AsymmetricSecurityHeader, SecurityHeader, SymmetricSecurityHeader};
pub use config::{SessionRetryPolicy, TransportConfig};
pub use correlator::{Correlator, PendingReceipt, RequestOutcome};
pub use hello::{negotiate, AcknowledgeMessage, ChannelParameters, HelloMessage, PROTOCOL_VERSION};
pub use queue::{channel as queue_channel, QueueHandle, SerializationQueue};
