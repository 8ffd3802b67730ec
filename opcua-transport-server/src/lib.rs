//! The server half of the transport layer: an accept pipeline that negotiates HELLO/ACK and
//! OpenSecureChannel per connection, then dispatches MSG bodies to registered handlers.

pub mod accept;
pub mod channel_opener;
pub mod dispatch;
pub mod handler_registry;
pub mod listener;

pub use accept::{ChannelIdAllocator, EndpointConfig};
pub use channel_opener::ChannelOpener;
pub use dispatch::RequestHandler;
pub use handler_registry::HandlerRegistry;
pub use listener::{ServerHandle, TransportServer};
