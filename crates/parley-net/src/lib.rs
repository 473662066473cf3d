// Socket layer: one bidirectional connection to the chat server, with
// reconnection, outbound queueing, and per-event subscription fan-out.

pub mod error;
pub mod link;
pub mod transport;

pub use error::NetError;
pub use link::{channel_link, ChannelLink, ChannelPeer, LinkHandle, OutboundFrame, SocketLink, WsLink};
pub use transport::{EventHandler, SocketTransport, TransportConfig};
