//! # Message Channel
//!
//! A single reconnecting connection to the chat server, split into:
//! - `message`: the `{type, ...}` wire envelope and the connection state enum
//! - `transport`: the connector/transport port and its WebSocket implementation
//! - `manager`: connect, dispatch, heartbeat and the bounded retry policy

pub mod manager;
pub mod message;
pub mod transport;

pub use manager::{ChannelManager, MessageHandler};
pub use message::{ConnectionState, Message, HEARTBEAT_TYPE};
pub use transport::{Connector, EventSink, Transport, TransportEvent, WsConnector};
