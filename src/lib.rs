//! feedlink: real-time subscription client for multiplexed trading data feeds
//!
//! One WebSocket transport per endpoint URL, shared across holders by
//! reference counting. Subscriptions are established through a confirmation
//! handshake, update frames are routed to their confirmed subscriptions, and
//! after a transport loss every confirmed subscription is replayed with its
//! original parameters.

pub mod client;
pub mod logging;
pub mod ws;

pub use client::{
    ClientConfig, ClientError, ClientEvent, ConnectionHandle, ConnectionManager, ConnectionState,
    ConnectionStats, Subscription,
};
pub use ws::transport::{Connector, TransportError, WsConnector};
