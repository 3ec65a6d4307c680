//! Wire protocol and transport layer for the feed stream
//!
//! This module provides:
//! - The JSON frame envelope and its classification into responses,
//!   updates, and unrecognized frames
//! - The `Connector`/`TransportSink`/`TransportStream` seam over the
//!   underlying duplex transport
//! - The production tokio-tungstenite transport implementation

pub mod frame;
pub mod transport;

pub use frame::*;
pub use transport::*;
