//! Error taxonomy for caller-initiated client operations

use std::time::Duration;
use thiserror::Error;

use crate::ws::transport::TransportError;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The transport never came up, even after retries. Fatal only to the
    /// call that triggered the dial.
    #[error("connection failed after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// No response arrived within the request timeout. The registry entry
    /// for a pending subscribe is rolled back before this is returned.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),
    #[error("topic mismatch: subscribed to '{expected}' but server confirmed '{actual}'")]
    TopicMismatch { expected: String, actual: String },
    #[error("subscription rejected by server: {0}")]
    SubscriptionRejected(String),
    /// The connection dropped or was released while the request was pending.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
