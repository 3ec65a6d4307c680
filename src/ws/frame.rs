//! Wire protocol frames for the feed stream

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suffix carried by every response to a subscribe/unsubscribe request
pub const RESPONSE_SUFFIX: &str = ".response";
/// Suffix carried by every streamed update frame
pub const UPDATE_SUFFIX: &str = ".update";

/// Message type for subscribing to a resource feed
pub fn subscribe_kind(resource: &str) -> String {
    format!("{resource}.subscribe")
}

/// Message type for unsubscribing from a resource feed
pub fn unsubscribe_kind(resource: &str) -> String {
    format!("{resource}.unsubscribe")
}

/// Message type carried by updates for a resource feed
pub fn update_kind(resource: &str) -> String {
    format!("{resource}{UPDATE_SUFFIX}")
}

/// Message type the server answers a given request with
pub fn response_kind(request_kind: &str) -> String {
    format!("{request_kind}{RESPONSE_SUFFIX}")
}

/// Raw JSON envelope exchanged over the transport.
///
/// Requests carry a correlation `id` which the server echoes back in its
/// response; servers that predate correlation ids omit it and responses are
/// then matched by declared type instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl WireFrame {
    /// Build an outbound request frame
    pub fn request(kind: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
            payload: Some(payload),
        }
    }

    /// Parse one frame from its wire text
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize the frame to its wire text
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Classify an inbound frame by its type suffix
    pub fn classify(self) -> Frame {
        if self.kind.ends_with(RESPONSE_SUFFIX) {
            Frame::Response {
                kind: self.kind,
                id: self.id,
                payload: self.payload.unwrap_or(Value::Null),
            }
        } else if self.kind.ends_with(UPDATE_SUFFIX) {
            Frame::Update {
                kind: self.kind,
                payload: self.payload.unwrap_or(Value::Null),
            }
        } else {
            Frame::Unrecognized { kind: self.kind }
        }
    }
}

/// Inbound frame classified at the router boundary
#[derive(Debug, Clone)]
pub enum Frame {
    /// Answer to a subscribe/unsubscribe request
    Response {
        kind: String,
        id: Option<String>,
        payload: Value,
    },
    /// Streamed data for a confirmed subscription
    Update { kind: String, payload: Value },
    /// Anything the protocol does not know about
    Unrecognized { kind: String },
}

/// Body of a subscribe/unsubscribe response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub status: ResponseStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub topic: String,
}

impl ResponsePayload {
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Server verdict on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}
