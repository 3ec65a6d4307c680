//! Request/response correlation over the shared frame stream

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::client::error::ClientError;
use crate::ws::frame::{response_kind, ResponsePayload, WireFrame};

/// One in-flight request awaiting its response
struct PendingRequest {
    /// Response type the server will answer with
    expected_kind: String,
    /// Issue order, used to resolve type-matched responses oldest-first
    seq: u64,
    tx: oneshot::Sender<WireFrame>,
}

/// Matches outgoing request frames to incoming response frames.
///
/// Every request carries a unique correlation id which the server echoes in
/// its response, so any number of same-type requests may be in flight at
/// once. Responses without an id fall back to declared-type matching against
/// the oldest pending request of that type.
pub struct RequestCorrelator {
    pending: DashMap<String, PendingRequest>,
    seq: AtomicU64,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Send one request and await its correlated response.
    ///
    /// `send` pushes the serialized frame onto the outbound channel; it is
    /// synchronous because outbound ordering is owned by the session task.
    /// The pending entry is removed on every exit path.
    pub async fn send_request(
        &self,
        send: impl Fn(String) -> Result<(), ClientError>,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<ResponsePayload, ClientError> {
        let correlation_id = Uuid::new_v4().to_string();
        let frame = WireFrame::request(kind, correlation_id.clone(), payload);
        let text = frame.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id.clone(),
            PendingRequest {
                expected_kind: response_kind(kind),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                tx,
            },
        );

        if let Err(e) = send(text) {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                let payload = response.payload.unwrap_or(Value::Null);
                Ok(serde_json::from_value::<ResponsePayload>(payload)?)
            }
            // Sender dropped: the connection went away underneath us
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&correlation_id);
                debug!(kind, correlation_id, "request timed out");
                Err(ClientError::RequestTimeout(timeout))
            }
        }
    }

    /// Offer an inbound frame to the pending requests.
    ///
    /// Returns `None` when the frame resolved a request, or hands the frame
    /// back for update routing. Id matches win; otherwise the oldest pending
    /// request expecting this frame type is resolved.
    pub fn complete(&self, frame: WireFrame) -> Option<WireFrame> {
        let matched_by_id = match frame.id.as_deref() {
            Some(id) => self.pending.remove(id),
            None => None,
        };
        if let Some((_, entry)) = matched_by_id {
            let _ = entry.tx.send(frame);
            return None;
        }

        let key = self
            .pending
            .iter()
            .filter(|entry| entry.value().expected_kind == frame.kind)
            .min_by_key(|entry| entry.value().seq)
            .map(|entry| entry.key().clone());

        if let Some(key) = key {
            if let Some((_, entry)) = self.pending.remove(&key) {
                let _ = entry.tx.send(frame);
                return None;
            }
        }

        Some(frame)
    }

    /// Drop every pending request, waking each waiter with a closed error.
    ///
    /// Called on transport loss and on release so no request waits out its
    /// full timeout against a dead connection.
    pub fn fail_all(&self) {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            debug!(dropped, "failed all pending requests");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
