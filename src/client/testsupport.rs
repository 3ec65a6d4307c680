//! In-memory transport for exercising the client without a network

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::ws::frame::{response_kind, WireFrame};
use crate::ws::transport::{
    Connector, TransportError, TransportEvent, TransportPair, TransportSink, TransportStream,
};

/// Test-side ends of one mock transport.
///
/// Dropping `inbound` makes the client observe a transport failure; sending
/// `Ok(TransportEvent::Closed)` simulates a clean server-side close.
pub(crate) struct MockLink {
    /// Frames the client sent, in order
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// Inject inbound events
    pub inbound: mpsc::UnboundedSender<Result<TransportEvent, TransportError>>,
}

/// Connector whose dials produce channel-backed transports, handing the
/// test side of each one through the links channel.
pub(crate) struct MockConnector {
    pub connects: AtomicUsize,
    fail_budget: AtomicUsize,
    links: mpsc::UnboundedSender<MockLink>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockLink>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                fail_budget: AtomicUsize::new(0),
                links: tx,
            }),
            rx,
        )
    }

    /// Make the next `n` dials fail
    pub fn fail_next(&self, n: usize) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<TransportPair, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n - 1)
                }
            })
            .is_ok();
        if should_fail {
            return Err(TransportError::Closed);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.links.send(MockLink {
            outbound: out_rx,
            inbound: in_tx,
        });
        Ok(TransportPair {
            sink: Box::new(MockSink { tx: out_tx }),
            stream: Box::new(MockStream { rx: in_rx }),
        })
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::ChannelSend)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<TransportEvent, TransportError>>,
}

#[async_trait]
impl TransportStream for MockStream {
    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        match self.rx.recv().await {
            Some(event) => event,
            None => Err(TransportError::Closed),
        }
    }
}

/// Build the ok-response text for a received request frame, echoing its
/// correlation id.
pub(crate) fn ok_response_for(request_text: &str, topic: &str) -> String {
    response_for(request_text, "ok", "", topic)
}

pub(crate) fn response_for(request_text: &str, status: &str, message: &str, topic: &str) -> String {
    let request = WireFrame::parse(request_text).unwrap();
    let response = WireFrame {
        kind: response_kind(&request.kind),
        id: request.id,
        payload: Some(json!({"status": status, "message": message, "topic": topic})),
    };
    response.encode().unwrap()
}

/// An update frame as wire text
pub(crate) fn update_frame(kind: &str, payload: serde_json::Value) -> String {
    WireFrame {
        kind: kind.to_string(),
        id: None,
        payload: Some(payload),
    }
    .encode()
    .unwrap()
}
