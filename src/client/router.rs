//! Inbound frame demultiplexing

use tracing::{debug, warn};

use crate::client::correlator::RequestCorrelator;
use crate::client::registry::SubscriptionRegistry;
use crate::ws::frame::{Frame, WireFrame};

/// What became of one inbound frame
#[derive(Debug, PartialEq, Eq)]
pub enum Routed {
    /// Resolved a pending request
    Response,
    /// Fanned out to confirmed subscriptions
    Update { delivered: usize },
    /// Unparseable or unrecognized; dropped with a diagnostic
    Dropped,
}

/// Demultiplexes the single inbound frame stream.
///
/// Pending requests always take priority: every frame is offered to the
/// correlator first, and only unclaimed frames are considered for update
/// fan-out. The router never re-filters updates by topic; which topics
/// arrive on the connection is the server's contract.
pub struct MessageRouter {
    log_frames: bool,
}

impl MessageRouter {
    pub fn new(log_frames: bool) -> Self {
        Self { log_frames }
    }

    pub fn route(
        &self,
        correlator: &RequestCorrelator,
        registry: &SubscriptionRegistry,
        text: &str,
    ) -> Routed {
        if self.log_frames {
            debug!(frame = %text, "inbound frame");
        }

        let frame = match WireFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unparseable frame");
                return Routed::Dropped;
            }
        };

        let frame = match correlator.complete(frame) {
            None => return Routed::Response,
            Some(frame) => frame,
        };

        match frame.classify() {
            Frame::Update { kind, payload } => {
                let delivered = registry.deliver(&kind, &payload);
                if delivered == 0 {
                    debug!(%kind, "update frame with no confirmed subscribers");
                }
                Routed::Update { delivered }
            }
            Frame::Response { kind, .. } => {
                debug!(%kind, "dropping response with no pending request");
                Routed::Dropped
            }
            Frame::Unrecognized { kind } => {
                debug!(%kind, "dropping unrecognized frame");
                Routed::Dropped
            }
        }
    }
}
