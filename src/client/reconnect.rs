//! Transport-loss recovery: backoff schedule and subscription replay

use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tracing::{debug, error, info, warn};

use crate::client::connection::ConnectionInner;
use crate::client::error::ClientError;
use crate::client::events::{ClientEvent, ConnectionState};
use crate::client::registry::ReplayTicket;
use crate::ws::frame::subscribe_kind;

/// Deterministic doubling schedule: base, 2·base, 4·base, ... capped at max.
pub(crate) fn backoff_schedule(base_ms: u64, max_ms: u64) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(base_ms),
        initial_interval: Duration::from_millis(base_ms),
        max_interval: Duration::from_millis(max_ms),
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Drive a lost connection back to CONNECTED, then replay subscriptions.
///
/// Runs on the session task that observed the loss. Each attempt waits its
/// backoff delay first, then dials. Exhausting the attempt budget is
/// terminal: every remaining subscription is evicted and reported, and the
/// connection stays down until an explicit connect.
pub(crate) fn reconnect_loop(
    inner: Arc<ConnectionInner>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    // Named, explicitly-`Send` return type (rather than an `async fn`'s opaque
    // future) so the recursion through `establish` -> session task ->
    // `reconnect_loop` has a concrete type to close the auto-trait cycle on.
    Box::pin(async move {
    let config = &inner.config;
    let mut backoff = backoff_schedule(config.reconnect_delay_ms, config.max_reconnect_delay_ms);
    let max_attempts = config.max_reconnect_attempts;

    for attempt in 1..=max_attempts {
        if inner.is_closed() {
            return;
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or(Duration::from_millis(config.reconnect_delay_ms));
        inner
            .set_state(ConnectionState::Reconnecting { attempt })
            .await;
        inner.emit(ClientEvent::Reconnecting {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            url = %inner.config.url,
            "scheduling reconnect attempt"
        );
        tokio::time::sleep(delay).await;

        if inner.is_closed() {
            return;
        }
        inner.stats.write().await.reconnect_attempts += 1;

        match inner.establish().await {
            Ok(()) => {
                replay_subscriptions(&inner).await;
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }

    error!(
        attempts = max_attempts,
        url = %inner.config.url,
        "reconnect attempts exhausted, connection stays down"
    );
    inner.set_state(ConnectionState::Disconnected).await;
    inner.correlator.fail_all();
    for ticket in inner.registry.drain_all() {
        evict(&inner, &ticket, "reconnect attempts exhausted".to_string());
    }
    inner.emit(ClientEvent::ReconnectsExhausted {
        attempts: max_attempts,
    });
    inner.emit(ClientEvent::Disconnected);
    })
}

/// Re-run the subscribe handshake for every previously confirmed
/// subscription, with its original parameters.
///
/// A subscription the server refuses to reconfirm is evicted and reported
/// via `ClientEvent::SubscriptionLost`. If the transport drops again while
/// replaying, the remaining entries keep their confirmed flag so the next
/// recovery cycle picks them up.
pub(crate) async fn replay_subscriptions(inner: &Arc<ConnectionInner>) {
    let tickets = inner.registry.confirmed_tickets();
    if tickets.is_empty() {
        return;
    }
    info!(count = tickets.len(), "replaying subscriptions after reconnect");

    for ticket in tickets {
        inner.registry.set_confirmed(&ticket.id, false);

        match inner
            .send_request(&subscribe_kind(&ticket.resource), ticket.params.clone())
            .await
        {
            Ok(resp) if resp.is_ok() && resp.topic == ticket.topic => {
                if inner.registry.set_confirmed(&ticket.id, true) {
                    inner.stats.write().await.subscriptions_replayed += 1;
                    debug!(id = %ticket.id, topic = %ticket.topic, "subscription reconfirmed");
                    inner.emit(ClientEvent::Resubscribed {
                        id: ticket.id.clone(),
                        topic: ticket.topic.clone(),
                    });
                }
                // Entry vanished: unsubscribed while the replay was in
                // flight; the late confirmation is discarded.
            }
            Ok(resp) => {
                let reason = if resp.is_ok() {
                    format!("topic mismatch: server confirmed '{}'", resp.topic)
                } else {
                    format!("rejected: {}", resp.message)
                };
                evict(inner, &ticket, reason);
            }
            Err(ClientError::ConnectionClosed) => {
                warn!(
                    id = %ticket.id,
                    "transport lost during replay, deferring to next recovery cycle"
                );
                inner.registry.set_confirmed(&ticket.id, true);
                return;
            }
            Err(e) => evict(inner, &ticket, e.to_string()),
        }
    }
}

fn evict(inner: &Arc<ConnectionInner>, ticket: &ReplayTicket, reason: String) {
    inner.registry.remove(&ticket.id);
    warn!(
        id = %ticket.id,
        topic = %ticket.topic,
        %reason,
        "evicting subscription that failed to reconfirm"
    );
    inner.emit(ClientEvent::SubscriptionLost {
        id: ticket.id.clone(),
        topic: ticket.topic.clone(),
        reason,
    });
}
