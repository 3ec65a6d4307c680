//! Subscription identity and confirmation state

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::ws::frame::update_kind;

/// A live subscription as handed to the caller
#[derive(Debug)]
pub struct Subscription {
    /// Registry id, unique for the process lifetime
    pub id: String,
    /// Update payloads for this subscription, in arrival order
    pub updates: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Consume the subscription, yielding its id and updates as a `Stream`
    pub fn into_parts(self) -> (String, UnboundedReceiverStream<Value>) {
        (self.id, UnboundedReceiverStream::new(self.updates))
    }
}

/// Everything needed to replay one subscription after reconnect
#[derive(Debug, Clone)]
pub struct ReplayTicket {
    pub id: String,
    pub topic: String,
    pub resource: String,
    pub params: Value,
}

/// Registry-internal subscription record
struct SubscriptionEntry {
    /// Insertion order, used to replay oldest-first after reconnect
    seq: u64,
    topic: String,
    resource: String,
    /// Frame type whose payloads this subscription receives
    update_kind: String,
    /// Original parameters, kept verbatim for resubscription
    params: Value,
    confirmed: bool,
    sink: mpsc::UnboundedSender<Value>,
}

/// Tracks subscription identity, confirmation state, and the original
/// parameters needed to resubscribe after reconnect.
///
/// Entries are inserted unconfirmed, flip to confirmed when the server
/// acknowledges the handshake, and are removed on unsubscribe, on a failed
/// handshake, or on a failed replay. Updates are only ever delivered to
/// confirmed entries.
pub struct SubscriptionRegistry {
    entries: DashMap<String, SubscriptionEntry>,
    seq: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Insert a new unconfirmed entry and hand back its id and update stream
    pub fn insert_unconfirmed(
        &self,
        topic: &str,
        resource: &str,
        params: Value,
    ) -> (String, mpsc::UnboundedReceiver<Value>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id(topic, seq);
        let (sink, updates) = mpsc::unbounded_channel();
        self.entries.insert(
            id.clone(),
            SubscriptionEntry {
                seq,
                topic: topic.to_string(),
                resource: resource.to_string(),
                update_kind: update_kind(resource),
                params,
                confirmed: false,
                sink,
            },
        );
        (id, updates)
    }

    /// Flip the confirmed flag; returns false when the entry is already gone
    /// (unsubscribed while its handshake was in flight).
    pub fn set_confirmed(&self, id: &str, confirmed: bool) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.confirmed = confirmed;
                true
            }
            None => false,
        }
    }

    /// Remove an entry, returning its replay ticket when it existed
    pub fn remove(&self, id: &str) -> Option<ReplayTicket> {
        self.entries.remove(id).map(|(id, entry)| ReplayTicket {
            id,
            topic: entry.topic,
            resource: entry.resource,
            params: entry.params,
        })
    }

    /// Snapshot of every confirmed entry, oldest first, for replay
    pub fn confirmed_tickets(&self) -> Vec<ReplayTicket> {
        let mut tickets: Vec<(u64, ReplayTicket)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().confirmed)
            .map(|entry| {
                (
                    entry.value().seq,
                    ReplayTicket {
                        id: entry.key().clone(),
                        topic: entry.value().topic.clone(),
                        resource: entry.value().resource.clone(),
                        params: entry.value().params.clone(),
                    },
                )
            })
            .collect();
        tickets.sort_by_key(|(seq, _)| *seq);
        tickets.into_iter().map(|(_, t)| t).collect()
    }

    /// Fan an update payload out to every confirmed matching subscription.
    ///
    /// Returns the number of subscriptions the payload reached. A subscriber
    /// whose receiver is gone is logged and skipped; it cannot block the
    /// others.
    pub fn deliver(&self, kind: &str, payload: &Value) -> usize {
        let mut delivered = 0;
        for entry in self.entries.iter() {
            if !entry.value().confirmed || entry.value().update_kind != kind {
                continue;
            }
            match entry.value().sink.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(
                        id = %entry.key(),
                        topic = %entry.value().topic,
                        "dropping update for subscriber with closed receiver"
                    );
                }
            }
        }
        delivered
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry and hand back their tickets, oldest first.
    ///
    /// Used when reconnect attempts are exhausted so each lost subscription
    /// can be reported individually.
    pub fn drain_all(&self) -> Vec<ReplayTicket> {
        let mut drained: Vec<(u64, ReplayTicket)> = Vec::new();
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((id, entry)) = self.entries.remove(&key) {
                drained.push((
                    entry.seq,
                    ReplayTicket {
                        id,
                        topic: entry.topic,
                        resource: entry.resource,
                        params: entry.params,
                    },
                ));
            }
        }
        drained.sort_by_key(|(seq, _)| *seq);
        drained.into_iter().map(|(_, t)| t).collect()
    }

    /// Drop every entry. Update receivers observe the end of their stream.
    pub fn clear(&self) {
        let dropped = self.entries.len();
        self.entries.clear();
        if dropped > 0 {
            debug!(dropped, "cleared subscription registry");
        }
    }

    /// Ids embed topic, wall-clock millis, the insertion sequence, and a
    /// random suffix; the sequence keeps them unique even within one
    /// millisecond.
    fn next_id(&self, topic: &str, seq: u64) -> String {
        let suffix: u32 = rand::rng().random_range(0..0x1_0000);
        format!(
            "{topic}-{}-{seq}-{suffix:04x}",
            Utc::now().timestamp_millis()
        )
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
