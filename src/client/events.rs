//! Connection lifecycle state and out-of-band client events

/// Lifecycle state of one endpoint connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; nothing in progress
    Disconnected,
    /// A caller-initiated dial is in progress
    Connecting,
    /// Transport is open and frames are flowing
    Connected,
    /// Transport was lost; the reconnect loop is driving recovery
    Reconnecting { attempt: u32 },
}

/// Background notifications broadcast to every holder of a connection.
///
/// Errors from caller-initiated operations come back on the call itself;
/// everything that happens behind the caller's back surfaces here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Transport established (first connect or a successful reconnect)
    Connected,
    /// A reconnect attempt is scheduled
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// A subscription was replayed and reconfirmed after reconnect
    Resubscribed { id: String, topic: String },
    /// A subscription could not be reconfirmed and was evicted
    SubscriptionLost {
        id: String,
        topic: String,
        reason: String,
    },
    /// All reconnect attempts failed; the connection stays down until an
    /// explicit connect
    ReconnectsExhausted { attempts: u32 },
    /// Transport closed for good (user close or exhausted reconnects)
    Disconnected,
}
