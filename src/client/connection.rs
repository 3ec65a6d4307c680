//! Per-URL connection ownership, reference counting, and the session task

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::config::ClientConfig;
use crate::client::correlator::RequestCorrelator;
use crate::client::error::ClientError;
use crate::client::events::{ClientEvent, ConnectionState};
use crate::client::reconnect::{backoff_schedule, reconnect_loop};
use crate::client::registry::{Subscription, SubscriptionRegistry};
use crate::client::router::{MessageRouter, Routed};
use crate::ws::frame::{subscribe_kind, unsubscribe_kind, ResponsePayload};
use crate::ws::transport::{Connector, TransportEvent, TransportPair, WsConnector};

/// Counters for one connection, carried across reconnects
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub frames_received: u64,
    pub updates_delivered: u64,
    pub requests_timed_out: u64,
    pub reconnect_attempts: u64,
    pub subscriptions_replayed: u64,
    pub last_activity: Option<std::time::Instant>,
}

enum SessionCommand {
    Send(String),
    Close,
}

/// Shared state behind every handle to one endpoint connection
pub(crate) struct ConnectionInner {
    pub(crate) config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: RwLock<ConnectionState>,
    pub(crate) correlator: RequestCorrelator,
    pub(crate) registry: SubscriptionRegistry,
    /// Outbound channel of the current session; replaced on every (re)connect
    outbound: std::sync::Mutex<Option<mpsc::UnboundedSender<SessionCommand>>>,
    events: broadcast::Sender<ClientEvent>,
    refcount: AtomicUsize,
    /// Serializes dial attempts so concurrent connects cannot race
    connect_lock: Mutex<()>,
    /// Bumped per installed session; a superseded session stands down
    epoch: AtomicU64,
    /// Set on release teardown; stops the reconnect loop for good
    closed: AtomicBool,
    pub(crate) stats: RwLock<ConnectionStats>,
}

impl ConnectionInner {
    fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(16));
        Arc::new(Self {
            config,
            connector,
            state: RwLock::new(ConnectionState::Disconnected),
            correlator: RequestCorrelator::new(),
            registry: SubscriptionRegistry::new(),
            outbound: std::sync::Mutex::new(None),
            events,
            refcount: AtomicUsize::new(1),
            connect_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stats: RwLock::new(ConnectionStats::default()),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub(crate) async fn set_state(&self, next: ConnectionState) {
        *self.state.write().await = next;
    }

    async fn transition_if(&self, from: ConnectionState, to: ConnectionState) {
        let mut state = self.state.write().await;
        if *state == from {
            *state = to;
        }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn send_raw(&self, text: String) -> Result<(), ClientError> {
        match self.outbound.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx
                    .send(SessionCommand::Send(text))
                    .map_err(|_| ClientError::ConnectionClosed),
                None => Err(ClientError::ConnectionClosed),
            },
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    fn close_session(&self) {
        if let Ok(mut guard) = self.outbound.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(SessionCommand::Close);
            }
        }
    }

    fn install_session(&self) -> (mpsc::UnboundedReceiver<SessionCommand>, u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut guard) = self.outbound.lock() {
            *guard = Some(tx);
        }
        (rx, epoch)
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Dial the endpoint and hand the transport to a fresh session task.
    ///
    /// Idempotent under the connect lock; state is re-validated after
    /// acquiring it so two racing connects produce one transport.
    pub(crate) async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        let _guard = self.connect_lock.lock().await;
        if *self.state.read().await == ConnectionState::Connected {
            return Ok(());
        }

        let pair = self.connector.connect(&self.config.url).await?;
        let (cmd_rx, epoch) = self.install_session();
        self.set_state(ConnectionState::Connected).await;

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            run_session(inner, pair, cmd_rx, epoch).await;
        });

        self.emit(ClientEvent::Connected);
        info!(url = %self.config.url, "connection established");
        Ok(())
    }

    /// One correlated request over the live session
    pub(crate) async fn send_request(
        &self,
        kind: &str,
        payload: Value,
    ) -> Result<ResponsePayload, ClientError> {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let result = self
            .correlator
            .send_request(|text| self.send_raw(text), kind, payload, timeout)
            .await;
        if matches!(result, Err(ClientError::RequestTimeout(_))) {
            self.stats.write().await.requests_timed_out += 1;
        }
        result
    }

    /// Take another reference; fails when the count already hit zero
    fn retain(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    /// Last-holder teardown: clear the registry, fail pending requests,
    /// close the transport.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.registry.clear();
        self.correlator.fail_all();
        self.close_session();
    }
}

/// Owns at most one live connection per endpoint URL.
///
/// An explicit factory passed by reference wherever connections are needed;
/// the transport is injected so tests can run against an in-memory one.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connections: Arc<DashMap<String, Arc<ConnectionInner>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Production manager dialing real WebSocket endpoints
    pub fn websocket() -> Self {
        Self::new(Arc::new(WsConnector))
    }

    /// Get-or-create the connection for `config.url` and take a reference
    /// on it. Holders sharing one URL share one transport; the config of
    /// the first acquire wins for as long as the connection lives.
    pub fn acquire(&self, config: ClientConfig) -> ConnectionHandle {
        use dashmap::mapref::entry::Entry;

        match self.connections.entry(config.url.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().retain() {
                    ConnectionHandle {
                        inner: Arc::clone(occupied.get()),
                        connections: Arc::clone(&self.connections),
                    }
                } else {
                    // The last holder is mid-teardown; start fresh
                    let inner = ConnectionInner::new(config, Arc::clone(&self.connector));
                    occupied.insert(Arc::clone(&inner));
                    ConnectionHandle {
                        inner,
                        connections: Arc::clone(&self.connections),
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let inner = ConnectionInner::new(config, Arc::clone(&self.connector));
                vacant.insert(Arc::clone(&inner));
                ConnectionHandle {
                    inner,
                    connections: Arc::clone(&self.connections),
                }
            }
        }
    }

    /// Number of live per-URL connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// One holder's reference to a shared per-URL connection.
///
/// Dropping the handle releases the reference; the last release clears the
/// registry, fails pending requests, and closes the transport.
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
    connections: Arc<DashMap<String, Arc<ConnectionInner>>>,
}

impl ConnectionHandle {
    /// Open the transport if it is not already open. Idempotent.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected().await {
            return Ok(());
        }
        self.inner
            .transition_if(ConnectionState::Disconnected, ConnectionState::Connecting)
            .await;
        match self.inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner
                    .transition_if(ConnectionState::Connecting, ConnectionState::Disconnected)
                    .await;
                Err(e)
            }
        }
    }

    /// Sequential dial attempts with exponentially growing delays between
    /// them; delay(n) = base·2^(n-1) after failed attempt n. Fails with an
    /// aggregated error once the attempt budget is spent.
    pub async fn connect_with_retries(
        &self,
        max_attempts: u32,
        base_delay_ms: u64,
    ) -> Result<(), ClientError> {
        let attempts = max_attempts.max(1);
        let mut schedule = backoff_schedule(base_delay_ms, self.inner.config.max_reconnect_delay_ms);
        let mut last_error: Option<ClientError> = None;

        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, url = %self.inner.config.url, "connect attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                let delay = schedule
                    .next_backoff()
                    .unwrap_or(Duration::from_millis(base_delay_ms));
                tokio::time::sleep(delay).await;
            }
        }

        Err(ClientError::ConnectionFailed {
            attempts,
            source: Box::new(last_error.unwrap_or(ClientError::ConnectionClosed)),
        })
    }

    pub async fn is_connected(&self) -> bool {
        *self.inner.state.read().await == ConnectionState::Connected
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state().await
    }

    /// Receiver for background notifications on this connection
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.inner.stats.read().await.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Subscribe to one topic of a resource feed.
    ///
    /// Connects first if needed, performs the confirmation handshake, and
    /// returns the confirmed subscription with its update stream. On every
    /// failure path the registry entry is rolled back before the error is
    /// returned.
    pub async fn subscribe(
        &self,
        resource: &str,
        params: Value,
        topic: &str,
    ) -> Result<Subscription, ClientError> {
        if !self.is_connected().await {
            self.connect_with_retries(
                self.inner.config.max_reconnect_attempts,
                self.inner.config.reconnect_delay_ms,
            )
            .await?;
        }

        let (id, updates) = self
            .inner
            .registry
            .insert_unconfirmed(topic, resource, params.clone());
        debug!(%id, topic, resource, "subscribing");

        let response = match self
            .inner
            .send_request(&subscribe_kind(resource), params)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.inner.registry.remove(&id);
                return Err(e);
            }
        };

        if response.topic != topic {
            self.inner.registry.remove(&id);
            return Err(ClientError::TopicMismatch {
                expected: topic.to_string(),
                actual: response.topic,
            });
        }
        if !response.is_ok() {
            self.inner.registry.remove(&id);
            return Err(ClientError::SubscriptionRejected(response.message));
        }

        // The entry may be gone already if the caller unsubscribed while the
        // handshake was in flight; the late confirmation is discarded.
        self.inner.registry.set_confirmed(&id, true);
        info!(%id, topic, "subscription confirmed");
        Ok(Subscription { id, updates })
    }

    /// Remove a subscription. Unknown ids are a no-op, repeat calls are
    /// harmless, and the server's answer is advisory: the registry entry is
    /// gone either way, so nothing leaks without an acknowledgment.
    pub async fn unsubscribe(&self, id: &str, payload: Value) {
        let Some(ticket) = self.inner.registry.remove(id) else {
            debug!(%id, "unsubscribe for unknown id ignored");
            return;
        };
        debug!(%id, topic = %ticket.topic, "unsubscribed locally, notifying server");

        match self
            .inner
            .send_request(&unsubscribe_kind(&ticket.resource), payload)
            .await
        {
            Ok(response) if response.is_ok() => {}
            Ok(response) => warn!(
                %id,
                message = %response.message,
                "server declined unsubscribe, entry removed anyway"
            ),
            Err(e) => warn!(%id, error = %e, "unsubscribe request failed, entry removed anyway"),
        }
    }

    /// Politely close the transport. Refused (a no-op) while any
    /// subscription is registered, so one holder cannot cut the feed out
    /// from under another.
    pub async fn disconnect(&self) {
        let active = self.inner.registry.len();
        if active > 0 {
            debug!(active, "disconnect ignored, subscriptions still registered");
            return;
        }
        self.inner.close_session();
        self.inner.set_state(ConnectionState::Disconnected).await;
    }

    /// Release this reference. Sugar for dropping the handle.
    pub fn release(self) {}
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.inner.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!(url = %self.inner.config.url, "last holder released, tearing down connection");
            self.inner.shutdown();
            self.connections
                .remove_if(&self.inner.config.url, |_, v| Arc::ptr_eq(v, &self.inner));
        }
    }
}

/// Single consumer of one established transport.
///
/// Every inbound frame passes through here exactly once: pending requests
/// first, then update fan-out. Outbound frames drain from the session
/// command channel in call order. On transport loss the task itself becomes
/// the reconnect driver.
async fn run_session(
    inner: Arc<ConnectionInner>,
    pair: TransportPair,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    epoch: u64,
) {
    let TransportPair {
        mut sink,
        mut stream,
    } = pair;
    let router = MessageRouter::new(inner.config.log_frames);

    let heartbeat_enabled = inner.config.heartbeat_interval_secs > 0;
    let heartbeat_period = Duration::from_secs(inner.config.heartbeat_interval_secs.max(1));
    let mut heartbeat = interval(heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let pong_timeout = heartbeat_period * 2;
    let mut last_pong = Instant::now();

    // None: user-initiated close. Some(reason): transport loss.
    let loss: Option<String> = loop {
        tokio::select! {
            event = stream.recv() => match event {
                Ok(TransportEvent::Frame(text)) => {
                    {
                        let mut stats = inner.stats.write().await;
                        stats.frames_received += 1;
                        stats.last_activity = Some(std::time::Instant::now());
                    }
                    if let Routed::Update { delivered } =
                        router.route(&inner.correlator, &inner.registry, &text)
                    {
                        if delivered > 0 {
                            inner.stats.write().await.updates_delivered += delivered as u64;
                        }
                    }
                }
                Ok(TransportEvent::Pong) => {
                    last_pong = Instant::now();
                }
                Ok(TransportEvent::Closed) => break Some("closed by server".to_string()),
                Err(e) => break Some(e.to_string()),
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Send(text)) => {
                    if inner.config.log_frames {
                        debug!(frame = %text, "outbound frame");
                    }
                    if let Err(e) = sink.send(text).await {
                        break Some(e.to_string());
                    }
                }
                Some(SessionCommand::Close) | None => {
                    sink.close().await;
                    break None;
                }
            },
            _ = heartbeat.tick(), if heartbeat_enabled => {
                if last_pong.elapsed() > pong_timeout {
                    break Some("heartbeat timeout, no pong received".to_string());
                }
                if let Err(e) = sink.ping().await {
                    break Some(e.to_string());
                }
            }
        }
    };

    // A newer session may already be running; only the latest one owns the
    // connection state and recovery.
    if inner.current_epoch() != epoch {
        return;
    }

    match loss {
        None => {
            debug!(url = %inner.config.url, "session closed");
            inner.correlator.fail_all();
            inner.set_state(ConnectionState::Disconnected).await;
            inner.emit(ClientEvent::Disconnected);
        }
        Some(reason) => {
            warn!(url = %inner.config.url, %reason, "transport lost");
            inner.correlator.fail_all();
            if inner.config.reconnect && !inner.is_closed() {
                reconnect_loop(inner).await;
            } else {
                inner.set_state(ConnectionState::Disconnected).await;
                inner.emit(ClientEvent::Disconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testsupport::{
        ok_response_for, response_for, update_frame, MockConnector, MockLink,
    };
    use crate::ws::frame::WireFrame;
    use serde_json::json;

    fn test_config(url: &str) -> ClientConfig {
        let mut config = ClientConfig::new(url);
        config.heartbeat_interval_secs = 0;
        config.reconnect_delay_ms = 10;
        config.max_reconnect_delay_ms = 100;
        config.request_timeout_ms = 500;
        config
    }

    async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Answer the next request on the link with an ok response for `topic`,
    /// handing the link back for further scripting.
    async fn confirm_next(mut link: MockLink, topic: &str) -> MockLink {
        let request = link.outbound.recv().await.unwrap();
        link.inbound
            .send(Ok(TransportEvent::Frame(ok_response_for(&request, topic))))
            .unwrap();
        link
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));

        handle.connect().await.unwrap();
        handle.connect().await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(handle.is_connected().await);
        let _link = links.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_retries_eventually_succeeds() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));

        connector.fail_next(2);
        handle.connect_with_retries(5, 10).await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert!(handle.is_connected().await);
        let _link = links.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_retries_fails_with_aggregated_error() {
        let (connector, _links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));

        connector.fail_next(10);
        let result = handle.connect_with_retries(3, 10).await;

        match result {
            Err(ClientError::ConnectionFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn test_subscribe_confirms_and_routes_updates() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));
        handle.connect().await.unwrap();
        let link = links.recv().await.unwrap();

        let server = tokio::spawn(confirm_next(link, "bars:AAPL:1"));
        let mut sub = handle
            .subscribe(
                "bars",
                json!({"symbol": "AAPL", "resolution": "1"}),
                "bars:AAPL:1",
            )
            .await
            .unwrap();
        let link = server.await.unwrap();
        assert_eq!(handle.subscription_count(), 1);

        let payload =
            json!({"time": 1, "open": 1, "high": 2, "low": 0.5, "close": 1.5, "volume": 100});
        link.inbound
            .send(Ok(TransportEvent::Frame(update_frame(
                "bars.update",
                payload.clone(),
            ))))
            .unwrap();
        // Updates of another kind never reach this subscription
        link.inbound
            .send(Ok(TransportEvent::Frame(update_frame(
                "quotes.update",
                json!({"bid": 1}),
            ))))
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(2), sub.updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update, payload);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_updates_before_confirmation() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));
        handle.connect().await.unwrap();
        let mut link = links.recv().await.unwrap();

        let server = tokio::spawn(async move {
            let request = link.outbound.recv().await.unwrap();
            // An update racing ahead of the confirmation must not leak out
            link.inbound
                .send(Ok(TransportEvent::Frame(update_frame(
                    "bars.update",
                    json!({"close": 0.5}),
                ))))
                .unwrap();
            link.inbound
                .send(Ok(TransportEvent::Frame(ok_response_for(
                    &request,
                    "bars:AAPL:1",
                ))))
                .unwrap();
            link
        });

        let mut sub = handle
            .subscribe("bars", json!({"symbol": "AAPL"}), "bars:AAPL:1")
            .await
            .unwrap();
        let link = server.await.unwrap();

        link.inbound
            .send(Ok(TransportEvent::Frame(update_frame(
                "bars.update",
                json!({"close": 1.5}),
            ))))
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), sub.updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["close"], 1.5);
    }

    #[tokio::test]
    async fn test_subscribe_topic_mismatch_rolls_back() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));
        handle.connect().await.unwrap();
        let mut link = links.recv().await.unwrap();

        let server = tokio::spawn(async move {
            let request = link.outbound.recv().await.unwrap();
            link.inbound
                .send(Ok(TransportEvent::Frame(ok_response_for(
                    &request,
                    "bars:GOOGL:1",
                ))))
                .unwrap();
            link
        });

        let result = handle
            .subscribe("bars", json!({"symbol": "AAPL"}), "bars:AAPL:1")
            .await;
        let _link = server.await.unwrap();

        match result {
            Err(ClientError::TopicMismatch { expected, actual }) => {
                assert_eq!(expected, "bars:AAPL:1");
                assert_eq!(actual, "bars:GOOGL:1");
            }
            other => panic!("expected TopicMismatch, got {other:?}"),
        }
        assert_eq!(handle.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_rejection_rolls_back() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));
        handle.connect().await.unwrap();
        let mut link = links.recv().await.unwrap();

        let server = tokio::spawn(async move {
            let request = link.outbound.recv().await.unwrap();
            link.inbound
                .send(Ok(TransportEvent::Frame(response_for(
                    &request,
                    "error",
                    "not entitled",
                    "bars:AAPL:1",
                ))))
                .unwrap();
            link
        });

        let result = handle
            .subscribe("bars", json!({"symbol": "AAPL"}), "bars:AAPL:1")
            .await;
        let _link = server.await.unwrap();

        match result {
            Err(ClientError::SubscriptionRejected(message)) => {
                assert_eq!(message, "not entitled")
            }
            other => panic!("expected SubscriptionRejected, got {other:?}"),
        }
        assert_eq!(handle.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_timeout_rolls_back() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let mut config = test_config("mock://feed");
        config.request_timeout_ms = 100;
        let handle = manager.acquire(config);
        handle.connect().await.unwrap();
        let _link = links.recv().await.unwrap();

        let result = handle
            .subscribe("bars", json!({"symbol": "AAPL"}), "bars:AAPL:1")
            .await;

        assert!(matches!(result, Err(ClientError::RequestTimeout(_))));
        assert_eq!(handle.subscription_count(), 0);
        assert_eq!(handle.stats().await.requests_timed_out, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_stops_routing() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));
        handle.connect().await.unwrap();
        let link = links.recv().await.unwrap();

        let server = tokio::spawn(confirm_next(link, "bars:AAPL:1"));
        let mut sub = handle
            .subscribe("bars", json!({"symbol": "AAPL"}), "bars:AAPL:1")
            .await
            .unwrap();
        let link = server.await.unwrap();

        // Server acknowledges the unsubscribe
        let server = tokio::spawn(confirm_next(link, "bars:AAPL:1"));
        handle.unsubscribe(&sub.id, json!({})).await;
        let link = server.await.unwrap();
        assert_eq!(handle.subscription_count(), 0);

        // Repeat calls and unknown ids are no-ops
        handle.unsubscribe(&sub.id, json!({})).await;
        handle.unsubscribe("no-such-id", json!({})).await;

        // Nothing is routed to the removed subscription
        link.inbound
            .send(Ok(TransportEvent::Frame(update_frame(
                "bars.update",
                json!({"close": 9.9}),
            ))))
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(2), sub.updates.recv())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_disconnect_refused_while_subscribed() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));
        handle.connect().await.unwrap();
        let link = links.recv().await.unwrap();

        let server = tokio::spawn(confirm_next(link, "bars:AAPL:1"));
        let sub = handle
            .subscribe("bars", json!({"symbol": "AAPL"}), "bars:AAPL:1")
            .await
            .unwrap();
        let link = server.await.unwrap();

        handle.disconnect().await;
        assert!(handle.is_connected().await);

        let server = tokio::spawn(confirm_next(link, "bars:AAPL:1"));
        handle.unsubscribe(&sub.id, json!({})).await;
        let _link = server.await.unwrap();

        handle.disconnect().await;
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn test_one_connection_per_url_with_reference_counting() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());

        let first = manager.acquire(test_config("mock://feed"));
        let second = manager.acquire(test_config("mock://feed"));
        assert_eq!(manager.connection_count(), 1);

        second.connect().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(first.is_connected().await);
        let _link = links.recv().await.unwrap();

        drop(first);
        assert_eq!(manager.connection_count(), 1);
        assert!(second.is_connected().await);

        second.release();
        assert_eq!(manager.connection_count(), 0);

        let other = manager.acquire(test_config("mock://other"));
        let fresh = manager.acquire(test_config("mock://feed"));
        assert_eq!(manager.connection_count(), 2);
        drop(other);
        drop(fresh);
    }

    #[tokio::test]
    async fn test_reconnect_replays_confirmed_subscriptions() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));
        handle.connect().await.unwrap();
        let link = links.recv().await.unwrap();

        let server = tokio::spawn(confirm_next(link, "bars:AAPL:1"));
        let params = json!({"symbol": "AAPL", "resolution": "1"});
        let mut sub = handle
            .subscribe("bars", params.clone(), "bars:AAPL:1")
            .await
            .unwrap();
        let link = server.await.unwrap();

        let mut events = handle.events();

        // Kill the transport; the client must recover on its own
        drop(link);
        let mut link = links.recv().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        // The replayed handshake carries the original request and params
        let request_text = link.outbound.recv().await.unwrap();
        let request = WireFrame::parse(&request_text).unwrap();
        assert_eq!(request.kind, "bars.subscribe");
        assert_eq!(request.payload.clone().unwrap(), params);
        link.inbound
            .send(Ok(TransportEvent::Frame(ok_response_for(
                &request_text,
                "bars:AAPL:1",
            ))))
            .unwrap();

        loop {
            match next_event(&mut events).await {
                ClientEvent::Resubscribed { id, topic } => {
                    assert_eq!(id, sub.id);
                    assert_eq!(topic, "bars:AAPL:1");
                    break;
                }
                ClientEvent::Reconnecting { .. } | ClientEvent::Connected => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }

        // Updates flow again without any caller action
        link.inbound
            .send(Ok(TransportEvent::Frame(update_frame(
                "bars.update",
                json!({"close": 2.0}),
            ))))
            .unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), sub.updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update["close"], 2.0);
    }

    #[tokio::test]
    async fn test_failed_reconfirm_evicts_and_reports() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let handle = manager.acquire(test_config("mock://feed"));
        handle.connect().await.unwrap();
        let link = links.recv().await.unwrap();

        let server = tokio::spawn(confirm_next(link, "bars:AAPL:1"));
        let mut sub = handle
            .subscribe("bars", json!({"symbol": "AAPL"}), "bars:AAPL:1")
            .await
            .unwrap();
        let link = server.await.unwrap();

        let mut events = handle.events();
        drop(link);

        let mut link = links.recv().await.unwrap();
        let request_text = link.outbound.recv().await.unwrap();
        link.inbound
            .send(Ok(TransportEvent::Frame(response_for(
                &request_text,
                "error",
                "session expired",
                "bars:AAPL:1",
            ))))
            .unwrap();

        loop {
            match next_event(&mut events).await {
                ClientEvent::SubscriptionLost { id, topic, reason } => {
                    assert_eq!(id, sub.id);
                    assert_eq!(topic, "bars:AAPL:1");
                    assert!(reason.contains("session expired"));
                    break;
                }
                ClientEvent::Reconnecting { .. } | ClientEvent::Connected => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert_eq!(handle.subscription_count(), 0);
        // The update stream ends instead of dangling confirmed-but-dead
        assert!(
            tokio::time::timeout(Duration::from_secs(2), sub.updates.recv())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_is_terminal_and_observable() {
        let (connector, mut links) = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        let mut config = test_config("mock://feed");
        config.max_reconnect_attempts = 2;
        let handle = manager.acquire(config);
        handle.connect().await.unwrap();
        let link = links.recv().await.unwrap();

        let server = tokio::spawn(confirm_next(link, "bars:AAPL:1"));
        let _sub = handle
            .subscribe("bars", json!({"symbol": "AAPL"}), "bars:AAPL:1")
            .await
            .unwrap();
        let link = server.await.unwrap();

        let mut events = handle.events();
        connector.fail_next(10);
        drop(link);

        let mut saw_lost = false;
        loop {
            match next_event(&mut events).await {
                ClientEvent::SubscriptionLost { .. } => saw_lost = true,
                ClientEvent::ReconnectsExhausted { attempts } => {
                    assert_eq!(attempts, 2);
                    break;
                }
                ClientEvent::Reconnecting { .. } => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_lost);

        assert_eq!(next_event(&mut events).await, ClientEvent::Disconnected);
        assert_eq!(handle.state().await, ConnectionState::Disconnected);
        assert_eq!(handle.subscription_count(), 0);
        // First connect plus two failed reconnect attempts
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }
}
