//! # Channel Manager
//!
//! Owns exactly one transport at a time and keeps it alive:
//! - `connect` resolves once the transport reports `Open`
//! - inbound text is parsed and dispatched by its `type` field
//! - a `heartbeat` message goes out every interval while open
//! - an unmanaged close schedules up to N reconnects with a fixed delay
//!
//! ## State machine:
//! ```text
//! disconnected --connect--> connecting --open--> open
//! open --close event, retry budget left--> connecting (after the backoff delay)
//! connecting/open --budget spent | close()--> disconnected
//! open --close()--> closing --closed--> disconnected
//! ```
//!
//! ## Generations:
//! Each transport is tagged with a generation number. Replacing or retiring a transport
//! bumps the generation, and events carrying an older generation are ignored. This is
//! what keeps a late `Closed` from a discarded socket from triggering a reconnect.
//!
//! ## Locking:
//! The connection lock is never held while a message handler or a transport method
//! runs, so both may call back into the manager (`close()` from inside a handler, or a
//! transport that reports `Closed` synchronously from `close()`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::message::{encode_outbound, ConnectionState, Message, HEARTBEAT_TYPE};
use super::transport::{Connector, EventSink, Transport, TransportEvent};
use crate::clock::{Clock, TimerHandle};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ChannelResult};

/// Callback registered for one message type.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

type ConnectWaiter = oneshot::Sender<ChannelResult<()>>;

/// Who started the current connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    /// `connect()` from the application. Failures go back to the caller, no retry.
    Caller,
    /// Scheduled by the retry policy. Failures count against the retry budget.
    Reconnect,
}

struct Connection {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
    attempt: AttemptKind,
    address: Option<String>,
    reconnect_attempts: u32,
    manual_close: bool,
    heartbeat: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,
    waiter: Option<ConnectWaiter>,
}

impl Connection {
    fn stop_heartbeat(&mut self) {
        if let Some(timer) = self.heartbeat.take() {
            timer.cancel();
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
    }

    fn resolve_waiter(&mut self, result: ChannelResult<()>) {
        if let Some(waiter) = self.waiter.take() {
            // The caller may have stopped waiting; that is fine.
            let _ = waiter.send(result);
        }
    }

    /// Detach the current transport so late events from it are ignored.
    fn retire(&mut self) -> Option<Arc<dyn Transport>> {
        self.generation += 1;
        self.transport.take()
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    heartbeat_interval: Duration,
    connection: Mutex<Connection>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Reconnecting message channel. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ChannelManager {
    shared: Arc<Shared>,
}

impl ChannelManager {
    pub fn new(connector: Arc<dyn Connector>, clock: Arc<dyn Clock>, config: &ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                connector,
                clock,
                max_reconnect_attempts: config.max_reconnect_attempts,
                reconnect_delay: config.reconnect_delay(),
                heartbeat_interval: config.heartbeat_interval(),
                connection: Mutex::new(Connection {
                    state: ConnectionState::Disconnected,
                    transport: None,
                    generation: 0,
                    attempt: AttemptKind::Caller,
                    address: None,
                    reconnect_attempts: 0,
                    manual_close: false,
                    heartbeat: None,
                    reconnect_timer: None,
                    waiter: None,
                }),
                handlers: RwLock::new(HashMap::new()),
                state_tx,
            }),
        }
    }

    /// Connect to `address` and wait until the transport is open.
    ///
    /// ## Behavior:
    /// - Replaces any existing transport (its late events are ignored)
    /// - Clears an earlier `close()` so the retry policy applies again
    /// - Fails with `Setup` for an unusable address, `Transport` or
    ///   `ClosedBeforeOpen` when the attempt dies before opening, and `Cancelled`
    ///   when `close()` or another `connect()` supersedes it
    ///
    /// There is no internal timeout; wrap the call in `tokio::time::timeout` if needed.
    pub async fn connect(&self, address: &str) -> ChannelResult<()> {
        let opened = self.shared.begin_connect(address, AttemptKind::Caller)?;
        opened.await.unwrap_or(Err(ChannelError::Cancelled))
    }

    /// Send a message if the channel is open, stamped with the current time.
    ///
    /// Never fails: a closed channel or an unencodable message is logged and dropped.
    pub fn send<M: Serialize + ?Sized>(&self, message: &M) {
        self.shared.send(message)
    }

    /// Register the handler for `kind`, replacing any earlier one.
    pub fn on(&self, kind: impl Into<String>, handler: impl Fn(Message) + Send + Sync + 'static) {
        let mut handlers = self.shared.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(kind.into(), Arc::new(handler));
    }

    /// Close the connection and suppress automatic reconnects. Idempotent.
    pub fn close(&self) {
        self.shared.close()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    /// Watch channel that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, connection: &mut Connection, state: ConnectionState) {
        if connection.state != state {
            debug!("Channel state {} -> {}", connection.state, state);
            connection.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn begin_connect(
        self: &Arc<Self>,
        address: &str,
        kind: AttemptKind,
    ) -> ChannelResult<oneshot::Receiver<ChannelResult<()>>> {
        let (waiter, opened) = oneshot::channel();

        let (generation, previous) = {
            let mut connection = self.lock();

            match kind {
                AttemptKind::Caller => {
                    connection.manual_close = false;
                    connection.cancel_reconnect();
                }
                AttemptKind::Reconnect if connection.manual_close => {
                    return Err(ChannelError::Cancelled);
                }
                AttemptKind::Reconnect => {}
            }

            connection.stop_heartbeat();
            connection.resolve_waiter(Err(ChannelError::Cancelled));
            let previous = connection.retire();
            connection.attempt = kind;
            connection.address = Some(address.to_string());
            connection.waiter = Some(waiter);
            self.set_state(&mut connection, ConnectionState::Connecting);
            (connection.generation, previous)
        };

        if let Some(previous) = previous {
            previous.close();
        }

        match self.connector.open(address, self.event_sink(generation)) {
            Ok(transport) => {
                let mut connection = self.lock();
                if connection.generation == generation {
                    connection.transport = Some(transport);
                } else {
                    drop(connection);
                    transport.close();
                }
                Ok(opened)
            }
            Err(e) => {
                let mut connection = self.lock();
                if connection.generation == generation {
                    connection.waiter = None;
                    connection.generation += 1;
                    self.set_state(&mut connection, ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    fn event_sink(self: &Arc<Self>, generation: u64) -> EventSink {
        let weak = Arc::downgrade(self);
        EventSink::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_event(generation, event);
            }
        })
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        if let TransportEvent::Message(text) = event {
            self.dispatch(generation, &text);
            return;
        }

        let retired = {
            let mut connection = self.lock();
            if connection.generation != generation {
                debug!("Ignoring {:?} from a retired transport", event);
                return;
            }

            match event {
                TransportEvent::Open if connection.state == ConnectionState::Connecting => {
                    self.on_open(&mut connection, generation);
                    None
                }
                TransportEvent::Open => {
                    debug!("Ignoring open event in state {}", connection.state);
                    None
                }
                TransportEvent::Error(reason) => match connection.state {
                    ConnectionState::Connecting => {
                        Some(self.fail_attempt(&mut connection, ChannelError::Transport(reason)))
                    }
                    _ => {
                        warn!("WebSocket error: {}", reason);
                        Some(self.on_closed(&mut connection))
                    }
                },
                TransportEvent::Closed => match connection.state {
                    ConnectionState::Connecting => {
                        Some(self.fail_attempt(&mut connection, ChannelError::ClosedBeforeOpen))
                    }
                    _ => Some(self.on_closed(&mut connection)),
                },
                TransportEvent::Message(_) => None,
            }
        };

        if let Some(Some(transport)) = retired {
            transport.close();
        }
    }

    fn on_open(self: &Arc<Self>, connection: &mut Connection, generation: u64) {
        info!("WebSocket connection established");
        connection.reconnect_attempts = 0;
        connection.stop_heartbeat();
        connection.heartbeat = Some(self.start_heartbeat(generation));
        self.set_state(connection, ConnectionState::Open);
        connection.resolve_waiter(Ok(()));
    }

    /// The in-flight attempt died before opening.
    fn fail_attempt(self: &Arc<Self>, connection: &mut Connection, err: ChannelError) -> Option<Arc<dyn Transport>> {
        let retired = connection.retire();

        match connection.attempt {
            AttemptKind::Caller => {
                debug!("Connection attempt failed: {}", err);
                connection.resolve_waiter(Err(err));
                self.set_state(connection, ConnectionState::Disconnected);
            }
            AttemptKind::Reconnect => {
                error!("Reconnect attempt failed: {}", err);
                connection.resolve_waiter(Err(err));
                self.schedule_reconnect(connection);
            }
        }

        retired
    }

    /// An open (or closing) transport went away.
    fn on_closed(self: &Arc<Self>, connection: &mut Connection) -> Option<Arc<dyn Transport>> {
        info!("WebSocket connection closed");
        connection.stop_heartbeat();
        let retired = connection.retire();
        self.schedule_reconnect(connection);
        retired
    }

    fn schedule_reconnect(self: &Arc<Self>, connection: &mut Connection) {
        let address = match &connection.address {
            Some(address) if !connection.manual_close => address.clone(),
            _ => {
                self.set_state(connection, ConnectionState::Disconnected);
                return;
            }
        };

        if connection.reconnect_attempts >= self.max_reconnect_attempts {
            warn!(
                "Giving up after {} reconnect attempts",
                connection.reconnect_attempts
            );
            self.set_state(connection, ConnectionState::Disconnected);
            return;
        }

        connection.reconnect_attempts += 1;
        info!(
            "Reconnecting... ({}/{})",
            connection.reconnect_attempts, self.max_reconnect_attempts
        );
        self.set_state(connection, ConnectionState::Connecting);

        let weak = Arc::downgrade(self);
        let scheduled_generation = connection.generation;
        connection.cancel_reconnect();
        connection.reconnect_timer = Some(self.clock.schedule_after(
            self.reconnect_delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.fire_reconnect(&address, scheduled_generation);
                }
            }),
        ));
    }

    fn fire_reconnect(self: &Arc<Self>, address: &str, scheduled_generation: u64) {
        {
            let mut connection = self.lock();
            if connection.manual_close || connection.generation != scheduled_generation {
                return;
            }
            connection.reconnect_timer = None;
        }

        // Nobody awaits a reconnect; the receiver is dropped right away.
        if let Err(e) = self.begin_connect(address, AttemptKind::Reconnect) {
            error!("Reconnect to {} failed: {}", address, e);
        }
    }

    fn start_heartbeat(self: &Arc<Self>, generation: u64) -> TimerHandle {
        let weak: Weak<Shared> = Arc::downgrade(self);
        self.clock.schedule_repeating(
            self.heartbeat_interval,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    if shared.lock().generation == generation {
                        shared.send(&Message::new(HEARTBEAT_TYPE));
                    }
                }
            }),
        )
    }

    fn dispatch(&self, generation: u64, text: &str) {
        if self.lock().generation != generation {
            debug!("Dropping message from a retired transport");
            return;
        }

        let message: Message = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to parse WebSocket message: {}", e);
                return;
            }
        };

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.kind)
            .cloned();

        match handler {
            Some(handler) => handler(message),
            None => debug!("No handler for message type '{}'", message.kind),
        }
    }

    fn send<M: Serialize + ?Sized>(&self, message: &M) {
        let transport = {
            let connection = self.lock();
            match (&connection.transport, connection.state) {
                (Some(transport), ConnectionState::Open) => transport.clone(),
                _ => {
                    warn!("WebSocket is not connected (state: {}), dropping message", connection.state);
                    return;
                }
            }
        };

        let text = match encode_outbound(message, self.clock.now_millis()) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode outbound message: {}", e);
                return;
            }
        };

        if let Err(e) = transport.send_text(text) {
            warn!("Failed to send message: {}", e);
        }
    }

    fn close(&self) {
        let closing = {
            let mut connection = self.lock();
            connection.manual_close = true;
            connection.stop_heartbeat();
            connection.cancel_reconnect();
            connection.resolve_waiter(Err(ChannelError::Cancelled));

            match connection.transport.clone() {
                Some(transport) if connection.state != ConnectionState::Closing => {
                    self.set_state(&mut connection, ConnectionState::Closing);
                    Some(transport)
                }
                Some(_) => None,
                None => {
                    connection.generation += 1;
                    self.set_state(&mut connection, ConnectionState::Disconnected);
                    None
                }
            }
        };

        if let Some(transport) = closing {
            info!("Closing WebSocket connection");
            transport.close();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let connection = self.connection.get_mut().unwrap_or_else(|e| e.into_inner());
        connection.manual_close = true;
        connection.stop_heartbeat();
        connection.cancel_reconnect();
        if let Some(transport) = connection.transport.take() {
            transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transport::scripted::ScriptedConnector;
    use crate::clock::ManualClock;
    use futures_util::poll;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ADDRESS: &str = "ws://chat.test/ws";

    fn setup() -> (ChannelManager, Arc<ScriptedConnector>, Arc<ManualClock>) {
        let connector = Arc::new(ScriptedConnector::default());
        let clock = Arc::new(ManualClock::default());
        let manager = ChannelManager::new(connector.clone(), clock.clone(), &ChannelConfig::default());
        (manager, connector, clock)
    }

    async fn open_channel(manager: &ChannelManager, connector: &ScriptedConnector) {
        let connecting = manager.connect(ADDRESS);
        tokio::pin!(connecting);
        assert!(poll!(&mut connecting).is_pending());
        assert_eq!(manager.state(), ConnectionState::Connecting);

        connector.last().open();
        connecting.await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn test_connect_resolves_on_open() {
        let (manager, connector, _clock) = setup();
        open_channel(&manager, &connector).await;

        assert_eq!(connector.attempts(), 1);
        assert_eq!(connector.last().address, ADDRESS);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_is_returned_without_retry() {
        let (manager, connector, clock) = setup();

        let result = manager.connect("http:// not a socket").await;
        assert!(matches!(result, Err(ChannelError::Setup(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        clock.advance(secs(10));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_error_before_open_fails_connect_without_retry() {
        let (manager, connector, clock) = setup();

        let connecting = manager.connect(ADDRESS);
        tokio::pin!(connecting);
        assert!(poll!(&mut connecting).is_pending());

        connector.last().fail("connection refused");
        connector.last().drop_connection();

        let result = connecting.await;
        assert!(matches!(result, Err(ChannelError::Transport(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(clock.pending_timers(), 0);

        clock.advance(secs(10));
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_close_before_open_fails_connect() {
        let (manager, connector, _clock) = setup();

        let connecting = manager.connect(ADDRESS);
        tokio::pin!(connecting);
        assert!(poll!(&mut connecting).is_pending());

        connector.last().drop_connection();
        assert!(matches!(connecting.await, Err(ChannelError::ClosedBeforeOpen)));
    }

    #[tokio::test]
    async fn test_dispatch_by_type_and_handler_replacement() {
        let (manager, connector, _clock) = setup();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(Mutex::new(Vec::new()));

        let counter = first.clone();
        manager.on("ai_text_chunk", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let seen = second.clone();
        manager.on("ai_text_chunk", move |message: Message| {
            seen.lock().unwrap().push(message.get_str("content").unwrap().to_string());
        });

        open_channel(&manager, &connector).await;
        connector.last().receive(r#"{"type":"ai_text_chunk","content":"Hel"}"#);
        connector.last().receive(r#"{"type":"ai_text_chunk","content":"lo"}"#);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(*second.lock().unwrap(), vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_unhandled_and_malformed_messages_are_dropped() {
        let (manager, connector, _clock) = setup();
        open_channel(&manager, &connector).await;

        connector.last().receive(r#"{"type":"heartbeat"}"#);
        connector.last().receive("not json at all");
        connector.last().receive(r#"{"no_type":true}"#);

        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_send_stamps_timestamp() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;

        manager.send(&json!({"type": "user_message", "session_id": "s1", "content": "hi"}));

        let sent = connector.last().sent_json();
        assert_eq!(
            sent,
            vec![json!({
                "type": "user_message",
                "session_id": "s1",
                "content": "hi",
                "timestamp": clock.now_millis(),
            })]
        );
    }

    #[tokio::test]
    async fn test_send_while_not_open_is_dropped() {
        let (manager, connector, _clock) = setup();

        manager.send(&json!({"type": "stop"}));

        let connecting = manager.connect(ADDRESS);
        tokio::pin!(connecting);
        assert!(poll!(&mut connecting).is_pending());
        manager.send(&json!({"type": "stop"}));

        assert!(connector.last().sent().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_while_open() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;
        let transport = connector.last();

        clock.advance(Duration::from_millis(29_999));
        assert!(transport.sent().is_empty());

        clock.advance(Duration::from_millis(1));
        clock.advance(secs(60));

        let sent = transport.sent_json();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|m| m["type"] == "heartbeat" && m["timestamp"].is_i64()));
        assert_eq!(sent[0]["timestamp"], json!(1_700_000_000_000i64 + 30_000));
    }

    #[tokio::test]
    async fn test_heartbeat_stops_on_close() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;
        let transport = connector.last();

        transport.drop_connection();
        clock.advance(secs(120));

        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_budget_is_three_attempts() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;

        connector.last().drop_connection();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.reconnect_attempts(), 1);

        clock.advance(Duration::from_millis(1_999));
        assert_eq!(connector.attempts(), 1);
        clock.advance(Duration::from_millis(1));
        assert_eq!(connector.attempts(), 2);

        // Each retry dies before opening.
        for expected in 2..=3 {
            connector.last().drop_connection();
            assert_eq!(manager.reconnect_attempts(), expected);
            clock.advance(secs(2));
        }
        assert_eq!(connector.attempts(), 4);

        connector.last().drop_connection();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(clock.pending_timers(), 0);

        clock.advance(secs(60));
        assert_eq!(connector.attempts(), 4);
        assert!(connector.attempt(1).address == ADDRESS && connector.attempt(3).address == ADDRESS);
    }

    #[tokio::test]
    async fn test_successful_reconnect_resets_counter() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;

        connector.last().drop_connection();
        clock.advance(secs(2));
        connector.last().open();

        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_error_after_open_takes_close_path() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;
        let first = connector.last();

        first.fail("connection reset");
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(first.close_requested());

        clock.advance(secs(2));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_suppresses_reconnect() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;

        manager.close();
        assert!(connector.last().close_requested());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.close();
        clock.advance(secs(60));
        assert_eq!(connector.attempts(), 1);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_close_during_backoff_cancels_retry() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;

        connector.last().drop_connection();
        assert_eq!(clock.pending_timers(), 1);

        manager.close();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(clock.pending_timers(), 0);

        clock.advance(secs(60));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_connect() {
        let (manager, connector, _clock) = setup();

        let connecting = manager.connect(ADDRESS);
        tokio::pin!(connecting);
        assert!(poll!(&mut connecting).is_pending());

        manager.close();
        assert!(matches!(connecting.await, Err(ChannelError::Cancelled)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(connector.last().close_requested());
    }

    #[tokio::test]
    async fn test_close_from_inside_handler() {
        let (manager, connector, clock) = setup();
        let inner = manager.clone();
        manager.on("error", move |_| inner.close());

        open_channel(&manager, &connector).await;
        connector.last().receive(r#"{"type":"error","errorCode":500,"errorMsg":"boom"}"#);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        clock.advance(secs(10));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_fresh_connect_after_close_restores_retry_policy() {
        let (manager, connector, clock) = setup();
        open_channel(&manager, &connector).await;
        manager.close();

        open_channel(&manager, &connector).await;
        connector.last().drop_connection();
        clock.advance(secs(2));

        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn test_retired_transport_events_are_ignored() {
        let (manager, connector, clock) = setup();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        manager.on("ai_text_chunk", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        open_channel(&manager, &connector).await;
        let stale = connector.last();
        stale.drop_connection();
        clock.advance(secs(2));
        connector.last().open();

        stale.receive(r#"{"type":"ai_text_chunk","content":"late"}"#);
        stale.drop_connection();

        assert_eq!(received.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_state_changes_are_published() {
        let (manager, connector, _clock) = setup();
        let mut changes = manager.state_changes();

        open_channel(&manager, &connector).await;
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), ConnectionState::Open);

        manager.close();
        assert_eq!(*changes.borrow_and_update(), ConnectionState::Disconnected);
    }
}
