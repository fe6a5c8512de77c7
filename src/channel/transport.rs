//! # Transport Port
//!
//! The channel manager never touches a socket directly. It asks a [`Connector`] for a
//! [`Transport`] and receives lifecycle events through an [`EventSink`].
//!
//! ## Event order for one transport:
//! `Open`, then any number of `Message`, then `Closed`. `Error` may appear at any point
//! and is normally followed by `Closed`.
//!
//! ## Implementations:
//! - [`WsConnector`]: WebSocket client on `tokio-tungstenite`
//! - `ScriptedConnector` (tests only): events are pushed by the test body

use std::fmt;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::{ChannelError, ChannelResult};

/// Lifecycle event reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed,
}

/// Callback the transport uses to report events back to its owner.
#[derive(Clone)]
pub struct EventSink {
    emit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new(emit: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self { emit: Arc::new(emit) }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// An established (or establishing) connection.
pub trait Transport: Send + Sync {
    /// Queue one text frame for transmission.
    fn send_text(&self, text: String) -> ChannelResult<()>;

    /// Ask the transport to shut down. A `Closed` event follows once it has.
    fn close(&self);
}

/// Factory for transports.
pub trait Connector: Send + Sync {
    /// Start connecting to `address`.
    ///
    /// Returns `Setup` synchronously when the address cannot be turned into a
    /// connection request. Everything after that is reported through `events`.
    fn open(&self, address: &str, events: EventSink) -> ChannelResult<Arc<dyn Transport>>;
}

enum Outgoing {
    Text(String),
    Close,
}

/// WebSocket connector backed by `tokio-tungstenite`.
///
/// ## Task layout:
/// One spawned task per connection. It performs the handshake, then multiplexes the
/// outbound queue and the inbound stream with `tokio::select!`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    runtime: Handle,
}

impl WsConnector {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Connector bound to the current tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Connector for WsConnector {
    fn open(&self, address: &str, events: EventSink) -> ChannelResult<Arc<dyn Transport>> {
        let request = address
            .into_client_request()
            .map_err(|e| ChannelError::Setup(e.to_string()))?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let address = address.to_string();
        let task = self
            .runtime
            .spawn(run_connection(address, request, outgoing_rx, events));

        Ok(Arc::new(WsTransport {
            outgoing: outgoing_tx,
            task: task.abort_handle(),
        }))
    }
}

async fn run_connection(
    address: String,
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSink,
) {
    let stream = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            events.emit(TransportEvent::Error(e.to_string()));
            events.emit(TransportEvent::Closed);
            return;
        }
    };

    debug!("WebSocket handshake with {} complete", address);
    events.emit(TransportEvent::Open);

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            command = outgoing.recv() => match command {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        events.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    if let Err(e) = write.send(WsMessage::Close(None)).await {
                        debug!("Close frame not delivered: {}", e);
                    }
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => events.emit(TransportEvent::Message(text)),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => events.emit(TransportEvent::Message(text)),
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame from {}", address),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("Server closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    events.emit(TransportEvent::Closed);
}

struct WsTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    task: AbortHandle,
}

impl Transport for WsTransport {
    fn send_text(&self, text: String) -> ChannelResult<()> {
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| ChannelError::Transport("connection task has stopped".to_string()))
    }

    fn close(&self) {
        if self.outgoing.send(Outgoing::Close).is_err() {
            // Task already finished; make sure nothing is left behind.
            self.task.abort();
        }
    }
}
