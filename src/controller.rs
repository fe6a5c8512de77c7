//! # Chat Controller
//!
//! Application layer between the two core components and the state store.
//!
//! ## Wiring:
//! - Server messages are registered as channel handlers and folded into the store
//! - `audioBase64` payloads (`welcome`, `audio_data`) go to the playback analyzer on a
//!   spawned task; mouth states flow back into the store every frame
//! - Playback events (`Started`, `Finished`, ...) drive the speaking flag and mouth reset
//! - Connection state changes are forwarded from the channel's watch channel
//!
//! ## Operations:
//! - `start`: restore the session id, connect, ask for the welcome message
//! - `send_user_message`: validate through the store, log and send the text
//! - `request_history`: ask the server for this session's history
//! - `stop_speaking`: interrupt the server reply and the local playback
//! - `shutdown`: stop playback and close the channel for good

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audio::PlaybackAnalyzer;
use crate::channel::{ChannelManager, ConnectionState, Message};
use crate::error::{AnalyzerError, ChannelResult};
use crate::protocol::{parse_history, ClientMessage, ServerMessage};
use crate::state::{ChatStore, Role, StoreEvent};

/// Shared handle to the application state.
pub type SharedStore = Arc<RwLock<ChatStore>>;

fn read(store: &SharedStore) -> RwLockReadGuard<'_, ChatStore> {
    store.read().unwrap_or_else(|e| e.into_inner())
}

fn write(store: &SharedStore) -> RwLockWriteGuard<'_, ChatStore> {
    store.write().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct ChatController {
    channel: ChannelManager,
    analyzer: PlaybackAnalyzer,
    store: SharedStore,
    runtime: Handle,
    address: String,
}

/// Server message side of the controller. Holds no channel handle, so handlers
/// registered on the channel do not keep it alive.
#[derive(Clone)]
struct Inbound {
    analyzer: PlaybackAnalyzer,
    store: SharedStore,
    runtime: Handle,
}

impl ChatController {
    /// Build the controller and register the server message handlers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        channel: ChannelManager,
        analyzer: PlaybackAnalyzer,
        store: SharedStore,
        address: impl Into<String>,
    ) -> Self {
        let controller = Self {
            channel,
            analyzer,
            store,
            runtime: Handle::current(),
            address: address.into(),
        };

        let inbound = Inbound {
            analyzer: controller.analyzer.clone(),
            store: controller.store.clone(),
            runtime: controller.runtime.clone(),
        };
        for kind in ServerMessage::TYPES {
            let inbound = inbound.clone();
            controller.channel.on(kind, move |message| inbound.handle(message));
        }

        controller.spawn_playback_forwarder();
        controller
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn channel(&self) -> &ChannelManager {
        &self.channel
    }

    pub fn analyzer(&self) -> &PlaybackAnalyzer {
        &self.analyzer
    }

    /// Connect and request the welcome message for the stored (or a new) session.
    pub async fn start(&self) -> ChannelResult<()> {
        if let Err(e) = write(&self.store).load_session_id() {
            warn!("Could not restore session id: {}", e);
        }

        self.spawn_state_forwarder();
        self.channel.connect(&self.address).await?;

        let session_id = read(&self.store).session_id().to_string();
        info!("Connected to {} (session: {:?})", self.address, session_id);
        self.channel.send(&ClientMessage::GetWelcome { session_id });
        Ok(())
    }

    /// Send `text` as a user message. Returns `false` when the store refuses it.
    pub fn send_user_message(&self, text: &str) -> bool {
        let message = {
            let mut store = write(&self.store);
            store.set_input_text(text);
            if !store.can_send() {
                debug!("Input rejected ({} chars, sending: {})", store.char_count(), store.is_sending());
                return false;
            }
            if self.channel.state() != ConnectionState::Open {
                warn!("Not connected, message not sent");
                return false;
            }

            let content = text.trim().to_string();
            store.add_message(Role::User, content.clone());
            store.set_sending(true);
            store.clear_input();
            ClientMessage::UserMessage {
                session_id: store.session_id().to_string(),
                content,
            }
        };

        self.channel.send(&message);
        true
    }

    pub fn request_history(&self) {
        let session_id = {
            let mut store = write(&self.store);
            store.toggle_history();
            store.session_id().to_string()
        };
        self.channel.send(&ClientMessage::GetHistory { session_id });
    }

    /// Interrupt the reply in progress on both ends.
    pub fn stop_speaking(&self) {
        self.channel.send(&ClientMessage::Stop);
        self.analyzer.stop();

        let mut store = write(&self.store);
        store.set_sending(false);
        store.set_speaking(false);
        store.reset_mouth();
    }

    pub fn shutdown(&self) {
        info!("Shutting down chat controller");
        self.analyzer.stop();
        self.channel.close();
    }

    /// Speaking flag and mouth reset follow the analyzer's events, so a clip that
    /// replaces another never sees the old clip's ending.
    fn spawn_playback_forwarder(&self) {
        let mut events = self.analyzer.subscribe();
        let store = self.store.clone();

        self.runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => write(&store).apply(StoreEvent::Playback(event)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} playback events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_state_forwarder(&self) {
        let mut changes = self.channel.state_changes();
        let store = self.store.clone();

        self.runtime.spawn(async move {
            loop {
                let state = *changes.borrow_and_update();
                write(&store).apply(StoreEvent::Connection(state));
                if changes.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}

impl Inbound {
    fn handle(&self, message: Message) {
        let parsed = match message.decode::<ServerMessage>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed '{}' message: {}", message.kind, e);
                return;
            }
        };

        match parsed {
            ServerMessage::Welcome {
                session_id,
                content,
                audio_base64,
                ..
            } => {
                {
                    let mut store = write(&self.store);
                    if !session_id.is_empty() && session_id != store.session_id() {
                        if let Err(e) = store.set_session_id(session_id) {
                            error!("Failed to persist session id: {}", e);
                        }
                    }
                    if !content.is_empty() {
                        store.add_message(Role::Assistant, content);
                    }
                }
                self.speak(audio_base64);
            }
            ServerMessage::AiTextChunk { content } => {
                write(&self.store).append_assistant_chunk(&content);
            }
            ServerMessage::AiTextComplete { full_text } => {
                let mut store = write(&self.store);
                store.complete_assistant(&full_text);
                store.set_sending(false);
            }
            ServerMessage::AudioData { audio_base64, duration } => {
                debug!("Received {} ms of reply audio", duration);
                self.speak(audio_base64);
            }
            ServerMessage::HistoryData { content } => match parse_history(&content) {
                Ok(records) => {
                    info!("Loaded {} history records", records.len());
                    write(&self.store).set_history(records);
                }
                Err(e) => warn!("Malformed history payload: {}", e),
            },
            ServerMessage::Error { error_code, error_msg } => {
                warn!("Server error {}: {}", error_code, error_msg);
                let mut store = write(&self.store);
                store.add_message(Role::System, format!("[{}] {}", error_code, error_msg));
                store.set_sending(false);
            }
            ServerMessage::StopAck => debug!("Server acknowledged stop"),
            ServerMessage::HeartbeatAck => {}
        }
    }

    /// Play an audio payload, mirroring mouth states into the store.
    fn speak(&self, audio_base64: String) {
        if audio_base64.is_empty() {
            return;
        }

        let analyzer = self.analyzer.clone();
        let store = self.store.clone();

        self.runtime.spawn(async move {
            if let Err(e) = analyzer.init(&audio_base64) {
                warn!("Could not prepare reply audio: {}", e);
                return;
            }

            let result = analyzer
                .play(move |state| write(&store).apply(StoreEvent::Mouth(state)))
                .await;

            match result {
                Ok(()) => debug!("Reply audio finished"),
                Err(AnalyzerError::Interrupted) => debug!("Reply audio interrupted"),
                Err(e) => warn!("Reply audio failed: {}", e),
            }
        });
    }
}
