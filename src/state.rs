//! # Application State
//!
//! The chat client's state container: what the UI would render, plus the session id
//! that survives restarts.
//!
//! ## Ownership:
//! The core components never write here directly. They publish typed events
//! (connection state changes, playback events, mouth states) and the owner of the store
//! feeds them through [`ChatStore::apply`]. The controller keeps the store behind an
//! `Arc<RwLock<ChatStore>>` so the stdin loop and the channel handlers can share it.
//!
//! ## Derived fields:
//! - `char_count`: characters in the input box
//! - `can_send`: not sending, trimmed input non-empty, `char_count <= max_chars`
//! - `is_char_limit_warning`: `char_count > warn_chars`
//! - `has_messages`: the log is non-empty

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audio::{MouthState, PlaybackEvent};
use crate::channel::ConnectionState;
use crate::config::InputConfig;
use crate::error::StoreResult;
use crate::protocol::HistoryRecord;
use crate::storage::KeyValueStore;

/// Persistence key of the session id.
pub const SESSION_ID_KEY: &str = "ai_chat_session_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Assistant text still arriving in chunks.
    #[serde(default)]
    pub streaming: bool,
}

impl ChatEntry {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            streaming: false,
        }
    }
}

/// Events the store consumes from the core.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Connection(ConnectionState),
    Playback(PlaybackEvent),
    Mouth(MouthState),
}

pub struct ChatStore {
    persistence: Arc<dyn KeyValueStore>,
    limits: InputConfig,
    session_id: String,
    connection_state: ConnectionState,
    sending: bool,
    speaking: bool,
    mouth_state: MouthState,
    messages: Vec<ChatEntry>,
    history: Vec<HistoryRecord>,
    input_text: String,
    show_history: bool,
}

impl ChatStore {
    pub fn new(persistence: Arc<dyn KeyValueStore>, limits: &InputConfig) -> Self {
        Self {
            persistence,
            limits: limits.clone(),
            session_id: String::new(),
            connection_state: ConnectionState::Disconnected,
            sending: false,
            speaking: false,
            mouth_state: MouthState::Closed,
            messages: Vec::new(),
            history: Vec::new(),
            input_text: String::new(),
            show_history: false,
        }
    }

    /// Restore the persisted session id, if any. Returns the loaded value.
    pub fn load_session_id(&mut self) -> StoreResult<Option<String>> {
        let saved = self.persistence.load(SESSION_ID_KEY)?;
        if let Some(id) = saved.as_ref().filter(|id| !id.is_empty()) {
            debug!("Restored session id {}", id);
            self.session_id = id.clone();
        }
        Ok(saved)
    }

    /// Set the session id and persist it.
    pub fn set_session_id(&mut self, id: impl Into<String>) -> StoreResult<()> {
        self.session_id = id.into();
        self.persistence.save(SESSION_ID_KEY, &self.session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn set_sending(&mut self, sending: bool) {
        self.sending = sending;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn set_speaking(&mut self, speaking: bool) {
        self.speaking = speaking;
    }

    pub fn mouth_state(&self) -> MouthState {
        self.mouth_state
    }

    pub fn set_mouth_state(&mut self, state: MouthState) {
        self.mouth_state = state;
    }

    pub fn reset_mouth(&mut self) {
        self.mouth_state = MouthState::Closed;
    }

    pub fn messages(&self) -> &[ChatEntry] {
        &self.messages
    }

    /// Append a complete entry to the log.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) -> &ChatEntry {
        self.finish_streaming();
        self.messages.push(ChatEntry::new(role, content));
        &self.messages[self.messages.len() - 1]
    }

    /// Append a streamed chunk to the assistant entry in progress, opening one if needed.
    pub fn append_assistant_chunk(&mut self, chunk: &str) {
        match self.streaming_entry() {
            Some(entry) => entry.content.push_str(chunk),
            None => {
                let mut entry = ChatEntry::new(Role::Assistant, chunk);
                entry.streaming = true;
                self.messages.push(entry);
            }
        }
    }

    /// Close the assistant entry in progress with the server's full text.
    ///
    /// An empty `full_text` keeps whatever was streamed.
    pub fn complete_assistant(&mut self, full_text: &str) {
        match self.streaming_entry() {
            Some(entry) => {
                if !full_text.is_empty() {
                    entry.content = full_text.to_string();
                }
                entry.streaming = false;
            }
            None if !full_text.is_empty() => {
                self.messages.push(ChatEntry::new(Role::Assistant, full_text));
            }
            None => {}
        }
    }

    fn streaming_entry(&mut self) -> Option<&mut ChatEntry> {
        self.messages
            .last_mut()
            .filter(|entry| entry.role == Role::Assistant && entry.streaming)
    }

    fn finish_streaming(&mut self) {
        if let Some(entry) = self.messages.last_mut() {
            entry.streaming = false;
        }
    }

    /// Server-side history of this session, as last fetched.
    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    pub fn set_history(&mut self, history: Vec<HistoryRecord>) {
        self.history = history;
    }

    pub fn input_text(&self) -> &str {
        &self.input_text
    }

    pub fn set_input_text(&mut self, text: impl Into<String>) {
        self.input_text = text.into();
    }

    pub fn clear_input(&mut self) {
        self.input_text.clear();
    }

    pub fn show_history(&self) -> bool {
        self.show_history
    }

    pub fn toggle_history(&mut self) -> bool {
        self.show_history = !self.show_history;
        self.show_history
    }

    pub fn char_count(&self) -> usize {
        self.input_text.chars().count()
    }

    pub fn can_send(&self) -> bool {
        !self.sending && !self.input_text.trim().is_empty() && self.char_count() <= self.limits.max_chars
    }

    pub fn is_char_limit_warning(&self) -> bool {
        self.char_count() > self.limits.warn_chars
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Fold one core event into the state.
    pub fn apply(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Connection(state) => self.set_connection_state(state),
            StoreEvent::Mouth(state) => self.set_mouth_state(state),
            StoreEvent::Playback(PlaybackEvent::Started { .. }) => self.set_speaking(true),
            StoreEvent::Playback(PlaybackEvent::Failed { reason, .. }) => {
                warn!("Playback failed: {}", reason);
                self.set_speaking(false);
                self.reset_mouth();
            }
            StoreEvent::Playback(PlaybackEvent::Finished { .. } | PlaybackEvent::Stopped { .. }) => {
                self.set_speaking(false);
                self.reset_mouth();
            }
        }
    }
}
