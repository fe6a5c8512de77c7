//! # Chat Wire Protocol
//!
//! Typed messages exchanged with the chat server over the channel.
//!
//! ## Message Flow:
//! 1. **Welcome**: client sends `get_welcome` with its stored session id (possibly empty),
//!    server answers `welcome` with the session id to use plus greeting text and audio
//! 2. **Conversation**: client sends `user_message`, server streams `ai_text_chunk`s,
//!    then `ai_text_complete`, then `audio_data` with the synthesized reply
//! 3. **Interrupt**: client sends `stop`, server answers `stop_ack`
//! 4. **History**: client sends `get_history`, server answers `history_data` whose
//!    `content` is itself a JSON array of log entries
//!
//! Every outbound message additionally carries the `timestamp` the channel injects.
//! Heartbeats are not part of this enum; the channel emits them on its own
//! ([`crate::channel::HEARTBEAT_TYPE`]).

use serde::{Deserialize, Serialize};

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "user_message")]
    UserMessage { session_id: String, content: String },

    #[serde(rename = "get_welcome")]
    GetWelcome { session_id: String },

    #[serde(rename = "get_history")]
    GetHistory { session_id: String },

    /// Ask the server to abandon the reply in progress.
    #[serde(rename = "stop")]
    Stop,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Greeting for a new or resumed session.
    #[serde(rename = "welcome")]
    Welcome {
        session_id: String,
        #[serde(default)]
        content: String,
        #[serde(rename = "audioBase64", default)]
        audio_base64: String,
        /// Audio length in milliseconds.
        #[serde(default)]
        duration: u64,
    },

    #[serde(rename = "ai_text_chunk")]
    AiTextChunk { content: String },

    #[serde(rename = "ai_text_complete")]
    AiTextComplete {
        #[serde(rename = "fullText", default)]
        full_text: String,
    },

    #[serde(rename = "audio_data")]
    AudioData {
        #[serde(rename = "audioBase64")]
        audio_base64: String,
        #[serde(default)]
        duration: u64,
    },

    #[serde(rename = "history_data")]
    HistoryData { content: String },

    #[serde(rename = "error")]
    Error {
        #[serde(rename = "errorCode", default)]
        error_code: String,
        #[serde(rename = "errorMsg", default)]
        error_msg: String,
    },

    #[serde(rename = "stop_ack")]
    StopAck,

    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck,
}

impl ServerMessage {
    /// Every server message `type`, for handler registration.
    pub const TYPES: [&'static str; 8] = [
        "welcome",
        "ai_text_chunk",
        "ai_text_complete",
        "audio_data",
        "history_data",
        "error",
        "stop_ack",
        "heartbeat_ack",
    ];
}

/// One persisted conversation turn as returned inside `history_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Parse the `content` of a `history_data` message.
pub fn parse_history(content: &str) -> Result<Vec<HistoryRecord>, serde_json::Error> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_serialization() {
        let message = ClientMessage::UserMessage {
            session_id: "sess-1".to_string(),
            content: "你好".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "user_message", "session_id": "sess-1", "content": "你好"})
        );
        assert_eq!(serde_json::to_value(ClientMessage::Stop).unwrap(), json!({"type": "stop"}));
    }

    #[test]
    fn test_server_message_parsing() {
        let welcome: ServerMessage = serde_json::from_value(json!({
            "type": "welcome",
            "session_id": "sess-9",
            "content": "Hi there",
            "audioBase64": "AAAA",
            "duration": 1500,
            "timestamp": 0
        }))
        .unwrap();
        assert_eq!(
            welcome,
            ServerMessage::Welcome {
                session_id: "sess-9".to_string(),
                content: "Hi there".to_string(),
                audio_base64: "AAAA".to_string(),
                duration: 1500,
            }
        );

        let error: ServerMessage = serde_json::from_value(json!({
            "type": "error",
            "errorCode": "TTS_ERROR",
            "errorMsg": "speech synthesis failed"
        }))
        .unwrap();
        assert!(matches!(error, ServerMessage::Error { ref error_code, .. } if error_code == "TTS_ERROR"));
    }

    #[test]
    fn test_parse_history() {
        let records = parse_history(r#"[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]"#)
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].role, "assistant");
        assert!(parse_history("").unwrap().is_empty());
        assert!(parse_history("{oops").is_err());
    }
}
