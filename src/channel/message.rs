//! Wire envelope and connection lifecycle types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{ChannelError, ChannelResult};

/// `type` of the liveness ping sent while the channel is open.
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// Field injected into every outbound message.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// A structured wire message: a required `type` plus free-form fields.
///
/// ## Wire format:
/// ```json
/// {"type": "ai_text_chunk", "content": "Hello", "timestamp": 1700000000000}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Re-read the whole envelope (including `type`) as a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::to_value(self).and_then(serde_json::from_value)
    }
}

/// Serialize `message` and stamp it with the send time.
///
/// The message must serialize to a JSON object with a string `type` field.
pub(crate) fn encode_outbound<M: Serialize + ?Sized>(message: &M, now_ms: i64) -> ChannelResult<String> {
    let value = serde_json::to_value(message).map_err(|e| ChannelError::Encode(e.to_string()))?;

    let Value::Object(mut map) = value else {
        return Err(ChannelError::Encode("message must be a JSON object".to_string()));
    };

    if !map.get("type").map(Value::is_string).unwrap_or(false) {
        return Err(ChannelError::Encode("message is missing a string `type` field".to_string()));
    }

    map.insert(TIMESTAMP_FIELD.to_string(), Value::from(now_ms));
    serde_json::to_string(&Value::Object(map)).map_err(|e| ChannelError::Encode(e.to_string()))
}

/// Lifecycle of the single connection owned by a channel manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_message_parsing() {
        let message: Message =
            serde_json::from_str(r#"{"type":"welcome","session_id":"abc","duration":1200}"#).unwrap();
        assert_eq!(message.kind, "welcome");
        assert_eq!(message.get_str("session_id"), Some("abc"));
        assert_eq!(message.get("duration"), Some(&json!(1200)));
    }

    #[test]
    fn test_message_without_type_is_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"content":"hi"}"#).is_err());
        assert!(serde_json::from_str::<Message>("[1,2,3]").is_err());
    }

    #[test]
    fn test_encode_outbound_stamps_timestamp() {
        let message = Message::new("user_message").with("content", "hello");
        let text = encode_outbound(&message, 42).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "user_message", "content": "hello", "timestamp": 42}));
    }

    #[test]
    fn test_encode_outbound_rejects_non_objects() {
        assert!(matches!(encode_outbound(&vec![1, 2], 0), Err(ChannelError::Encode(_))));
        assert!(matches!(encode_outbound(&json!({"content": "x"}), 0), Err(ChannelError::Encode(_))));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(serde_json::to_string(&ConnectionState::Closing).unwrap(), "\"closing\"");
    }
}
