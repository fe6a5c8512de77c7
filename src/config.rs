//! # Configuration Management
//!
//! Loads client configuration from multiple sources:
//! - Built-in defaults (the protocol constants)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `CHAT_SERVER_URL` (address only)
//! 2. Environment variables (`APP_CHANNEL__ADDRESS`, `APP_PLAYBACK__FFT_SIZE`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the `Default` impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Maximum number of automatic reconnect attempts after an unmanaged close.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Fixed delay before each reconnect attempt (not exponential).
pub const RECONNECT_DELAY_MS: u64 = 2000;

/// Interval between outbound `heartbeat` messages while the channel is open.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Analyzer window size; the bin count is half of it.
pub const FFT_SIZE: usize = 256;

/// Sampling loop period, one display refresh at 60 Hz.
pub const FRAME_INTERVAL_MS: u64 = 16;

/// Longest user input the store lets through `can_send`.
pub const MAX_INPUT_CHARS: usize = 10_000;

/// Input length above which the character counter warns.
pub const WARN_INPUT_CHARS: usize = 9_000;

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub channel: ChannelConfig,
    pub playback: PlaybackConfig,
    pub input: InputConfig,
    pub storage: StorageConfig,
}

/// Message channel settings.
///
/// ## Fields:
/// - `address`: WebSocket URL of the chat server (e.g. `ws://127.0.0.1:8081/ws`)
/// - `max_reconnect_attempts`: retries after an unmanaged close before giving up
/// - `reconnect_delay_ms`: fixed backoff between retries
/// - `heartbeat_interval_ms`: liveness ping period while open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub address: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
}

/// Audio analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub fft_size: usize,
    pub frame_interval_ms: u64,
}

/// Limits applied to the chat input box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub max_chars: usize,
    pub warn_chars: usize,
}

/// Where the durable part of the application state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            playback: PlaybackConfig::default(),
            input: InputConfig::default(),
            storage: StorageConfig {
                path: "chat_state.json".to_string(),
            },
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            address: "ws://127.0.0.1:8081/ws".to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            fft_size: FFT_SIZE,
            frame_interval_ms: FRAME_INTERVAL_MS,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_chars: MAX_INPUT_CHARS,
            warn_chars: WARN_INPUT_CHARS,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl PlaybackConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_CHANNEL__ADDRESS=ws://chat.local/ws`
    /// - `APP_PLAYBACK__FRAME_INTERVAL_MS=33`
    /// - `CHAT_SERVER_URL=ws://chat.local/ws` (shortcut for the address)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(address) = env::var("CHAT_SERVER_URL") {
            settings = settings.set_override("channel.address", address)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.channel.address.trim().is_empty() {
            return Err(anyhow::anyhow!("Channel address cannot be empty"));
        }

        if self.channel.reconnect_delay_ms == 0 {
            return Err(anyhow::anyhow!("Reconnect delay must be greater than 0"));
        }

        if self.channel.heartbeat_interval_ms == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        let fft_size = self.playback.fft_size;
        if !fft_size.is_power_of_two() || !(32..=32768).contains(&fft_size) {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two between 32 and 32768, got {}",
                fft_size
            ));
        }

        if self.playback.frame_interval_ms == 0 {
            return Err(anyhow::anyhow!("Frame interval must be greater than 0"));
        }

        if self.input.warn_chars > self.input.max_chars {
            return Err(anyhow::anyhow!(
                "Input warning threshold ({}) exceeds the input limit ({})",
                self.input.warn_chars,
                self.input.max_chars
            ));
        }

        Ok(())
    }

    /// Apply a partial JSON override, e.g. `{"channel": {"address": "ws://..."}}`.
    ///
    /// Only the fields present in the JSON are touched; the result is re-validated.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(channel) = partial_config.get("channel") {
            if let Some(address) = channel.get("address").and_then(|v| v.as_str()) {
                self.channel.address = address.to_string();
            }
            if let Some(attempts) = channel.get("max_reconnect_attempts").and_then(|v| v.as_u64()) {
                self.channel.max_reconnect_attempts = u32::try_from(attempts)
                    .map_err(|_| anyhow::anyhow!("max_reconnect_attempts out of range: {}", attempts))?;
            }
            if let Some(delay) = channel.get("reconnect_delay_ms").and_then(|v| v.as_u64()) {
                self.channel.reconnect_delay_ms = delay;
            }
            if let Some(interval) = channel.get("heartbeat_interval_ms").and_then(|v| v.as_u64()) {
                self.channel.heartbeat_interval_ms = interval;
            }
        }

        if let Some(playback) = partial_config.get("playback") {
            if let Some(fft_size) = playback.get("fft_size").and_then(|v| v.as_u64()) {
                self.playback.fft_size = usize::try_from(fft_size)
                    .map_err(|_| anyhow::anyhow!("fft_size out of range: {}", fft_size))?;
            }
            if let Some(interval) = playback.get("frame_interval_ms").and_then(|v| v.as_u64()) {
                self.playback.frame_interval_ms = interval;
            }
        }

        if let Some(input) = partial_config.get("input") {
            if let Some(max) = input.get("max_chars").and_then(|v| v.as_u64()) {
                self.input.max_chars =
                    usize::try_from(max).map_err(|_| anyhow::anyhow!("max_chars out of range: {}", max))?;
            }
            if let Some(warn) = input.get("warn_chars").and_then(|v| v.as_u64()) {
                self.input.warn_chars =
                    usize::try_from(warn).map_err(|_| anyhow::anyhow!("warn_chars out of range: {}", warn))?;
            }
        }

        if let Some(path) = partial_config
            .get("storage")
            .and_then(|s| s.get("path"))
            .and_then(|v| v.as_str())
        {
            self.storage.path = path.to_string();
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.channel.max_reconnect_attempts, 3);
        assert_eq!(config.channel.reconnect_delay(), Duration::from_millis(2000));
        assert_eq!(config.channel.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.playback.fft_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.playback.fft_size = 300;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.channel.address = "   ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.input.warn_chars = config.input.max_chars + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"channel": {"address": "ws://chat.example:9000/ws"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.channel.address, "ws://chat.example:9000/ws");
        assert_eq!(config.channel.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"playback": {"fft_size": 100}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_config_update_rejects_oversized_attempts() {
        let mut config = AppConfig::default();
        let json = r#"{"channel": {"max_reconnect_attempts": 4294967296}}"#;
        let err = config.update_from_json(json).unwrap_err();
        assert!(err.to_string().contains("max_reconnect_attempts"));
        assert_eq!(config.channel.max_reconnect_attempts, 3);
    }
}
