//! # Chat Avatar Client
//!
//! Client core for a voice chat assistant with an animated avatar.
//!
//! ## Modules:
//! - **channel**: reconnecting, heartbeat-keeping JSON message channel over WebSocket
//! - **audio**: plays synthesized speech and maps its loudness to a mouth state (0-4)
//! - **protocol**: typed chat messages carried over the channel
//! - **state** / **storage**: application state and its persisted part
//! - **controller**: wires the above together
//! - **clock**: time source shared by timers, heartbeats and the sampling loop

pub mod audio;
pub mod channel;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod state;
pub mod storage;

pub use audio::{MouthState, PlaybackAnalyzer, PlaybackEvent};
pub use channel::{ChannelManager, ConnectionState, Message};
pub use config::AppConfig;
pub use controller::ChatController;
pub use error::{AnalyzerError, ChannelError, StoreError};
