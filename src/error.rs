//! # Error Handling
//!
//! Typed errors for the two core components and the state store.
//!
//! ## Propagation policy:
//! Only failures that happen before a resource is ready (an open connection, an
//! initialized audio session) are returned to the caller. Everything that goes wrong
//! afterwards is logged with `tracing` and handled internally (retry or teardown).
//!
//! ## Error Categories:
//! - **ChannelError**: connection setup and pre-open transport failures
//! - **AnalyzerError**: audio decoding and playback failures
//! - **StoreError**: persistence of the application state

use thiserror::Error;

/// Errors surfaced by the channel manager.
///
/// ## When these are returned:
/// Only from `connect` (and the transport factory it calls). `send` and the reconnect
/// loop never return errors, they log them.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport could not be constructed (malformed address, bad request).
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// The transport reported an error before it reached the open state.
    #[error("transport error before open: {0}")]
    Transport(String),

    /// The transport closed before it ever opened.
    #[error("connection closed before it opened")]
    ClosedBeforeOpen,

    /// `close()` was called while the connection attempt was still in flight.
    #[error("connection attempt cancelled by close()")]
    Cancelled,

    /// An outbound message could not be encoded as a JSON object.
    #[error("message encoding failed: {0}")]
    Encode(String),
}

/// Errors surfaced by the playback analyzer.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The audio payload was not valid base64.
    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The audio bytes could not be decoded into samples.
    #[error("audio decode failed: {0}")]
    Decode(String),

    /// `play` was called without a successful `init`.
    #[error("audio not initialized")]
    NotInitialized,

    /// The playback context (output device) could not be created.
    #[error("audio output unavailable: {0}")]
    Output(String),

    /// Playback failed after it started.
    #[error("playback failed: {0}")]
    Playback(String),

    /// `stop()` was called while playback was in progress.
    #[error("playback interrupted by stop()")]
    Interrupted,
}

/// Errors from the key-value persistence port.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shorthand for channel manager results.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Shorthand for playback analyzer results.
pub type AnalyzerResult<T> = Result<T, AnalyzerError>;

/// Shorthand for store results.
pub type StoreResult<T> = Result<T, StoreError>;
