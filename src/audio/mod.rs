//! # Audio Playback Module
//!
//! Plays synthesized speech and drives the avatar's mouth from its loudness.
//!
//! ## Key Components:
//! - **Playback Analyzer**: single-session init / play / stop with a per-frame sampling loop
//! - **Backend**: the decode → analyse → output port, plus its `rodio` implementation
//! - **Spectrum**: byte-scaled FFT magnitudes (window 256, 128 bins)
//!
//! ## Input Format:
//! - **Encoding**: base64 text as received in `audio_data` / `welcome` messages
//! - **Container**: anything `rodio` can decode (MP3 from the TTS service, WAV, ...)

pub mod analyzer;
pub mod backend;
pub mod spectrum;

pub use analyzer::{mean_level, AudioHandle, MouthState, PlaybackAnalyzer, PlaybackEvent, StateCallback};
pub use backend::{AudioBackend, AudioGraph, FinishCallback, RodioBackend};
pub use spectrum::SpectrumAnalyser;
