//! # Playback Analyzer
//!
//! Plays one decoded audio payload at a time and turns its loudness into a discrete
//! mouth state while it plays.
//!
//! ## Session lifecycle:
//! 1. `init(base64)` decodes the payload and builds the graph (any previous session is
//!    stopped first)
//! 2. `play(callback)` registers the callback, samples once immediately, then once per
//!    frame, and starts the output; it resolves when playback ends
//! 3. `stop()` tears everything down together: sampling loop, output position, analyser
//!    connection and output context
//!
//! ## Sampling:
//! Each frame reads the byte spectrum, takes the mean over all bins (0-255) and maps it
//! through [`MouthState::from_level`]. The callback runs with no lock held, so it may call
//! `stop()` itself.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{AudioBackend, AudioGraph, FinishCallback};
use crate::clock::{Clock, TimerHandle};
use crate::config::PlaybackConfig;
use crate::error::{AnalyzerError, AnalyzerResult};

/// Visual mouth openness derived from loudness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MouthState {
    #[default]
    Closed,
    Slight,
    Half,
    Wide,
    Full,
}

impl MouthState {
    /// Map a mean byte magnitude (0-255) onto a mouth state.
    ///
    /// | mean      | state  |
    /// |-----------|--------|
    /// | < 30      | Closed |
    /// | 30 - 79   | Slight |
    /// | 80 - 129  | Half   |
    /// | 130 - 179 | Wide   |
    /// | >= 180    | Full   |
    pub fn from_level(level: f64) -> Self {
        if level.is_nan() || level < 30.0 {
            MouthState::Closed
        } else if level < 80.0 {
            MouthState::Slight
        } else if level < 130.0 {
            MouthState::Half
        } else if level < 180.0 {
            MouthState::Wide
        } else {
            MouthState::Full
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<MouthState> for u8 {
    fn from(state: MouthState) -> Self {
        state.as_u8()
    }
}

impl TryFrom<u8> for MouthState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MouthState::Closed),
            1 => Ok(MouthState::Slight),
            2 => Ok(MouthState::Half),
            3 => Ok(MouthState::Wide),
            4 => Ok(MouthState::Full),
            other => Err(format!("mouth state out of range: {}", other)),
        }
    }
}

impl fmt::Display for MouthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Arithmetic mean of byte magnitudes; empty input is silence.
pub fn mean_level(bins: &[u8]) -> f64 {
    if bins.is_empty() {
        return 0.0;
    }
    bins.iter().map(|&b| b as f64).sum::<f64>() / bins.len() as f64
}

/// Description of an initialized audio session.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioHandle {
    pub id: Uuid,
    pub bin_count: usize,
    pub duration: Option<Duration>,
}

/// Lifecycle notifications for observers that do not own the `play` future.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started { id: Uuid },
    Finished { id: Uuid },
    Failed { id: Uuid, reason: String },
    Stopped { id: Uuid },
}

/// Callback receiving the mouth state every sampled frame.
pub type StateCallback = Arc<dyn Fn(MouthState) + Send + Sync>;

type Completion = oneshot::Sender<AnalyzerResult<()>>;

struct Session {
    id: Uuid,
    graph: Box<dyn AudioGraph>,
    bins: Vec<u8>,
    sampler: Option<TimerHandle>,
    on_state_change: Option<StateCallback>,
    completion: Option<Completion>,
    mouth: MouthState,
}

/// How a session ended; decides the result handed to a pending `play`.
enum Ending {
    Natural,
    Failed(String),
    Stopped,
}

struct Shared {
    backend: Arc<dyn AudioBackend>,
    clock: Arc<dyn Clock>,
    fft_size: usize,
    frame_interval: Duration,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<PlaybackEvent>,
}

/// Single-session audio player with loudness sampling. Clones share the session.
#[derive(Clone)]
pub struct PlaybackAnalyzer {
    shared: Arc<Shared>,
}

impl PlaybackAnalyzer {
    pub fn new(backend: Arc<dyn AudioBackend>, clock: Arc<dyn Clock>, config: &PlaybackConfig) -> Self {
        let (events, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                backend,
                clock,
                fft_size: config.fft_size,
                frame_interval: config.frame_interval(),
                session: Mutex::new(None),
                events,
            }),
        }
    }

    /// Decode a base64 audio payload and prepare it for playback.
    ///
    /// Stops any existing session first. On failure nothing is retained.
    pub fn init(&self, encoded: &str) -> AnalyzerResult<AudioHandle> {
        self.stop();

        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        let graph = self.shared.backend.decode(bytes, self.shared.fft_size)?;

        let handle = AudioHandle {
            id: Uuid::new_v4(),
            bin_count: graph.bin_count(),
            duration: graph.duration(),
        };

        let previous = self.shared.lock().replace(Session {
            id: handle.id,
            bins: vec![0; handle.bin_count],
            graph,
            sampler: None,
            on_state_change: None,
            completion: None,
            mouth: MouthState::Closed,
        });
        if let Some(previous) = previous {
            // A concurrent init won the race; it must not leak.
            self.shared.teardown(previous, Ending::Stopped);
        }

        debug!("Audio session {} initialized ({:?})", handle.id, handle.duration);
        Ok(handle)
    }

    /// Play the initialized audio, reporting mouth states until it ends.
    ///
    /// ## Returns:
    /// - `Ok(())` when playback reaches its natural end
    /// - `Err(Playback)` when the output fails mid-play
    /// - `Err(Interrupted)` when `stop()` (or a new `init`) ends it early
    ///
    /// All resources are released before the result is delivered.
    pub async fn play(&self, on_state_change: impl Fn(MouthState) + Send + Sync + 'static) -> AnalyzerResult<()> {
        let (completion, done) = oneshot::channel();

        let id = {
            let mut guard = self.shared.lock();
            let session = guard.as_mut().ok_or(AnalyzerError::NotInitialized)?;
            if session.completion.is_some() {
                return Err(AnalyzerError::Playback("audio is already playing".to_string()));
            }

            let id = session.id;
            session.on_state_change = Some(Arc::new(on_state_change));
            session.completion = Some(completion);
            session.sampler = Some(self.shared.start_sampling(id));

            if let Err(e) = session.graph.start(self.shared.finish_callback(id)) {
                let failed = guard.take();
                drop(guard);
                if let Some(mut session) = failed {
                    session.completion = None;
                    self.shared.teardown(session, Ending::Failed(e.to_string()));
                }
                return Err(e);
            }

            // Must precede any end event from the output thread.
            let _ = self.shared.events.send(PlaybackEvent::Started { id });
            id
        };

        info!("Audio session {} playing", id);
        self.shared.sample(id);

        done.await.unwrap_or(Err(AnalyzerError::Interrupted))
    }

    /// Tear down the current session. Idempotent and safe before `init`.
    pub fn stop(&self) {
        let session = self.shared.lock().take();
        if let Some(session) = session {
            self.shared.teardown(session, Ending::Stopped);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lock().is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.shared
            .lock()
            .as_ref()
            .map(|s| s.completion.is_some())
            .unwrap_or(false)
    }

    /// Mouth state computed on the most recent frame, `Closed` when idle.
    pub fn mouth_state(&self) -> MouthState {
        self.shared
            .lock()
            .as_ref()
            .map(|s| s.mouth)
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_sampling(self: &Arc<Self>, id: Uuid) -> TimerHandle {
        let weak = Arc::downgrade(self);
        self.clock.schedule_repeating(
            self.frame_interval,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.sample(id);
                }
            }),
        )
    }

    fn finish_callback(self: &Arc<Self>, id: Uuid) -> FinishCallback {
        let weak = Arc::downgrade(self);
        Box::new(move |result| {
            if let Some(shared) = weak.upgrade() {
                shared.on_playback_end(id, result);
            }
        })
    }

    /// One frame of the sampling loop.
    fn sample(&self, id: Uuid) {
        let (callback, state) = {
            let mut guard = self.lock();
            let Some(session) = guard.as_mut() else { return };
            if session.id != id || session.sampler.is_none() {
                return;
            }

            session.graph.byte_frequency_data(&mut session.bins);
            let state = MouthState::from_level(mean_level(&session.bins));
            session.mouth = state;
            (session.on_state_change.clone(), state)
        };

        if let Some(callback) = callback {
            callback(state);
        }
    }

    fn on_playback_end(&self, id: Uuid, result: Result<(), String>) {
        let session = {
            let mut guard = self.lock();
            let current = guard.as_ref().map(|s| s.id == id).unwrap_or(false);
            if current {
                guard.take()
            } else {
                None
            }
        };

        let Some(session) = session else {
            debug!("Ignoring end of superseded audio session {}", id);
            return;
        };

        let ending = match result {
            Ok(()) => Ending::Natural,
            Err(reason) => {
                warn!("Audio session {} failed: {}", id, reason);
                Ending::Failed(reason)
            }
        };
        self.teardown(session, ending);
    }

    /// Release everything a session owns, then report how it ended.
    fn teardown(&self, mut session: Session, ending: Ending) {
        if let Some(sampler) = session.sampler.take() {
            sampler.cancel();
        }

        session.graph.pause();
        session.graph.rewind();
        session.graph.disconnect();
        if !session.graph.is_released() {
            session.graph.release();
        }
        session.on_state_change = None;

        let id = session.id;
        let (result, event) = match ending {
            Ending::Natural => (Ok(()), PlaybackEvent::Finished { id }),
            Ending::Failed(reason) => (
                Err(AnalyzerError::Playback(reason.clone())),
                PlaybackEvent::Failed { id, reason },
            ),
            Ending::Stopped => (Err(AnalyzerError::Interrupted), PlaybackEvent::Stopped { id }),
        };

        debug!("Audio session {} released", id);

        if let Some(completion) = session.completion.take() {
            let _ = completion.send(result);
            let _ = self.events.send(event);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut session) = session {
            if let Some(sampler) = session.sampler.take() {
                sampler.cancel();
            }
            if !session.graph.is_released() {
                session.graph.release();
            }
        }
    }
}
