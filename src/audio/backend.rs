//! # Audio Pipeline Port
//!
//! The playback analyzer only sees two traits:
//! - [`AudioBackend`]: turns encoded bytes into a playable, analyzable graph
//! - [`AudioGraph`]: source → analyser → output, with transport controls
//!
//! ## Rodio implementation:
//! ```text
//! Decoder ─► Vec<f32> ─► TapSource ─► Sink (output thread)
//!                            │
//!                            └─► HeapRb<f32> (mono) ─► SpectrumAnalyser ─► [u8; bins]
//! ```
//! The decoded samples are kept in memory so the graph can rewind without re-decoding.
//! `OutputStream` is not `Send`, so it lives on a dedicated thread for the whole
//! playback, and only the `Sink` is shared back. `start` only spawns that thread; the
//! device is opened there, off the caller's (async) thread.
//!
//! ## Failures:
//! rodio surfaces no runtime stream errors once a sink is playing. The only failure the
//! rodio graph reports through `on_finish(Err(..))` is an output device or sink that
//! cannot be opened.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use ringbuf::{traits::*, HeapRb};
use rodio::{Decoder, OutputStream, Sink, Source};
use tracing::{debug, warn};

use super::spectrum::SpectrumAnalyser;
use crate::error::{AnalyzerError, AnalyzerResult};

/// Called once when playback ends by itself: `Ok` at the natural end, `Err` on failure.
pub type FinishCallback = Box<dyn FnOnce(Result<(), String>) + Send + 'static>;

/// Factory for playback graphs.
pub trait AudioBackend: Send + Sync {
    /// Decode a complete audio file and build a graph whose analyser uses `fft_size`.
    fn decode(&self, bytes: Vec<u8>, fft_size: usize) -> AnalyzerResult<Box<dyn AudioGraph>>;
}

/// One decoded audio resource wired through an analyser to an output.
///
/// `start` must not block and must not invoke `on_finish` on the caller's stack. Failures
/// known at call time are returned; later ones (the output not opening, the stream
/// failing) go through `on_finish`.
pub trait AudioGraph: Send {
    fn bin_count(&self) -> usize;

    fn duration(&self) -> Option<Duration>;

    /// Current byte magnitudes, one per bin.
    fn byte_frequency_data(&mut self, out: &mut [u8]);

    fn start(&mut self, on_finish: FinishCallback) -> AnalyzerResult<()>;

    fn pause(&mut self);

    /// Move the play position back to the beginning.
    fn rewind(&mut self);

    /// Detach the analyser from the source.
    fn disconnect(&mut self);

    /// Tear down the output. After this the graph cannot be started again.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

/// Backend that decodes with `rodio` and plays on the default output device.
#[derive(Debug, Default, Clone)]
pub struct RodioBackend;

impl RodioBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for RodioBackend {
    fn decode(&self, bytes: Vec<u8>, fft_size: usize) -> AnalyzerResult<Box<dyn AudioGraph>> {
        let decoder = Decoder::new(Cursor::new(bytes)).map_err(|e| AnalyzerError::Decode(e.to_string()))?;

        let channels = decoder.channels();
        let sample_rate = decoder.sample_rate();
        if channels == 0 || sample_rate == 0 {
            return Err(AnalyzerError::Decode(format!(
                "invalid stream parameters: {} channels at {} Hz",
                channels, sample_rate
            )));
        }

        let samples: Vec<f32> = decoder.convert_samples::<f32>().collect();
        if samples.is_empty() {
            return Err(AnalyzerError::Decode("audio contains no samples".to_string()));
        }

        debug!(
            "Decoded {} samples ({} ch @ {} Hz)",
            samples.len(),
            channels,
            sample_rate
        );

        Ok(Box::new(RodioGraph::new(
            Arc::new(samples),
            channels,
            sample_rate,
            fft_size,
        )))
    }
}

/// Output thread state. The sink appears once the device is open.
#[derive(Default)]
struct Output {
    sink: Mutex<Option<Arc<Sink>>>,
    stopped: AtomicBool,
}

impl Output {
    fn sink(&self) -> MutexGuard<'_, Option<Arc<Sink>>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let sink = self.sink().take();
        if let Some(sink) = sink {
            sink.stop();
        }
    }
}

/// Body of the output thread: open the device, play the source, report the end.
fn run_output(source: TapSource, output: Arc<Output>, on_finish: FinishCallback) {
    let opened = OutputStream::try_default()
        .map_err(|e| format!("no output device: {}", e))
        .and_then(|(stream, handle)| {
            Sink::try_new(&handle)
                .map(|sink| (stream, Arc::new(sink)))
                .map_err(|e| format!("could not create sink: {}", e))
        });

    let (_stream, sink) = match opened {
        Ok(opened) => opened,
        Err(reason) => {
            if !output.is_stopped() {
                on_finish(Err(reason));
            }
            return;
        }
    };

    {
        let mut slot = output.sink();
        if output.is_stopped() {
            return;
        }
        sink.append(source);
        *slot = Some(sink.clone());
    }

    sink.sleep_until_end();
    if !output.is_stopped() {
        on_finish(Ok(()));
    }
}

/// Graph over an in-memory sample buffer.
pub struct RodioGraph {
    samples: Arc<Vec<f32>>,
    channels: u16,
    sample_rate: u32,
    position: Arc<AtomicUsize>,
    tap: Arc<Mutex<HeapRb<f32>>>,
    analyser: SpectrumAnalyser,
    window: Vec<f32>,
    output: Option<Arc<Output>>,
    connected: bool,
    released: bool,
}

impl RodioGraph {
    fn new(samples: Arc<Vec<f32>>, channels: u16, sample_rate: u32, fft_size: usize) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
            position: Arc::new(AtomicUsize::new(0)),
            tap: Arc::new(Mutex::new(HeapRb::new(fft_size))),
            analyser: SpectrumAnalyser::new(fft_size),
            window: Vec::with_capacity(fft_size),
            output: None,
            connected: true,
            released: false,
        }
    }

    fn source(&self) -> TapSource {
        TapSource {
            samples: self.samples.clone(),
            channels: self.channels,
            sample_rate: self.sample_rate,
            position: self.position.clone(),
            tap: self.tap.clone(),
            frame_sum: 0.0,
            frame_len: 0,
        }
    }

    fn clear_tap(&self) {
        if let Ok(mut tap) = self.tap.lock() {
            tap.clear();
        }
    }
}

impl AudioGraph for RodioGraph {
    fn bin_count(&self) -> usize {
        self.analyser.bin_count()
    }

    fn duration(&self) -> Option<Duration> {
        let frames = self.samples.len() as f64 / self.channels as f64;
        Some(Duration::from_secs_f64(frames / self.sample_rate as f64))
    }

    fn byte_frequency_data(&mut self, out: &mut [u8]) {
        if !self.connected {
            out.iter_mut().for_each(|b| *b = 0);
            return;
        }

        self.window.clear();
        if let Ok(tap) = self.tap.lock() {
            self.window.extend(tap.iter().copied());
        }
        self.analyser.byte_frequency_data(&self.window, out);
    }

    fn start(&mut self, on_finish: FinishCallback) -> AnalyzerResult<()> {
        if self.released {
            return Err(AnalyzerError::Output("audio graph already released".to_string()));
        }
        if self.output.is_some() {
            return Err(AnalyzerError::Playback("playback already started".to_string()));
        }

        let source = self.source();
        let output = Arc::new(Output::default());
        let thread_output = output.clone();

        thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || run_output(source, thread_output, on_finish))
            .map_err(|e| AnalyzerError::Output(e.to_string()))?;

        self.output = Some(output);
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(sink) = self.output.as_ref().and_then(|output| output.sink().clone()) {
            sink.pause();
        }
    }

    fn rewind(&mut self) {
        self.position.store(0, Ordering::SeqCst);
        self.clear_tap();
        self.analyser.reset();
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.clear_tap();
    }

    fn release(&mut self) {
        if let Some(output) = self.output.take() {
            output.stop();
        }
        self.released = true;
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for RodioGraph {
    fn drop(&mut self) {
        if !self.released {
            warn!("Audio graph dropped without release");
            self.release();
        }
    }
}

/// Pass-through source that copies a mono mixdown of everything played into the tap.
struct TapSource {
    samples: Arc<Vec<f32>>,
    channels: u16,
    sample_rate: u32,
    position: Arc<AtomicUsize>,
    tap: Arc<Mutex<HeapRb<f32>>>,
    frame_sum: f32,
    frame_len: u16,
}

impl Iterator for TapSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.position.fetch_add(1, Ordering::SeqCst);
        let Some(&sample) = self.samples.get(index) else {
            self.position.store(self.samples.len(), Ordering::SeqCst);
            return None;
        };

        self.frame_sum += sample;
        self.frame_len += 1;
        if self.frame_len >= self.channels {
            let mono = self.frame_sum / self.channels as f32;
            self.frame_sum = 0.0;
            self.frame_len = 0;

            if let Ok(mut tap) = self.tap.lock() {
                if tap.is_full() {
                    let _ = tap.try_pop();
                }
                let _ = tap.try_push(mono);
            }
        }

        Some(sample)
    }
}

impl Source for TapSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        let frames = self.samples.len() as f64 / self.channels as f64;
        Some(Duration::from_secs_f64(frames / self.sample_rate as f64))
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! Audio backend double: no device, levels and endings driven by the test.

    use super::*;

    /// Shared view of one scripted graph.
    #[derive(Default)]
    pub struct GraphProbe {
        level: Mutex<u8>,
        on_finish: Mutex<Option<FinishCallback>>,
        pub started: AtomicBool,
        pub paused: AtomicBool,
        pub rewound: AtomicBool,
        pub disconnected: AtomicBool,
        pub released: AtomicBool,
        pub reads: AtomicUsize,
    }

    impl GraphProbe {
        /// Every bin reports `level` from now on.
        pub fn set_level(&self, level: u8) {
            *self.level.lock().unwrap() = level;
        }

        pub fn finish(&self) {
            let on_finish = self.on_finish.lock().unwrap().take();
            if let Some(on_finish) = on_finish {
                on_finish(Ok(()));
            }
        }

        pub fn fail(&self, reason: &str) {
            let on_finish = self.on_finish.lock().unwrap().take();
            if let Some(on_finish) = on_finish {
                on_finish(Err(reason.to_string()));
            }
        }

        pub fn is(&self, flag: &AtomicBool) -> bool {
            flag.load(Ordering::SeqCst)
        }
    }

    struct ScriptedGraph {
        probe: Arc<GraphProbe>,
        bins: usize,
        fail_start: bool,
    }

    impl AudioGraph for ScriptedGraph {
        fn bin_count(&self) -> usize {
            self.bins
        }

        fn duration(&self) -> Option<Duration> {
            Some(Duration::from_millis(1500))
        }

        fn byte_frequency_data(&mut self, out: &mut [u8]) {
            self.probe.reads.fetch_add(1, Ordering::SeqCst);
            let level = if self.probe.disconnected.load(Ordering::SeqCst) {
                0
            } else {
                *self.probe.level.lock().unwrap()
            };
            out.iter_mut().for_each(|b| *b = level);
        }

        fn start(&mut self, on_finish: FinishCallback) -> AnalyzerResult<()> {
            if self.fail_start {
                return Err(AnalyzerError::Output("no output device".to_string()));
            }
            self.probe.started.store(true, Ordering::SeqCst);
            *self.probe.on_finish.lock().unwrap() = Some(on_finish);
            Ok(())
        }

        fn pause(&mut self) {
            self.probe.paused.store(true, Ordering::SeqCst);
        }

        fn rewind(&mut self) {
            self.probe.rewound.store(true, Ordering::SeqCst);
        }

        fn disconnect(&mut self) {
            self.probe.disconnected.store(true, Ordering::SeqCst);
        }

        fn release(&mut self) {
            assert!(
                !self.probe.released.swap(true, Ordering::SeqCst),
                "graph released twice"
            );
            self.probe.on_finish.lock().unwrap().take();
        }

        fn is_released(&self) -> bool {
            self.probe.released.load(Ordering::SeqCst)
        }
    }

    /// Accepts payloads starting with `AUDIO`; anything else is a decode error.
    #[derive(Default)]
    pub struct ScriptedBackend {
        probes: Mutex<Vec<Arc<GraphProbe>>>,
        pub fail_start: AtomicBool,
    }

    impl ScriptedBackend {
        pub fn graphs(&self) -> usize {
            self.probes.lock().unwrap().len()
        }

        pub fn last(&self) -> Arc<GraphProbe> {
            self.probes.lock().unwrap().last().cloned().expect("no graphs decoded")
        }
    }

    impl AudioBackend for ScriptedBackend {
        fn decode(&self, bytes: Vec<u8>, fft_size: usize) -> AnalyzerResult<Box<dyn AudioGraph>> {
            if !bytes.starts_with(b"AUDIO") {
                return Err(AnalyzerError::Decode("unrecognized format".to_string()));
            }

            let probe = Arc::new(GraphProbe::default());
            self.probes.lock().unwrap().push(probe.clone());
            Ok(Box::new(ScriptedGraph {
                probe,
                bins: fft_size / 2,
                fail_start: self.fail_start.load(Ordering::SeqCst),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};

    /// 16-bit mono PCM WAV file in memory.
    fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.write_u32::<LittleEndian>(36 + data_len).unwrap();
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.write_u32::<LittleEndian>(16).unwrap();
        bytes.write_u16::<LittleEndian>(1).unwrap();
        bytes.write_u16::<LittleEndian>(1).unwrap();
        bytes.write_u32::<LittleEndian>(sample_rate).unwrap();
        bytes.write_u32::<LittleEndian>(sample_rate * 2).unwrap();
        bytes.write_u16::<LittleEndian>(2).unwrap();
        bytes.write_u16::<LittleEndian>(16).unwrap();
        bytes.extend_from_slice(b"data");
        bytes.write_u32::<LittleEndian>(data_len).unwrap();
        for &sample in samples {
            bytes.write_i16::<LittleEndian>(sample).unwrap();
        }
        bytes
    }

    fn tone(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| ((2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 8000.0).sin() * 30_000.0) as i16)
            .collect()
    }

    #[test]
    fn test_decode_wav_builds_graph() {
        let graph = RodioBackend::new().decode(wav_bytes(&tone(8000), 8000), 256).unwrap();

        assert_eq!(graph.bin_count(), 128);
        let duration = graph.duration().unwrap();
        assert!((duration.as_secs_f64() - 1.0).abs() < 0.01);
        assert!(!graph.is_released());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = RodioBackend::new().decode(b"definitely not audio".to_vec(), 256);
        assert!(matches!(result, Err(AnalyzerError::Decode(_))));
    }

    #[test]
    fn test_tap_source_feeds_analyser() {
        let samples: Vec<f32> = tone(1024).iter().map(|&s| s as f32 / i16::MAX as f32).collect();
        let mut graph = RodioGraph::new(Arc::new(samples), 1, 8000, 256);
        let mut bins = vec![0u8; graph.bin_count()];

        graph.byte_frequency_data(&mut bins);
        assert!(bins.iter().all(|&b| b == 0), "nothing played yet");

        let played: Vec<f32> = graph.source().take(512).collect();
        assert_eq!(played.len(), 512);
        assert_eq!(graph.position.load(Ordering::SeqCst), 512);

        graph.byte_frequency_data(&mut bins);
        assert!(bins.iter().any(|&b| b > 100));

        graph.rewind();
        assert_eq!(graph.position.load(Ordering::SeqCst), 0);

        graph.disconnect();
        graph.byte_frequency_data(&mut bins);
        assert!(bins.iter().all(|&b| b == 0));

        graph.release();
        assert!(graph.is_released());
    }

    #[test]
    fn test_tap_source_downmixes_stereo() {
        let samples = Arc::new(vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0]);
        let mut graph = RodioGraph::new(samples, 2, 8000, 256);
        let source = graph.source();

        assert_eq!(source.channels(), 2);
        assert_eq!(source.collect::<Vec<_>>().len(), 6);

        let tap: Vec<f32> = graph.tap.lock().unwrap().iter().copied().collect();
        assert_eq!(tap, vec![0.5, 0.5, 0.0]);

        graph.release();
    }

    #[test]
    fn test_start_does_not_wait_for_output() {
        let samples: Vec<f32> = tone(400).iter().map(|&s| s as f32 / i16::MAX as f32).collect();
        let mut graph = RodioGraph::new(Arc::new(samples), 1, 8000, 256);
        let (tx, rx) = std::sync::mpsc::channel();

        graph
            .start(Box::new(move |result| {
                let _ = tx.send(result);
            }))
            .unwrap();
        assert!(graph.output.is_some());

        // Natural end with a sound device, a device error without one.
        let ended = rx.recv_timeout(Duration::from_secs(10));
        assert!(ended.is_ok(), "on_finish never called");

        graph.release();
        assert!(graph.is_released());
    }

    #[test]
    fn test_released_graph_cannot_start() {
        let mut graph = RodioGraph::new(Arc::new(vec![0.0; 16]), 1, 8000, 256);
        graph.release();
        let result = graph.start(Box::new(|_| {}));
        assert!(matches!(result, Err(AnalyzerError::Output(_))));
    }
}
