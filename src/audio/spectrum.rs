//! Byte-scaled frequency spectrum, computed the way a browser `AnalyserNode` does.
//!
//! ## Pipeline per frame:
//! 1. Blackman window over the newest `fft_size` samples
//! 2. Forward FFT, magnitude of the first `fft_size / 2` bins scaled by `1 / fft_size`
//! 3. Exponential smoothing against the previous frame (`0.8`)
//! 4. Decibels mapped linearly from `[-100, -30]` onto `[0, 255]`

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

pub const DEFAULT_SMOOTHING: f32 = 0.8;
pub const DEFAULT_MIN_DB: f32 = -100.0;
pub const DEFAULT_MAX_DB: f32 = -30.0;

pub struct SpectrumAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl SpectrumAnalyser {
    pub fn new(fft_size: usize) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(fft_size);

        Self {
            fft_size,
            fft,
            window: blackman(fft_size),
            smoothed: vec![0.0; fft_size / 2],
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
            smoothing: DEFAULT_SMOOTHING,
            min_db: DEFAULT_MIN_DB,
            max_db: DEFAULT_MAX_DB,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of frequency bins, half the window size.
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Forget the smoothing history.
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }

    /// Fill `out` with byte magnitudes for the newest samples in `samples`.
    ///
    /// Shorter input is treated as preceded by silence. Extra output slots are zeroed.
    pub fn byte_frequency_data(&mut self, samples: &[f32], out: &mut [u8]) {
        let n = self.fft_size;
        let recent = &samples[samples.len().saturating_sub(n)..];
        let offset = n - recent.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < offset { 0.0 } else { recent[i - offset] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let scale = 1.0 / n as f32;
        let range = self.max_db - self.min_db;

        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[bin].norm() * scale;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
        }

        for (i, byte) in out.iter_mut().enumerate() {
            *byte = match self.smoothed.get(i) {
                Some(&magnitude) if magnitude > 0.0 => {
                    let db = 20.0 * magnitude.log10();
                    (255.0 * (db - self.min_db) / range).clamp(0.0, 255.0) as u8
                }
                _ => 0,
            };
        }
    }
}

fn blackman(size: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    let two_pi = 2.0 * std::f32::consts::PI;

    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            a0 - a1 * (two_pi * x).cos() + a2 * (2.0 * two_pi * x).cos()
        })
        .collect()
}
