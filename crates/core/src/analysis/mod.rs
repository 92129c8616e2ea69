use std::{
    f32::consts::PI,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{AnalyserConfig, Result, VisualiserError};

/// Byte magnitudes for every frequency bin at one instant. Always an owned copy
/// of the analyser output, so later analyser updates never reach a frame that
/// has already been handed out.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrequencyFrame {
    bins: Vec<u8>,
}

impl FrequencyFrame {
    pub fn new(bins: Vec<u8>) -> Self {
        Self { bins }
    }

    pub fn zeroed(bin_count: usize) -> Self {
        Self {
            bins: vec![0; bin_count],
        }
    }

    pub fn bins(&self) -> &[u8] {
        &self.bins
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.bins.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn is_silent(&self) -> bool {
        self.bins.iter().all(|&value| value == 0)
    }
}

/// Shared ring buffer between a playback stream and the analyser. The stream
/// writes mono samples from the audio thread; the analyser copies the most
/// recent window out on each frame.
#[derive(Clone)]
pub struct AnalysisTap {
    shared: Arc<Mutex<TapBuffer>>,
}

struct TapBuffer {
    samples: Vec<f32>,
    write: usize,
    connected: bool,
    written: u64,
}

impl AnalysisTap {
    pub fn new(window: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(TapBuffer {
                samples: vec![0.0; window],
                write: 0,
                connected: false,
                written: 0,
            })),
        }
    }

    /// Marks audio as flowing and clears stale samples from a previous session.
    pub fn connect(&self) -> Result<()> {
        let mut tap = self.lock()?;
        tap.samples.fill(0.0);
        tap.write = 0;
        tap.connected = true;
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.lock()?.connected = false;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().map(|tap| tap.connected).unwrap_or(false)
    }

    /// Total number of samples pushed since the tap was created.
    pub fn samples_written(&self) -> u64 {
        self.lock().map(|tap| tap.written).unwrap_or(0)
    }

    /// Appends mono samples. Ignored while disconnected.
    pub fn push(&self, samples: &[f32]) -> Result<()> {
        let mut tap = self.lock()?;
        if !tap.connected {
            return Ok(());
        }

        let window = tap.samples.len();
        for &sample in samples {
            let write = tap.write;
            tap.samples[write] = sample;
            tap.write = (write + 1) % window;
        }
        tap.written += samples.len() as u64;
        Ok(())
    }

    /// Copies the window, oldest sample first, into `out`. Returns `false`
    /// without touching `out` when no audio is flowing.
    fn read_window(&self, out: &mut [f32]) -> Result<bool> {
        let tap = self.lock()?;
        if !tap.connected {
            return Ok(false);
        }

        let (newest, oldest) = tap.samples.split_at(tap.write);
        out[..oldest.len()].copy_from_slice(oldest);
        out[oldest.len()..].copy_from_slice(newest);
        Ok(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, TapBuffer>> {
        self.shared
            .lock()
            .map_err(|_| VisualiserError::invalid_state("analysis tap has been poisoned"))
    }
}

impl fmt::Debug for AnalysisTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisTap")
            .field("connected", &self.is_connected())
            .field("samples_written", &self.samples_written())
            .finish()
    }
}

/// Magnitude-spectrum analyser producing byte frames. The transform size is
/// fixed at construction; a different size needs a new analyser.
pub struct SpectrumAnalyser {
    config: AnalyserConfig,
    tap: AnalysisTap,
    fft: FftResources,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    frames_sampled: u64,
}

impl SpectrumAnalyser {
    /// Builds an analyser for `resolution` samples with first-stage smoothing
    /// `smoothing` and the default decibel range.
    pub fn configure(resolution: usize, smoothing: f32) -> Result<Self> {
        Self::with_config(AnalyserConfig {
            fft_size: resolution,
            smoothing,
            ..Default::default()
        })
    }

    pub fn with_config(config: AnalyserConfig) -> Result<Self> {
        config.validate()?;

        let size = config.fft_size;
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        let fft = FftResources {
            input: plan.make_input_vec(),
            spectrum: plan.make_output_vec(),
            scratch: plan.make_scratch_vec(),
            plan,
        };

        Ok(Self {
            tap: AnalysisTap::new(size),
            window: blackman_window(size),
            smoothed: vec![0.0; config.bin_count()],
            config,
            fft,
            frames_sampled: 0,
        })
    }

    pub fn config(&self) -> &AnalyserConfig {
        &self.config
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.config.bin_count()
    }

    /// Handle that playback streams write into.
    pub fn tap(&self) -> &AnalysisTap {
        &self.tap
    }

    pub fn frames_sampled(&self) -> u64 {
        self.frames_sampled
    }

    /// Reads the current spectrum without waiting for new audio. Returns an
    /// all-zero frame while nothing is connected to the tap.
    pub fn sample(&mut self) -> Result<FrequencyFrame> {
        self.frames_sampled += 1;

        if !self.tap.read_window(&mut self.fft.input)? {
            self.smoothed.fill(0.0);
            return Ok(FrequencyFrame::zeroed(self.bin_count()));
        }

        for (sample, weight) in self.fft.input.iter_mut().zip(&self.window) {
            *sample *= weight;
        }

        self.fft
            .plan
            .process_with_scratch(&mut self.fft.input, &mut self.fft.spectrum, &mut self.fft.scratch)
            .map_err(|err| VisualiserError::invalid_state(format!("fft failed: {err}")))?;

        let size = self.config.fft_size as f32;
        let tau = self.config.smoothing;
        let min_decibels = self.config.min_decibels;
        let scale = 255.0 / (self.config.max_decibels - min_decibels);

        // The real transform yields N/2 + 1 bins; the Nyquist bin is dropped.
        let bins = self
            .smoothed
            .iter_mut()
            .zip(&self.fft.spectrum)
            .map(|(previous, bin)| {
                let magnitude = bin.norm() / size;
                *previous = tau * *previous + (1.0 - tau) * magnitude;
                magnitude_to_byte(*previous, min_decibels, scale)
            })
            .collect();

        Ok(FrequencyFrame::new(bins))
    }
}

impl fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("config", &self.config)
            .field("tap", &self.tap)
            .field("frames_sampled", &self.frames_sampled)
            .finish()
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

fn magnitude_to_byte(magnitude: f32, min_decibels: f32, scale: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let decibels = 20.0 * magnitude.log10();
    let scaled = (scale * (decibels - min_decibels)).floor();
    scaled.clamp(0.0, 255.0) as u8
}

fn blackman_window(len: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;

    (0..len)
        .map(|n| {
            let x = n as f32 / len as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency_bin: usize, size: usize, amplitude: f32) -> Vec<f32> {
        (0..size)
            .map(|n| amplitude * (2.0 * PI * frequency_bin as f32 * n as f32 / size as f32).sin())
            .collect()
    }

    #[test]
    fn bin_count_is_half_the_resolution() {
        let analyser = SpectrumAnalyser::configure(128, 0.8).unwrap();
        assert_eq!(analyser.bin_count(), 64);
        assert_eq!(analyser.fft_size(), 128);
    }

    #[test]
    fn rejects_invalid_resolution() {
        assert!(matches!(
            SpectrumAnalyser::configure(100, 0.5),
            Err(VisualiserError::Config(_))
        ));
        assert!(SpectrumAnalyser::configure(16, 0.5).is_err());
        assert!(SpectrumAnalyser::configure(64, 1.2).is_err());
    }

    #[test]
    fn disconnected_tap_yields_zero_frames() {
        let mut analyser = SpectrumAnalyser::configure(64, 0.0).unwrap();
        analyser.tap().push(&sine(4, 64, 1.0)).unwrap();

        let frame = analyser.sample().unwrap();
        assert_eq!(frame.len(), 32);
        assert!(frame.is_silent());
    }

    #[test]
    fn sine_peaks_in_its_bin() {
        let mut analyser = SpectrumAnalyser::with_config(AnalyserConfig {
            fft_size: 256,
            smoothing: 0.0,
            min_decibels: -100.0,
            max_decibels: 0.0,
        })
        .unwrap();
        analyser.tap().connect().unwrap();
        analyser.tap().push(&sine(10, 256, 0.9)).unwrap();

        let frame = analyser.sample().unwrap();
        let (loudest, _) = frame
            .bins()
            .iter()
            .enumerate()
            .max_by_key(|(_, value)| **value)
            .unwrap();
        assert_eq!(loudest, 10);
        assert!(frame.get(10).unwrap() > 200);
        assert!(frame.get(60).unwrap() < frame.get(10).unwrap());
    }

    #[test]
    fn first_stage_smoothing_lags_behind_silence() {
        let mut analyser = SpectrumAnalyser::configure(128, 0.8).unwrap();
        analyser.tap().connect().unwrap();
        analyser.tap().push(&sine(8, 128, 0.9)).unwrap();
        let loud = analyser.sample().unwrap().get(8).unwrap();

        analyser.tap().push(&vec![0.0; 128]).unwrap();
        let after = analyser.sample().unwrap().get(8).unwrap();

        assert!(after > 0, "smoothing keeps some energy");
        assert!(after < loud);
    }

    #[test]
    fn frames_are_independent_snapshots() {
        let mut analyser = SpectrumAnalyser::configure(64, 0.0).unwrap();
        analyser.tap().connect().unwrap();
        analyser.tap().push(&sine(4, 64, 0.9)).unwrap();
        let first = analyser.sample().unwrap();
        let copy = first.clone();

        analyser.tap().push(&vec![0.0; 64]).unwrap();
        let second = analyser.sample().unwrap();

        assert_eq!(first, copy);
        assert_ne!(first, second);
    }

    #[test]
    fn tap_keeps_the_most_recent_window() {
        let tap = AnalysisTap::new(4);
        tap.connect().unwrap();
        tap.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        let mut out = [0.0; 4];
        assert!(tap.read_window(&mut out).unwrap());
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
        assert_eq!(tap.samples_written(), 6);
    }

    #[test]
    fn byte_mapping_covers_the_decibel_range() {
        let scale = 255.0 / 70.0;
        assert_eq!(magnitude_to_byte(0.0, -100.0, scale), 0);
        assert_eq!(magnitude_to_byte(1e-6, -100.0, scale), 0);
        assert_eq!(magnitude_to_byte(1e-4, -100.0, scale), 72);
        assert_eq!(magnitude_to_byte(1.0, -100.0, scale), 255);
    }
}
