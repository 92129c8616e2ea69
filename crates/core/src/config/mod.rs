use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, VisualiserError};

/// Smallest transform size the analyser accepts.
pub const MIN_FFT_SIZE: usize = 32;
/// Largest transform size the analyser accepts.
pub const MAX_FFT_SIZE: usize = 32_768;

/// Top-level configuration structure. Everything here is fixed once a
/// [`crate::Visualiser`] has been built; changing the FFT size means building a
/// new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VisualiserConfig {
    pub analyser: AnalyserConfig,
    pub bars: BarConfig,
    pub smoothing: SmoothingParams,
}

impl VisualiserConfig {
    /// Parses a JSON document. Missing fields fall back to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.analyser.validate()?;
        self.smoothing.validate()?;

        let bins = self.analyser.bin_count();
        if self.bars.count == 0 {
            return Err(VisualiserError::config("bar count must be at least one"));
        }
        if self.bars.count > bins {
            return Err(VisualiserError::config(format!(
                "bar count {} exceeds the {bins} bins produced by fft size {}",
                self.bars.count, self.analyser.fft_size
            )));
        }
        if !(self.bars.radius.is_finite() && self.bars.radius > 0.0) {
            return Err(VisualiserError::config("bar radius must be positive"));
        }

        Ok(())
    }
}

/// Settings for the frequency-analysis node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    /// Transform size; a power of two of at least 32.
    pub fft_size: usize,
    /// First-stage smoothing applied inside the analyser, in `[0, 1]`.
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl AnalyserConfig {
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn validate(&self) -> Result<()> {
        if !self.fft_size.is_power_of_two()
            || self.fft_size < MIN_FFT_SIZE
            || self.fft_size > MAX_FFT_SIZE
        {
            return Err(VisualiserError::config(format!(
                "fft size {} must be a power of two between {MIN_FFT_SIZE} and {MAX_FFT_SIZE}",
                self.fft_size
            )));
        }
        if !(0.0..=1.0).contains(&self.smoothing) {
            return Err(VisualiserError::config(format!(
                "analyser smoothing {} must lie in [0, 1]",
                self.smoothing
            )));
        }
        if !(self.min_decibels < self.max_decibels) {
            return Err(VisualiserError::config(format!(
                "min decibels {} must be below max decibels {}",
                self.min_decibels, self.max_decibels
            )));
        }
        Ok(())
    }
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 128,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

/// Number and placement of the bars driven by the analyser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarConfig {
    pub count: usize,
    pub radius: f32,
}

impl Default for BarConfig {
    fn default() -> Self {
        Self {
            count: 64,
            radius: 4.0,
        }
    }
}

/// Second-stage smoothing and the byte-to-scale calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingParams {
    /// Interpolation factor in `(0, 1]`; `1.0` snaps straight to the target.
    pub alpha: f32,
    /// Resting height. Strictly positive so bars never vanish.
    pub min_scale: f32,
    pub max_scale: f32,
    /// Divides the 0-255 magnitude before clamping.
    pub scale_divisor: f32,
}

impl SmoothingParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(VisualiserError::config(format!(
                "alpha {} must lie in (0, 1]",
                self.alpha
            )));
        }
        if !(self.min_scale > 0.0 && self.min_scale.is_finite()) {
            return Err(VisualiserError::config(format!(
                "min scale {} must be strictly positive",
                self.min_scale
            )));
        }
        if !(self.max_scale >= self.min_scale && self.max_scale.is_finite()) {
            return Err(VisualiserError::config(format!(
                "max scale {} must not be below min scale {}",
                self.max_scale, self.min_scale
            )));
        }
        if !(self.scale_divisor > 0.0 && self.scale_divisor.is_finite()) {
            return Err(VisualiserError::config(format!(
                "scale divisor {} must be strictly positive",
                self.scale_divisor
            )));
        }
        Ok(())
    }
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            alpha: 0.25,
            min_scale: 0.1,
            max_scale: 8.0,
            scale_divisor: 32.0,
        }
    }
}
