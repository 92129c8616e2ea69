use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Sample,
};

use crate::{AnalysisTap, DecodedAudio, Result, VisualiserError};

/// Sample layout an output context is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub fn of(audio: &DecodedAudio) -> Self {
        Self {
            sample_rate: audio.sample_rate(),
            channels: audio.channels(),
        }
    }
}

/// Opens audio contexts. One context is acquired per loaded source and released
/// when the source changes or the visualiser is torn down.
pub trait OutputBackend {
    fn open(&self, format: StreamFormat) -> Result<Box<dyn AudioOutput>>;
}

/// A playback-capable audio context with a single output sink.
pub trait AudioOutput {
    /// Starts pulling audio from `stream`. Fails if a stream is already active
    /// or the context has been closed.
    fn start(&mut self, stream: PlaybackStream) -> Result<()>;
    /// Stops and drops the active stream, if any.
    fn stop(&mut self);
    /// Stops playback and releases the device. Further `start` calls fail.
    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

/// Cursor over decoded audio that feeds both the output sink and the analysis
/// tap. Moved onto the audio thread while a session is live.
pub struct PlaybackStream {
    audio: Arc<DecodedAudio>,
    /// Read position in source frames. Fractional while resampling.
    position: f64,
    /// Source frames advanced per output frame.
    step: f64,
    tap: AnalysisTap,
    finished: Arc<AtomicBool>,
    mono: Vec<f32>,
}

impl PlaybackStream {
    pub(crate) fn new(audio: Arc<DecodedAudio>, tap: AnalysisTap, finished: Arc<AtomicBool>) -> Self {
        Self {
            audio,
            position: 0.0,
            step: 1.0,
            tap,
            finished,
            mono: Vec::new(),
        }
    }

    /// Plays back at `sample_rate` instead of the source rate, interpolating
    /// linearly between source frames.
    pub fn set_output_rate(&mut self, sample_rate: u32) {
        if sample_rate > 0 {
            self.step = f64::from(self.audio.sample_rate()) / f64::from(sample_rate);
        }
    }

    /// Fills `out` with interleaved samples for `out_channels` channels and
    /// forwards the mono downmix to the analysis tap. Returns the number of
    /// output frames carrying audio; once the source runs out the remainder is
    /// silence and the stream reports itself finished.
    pub fn render(&mut self, out: &mut [f32], out_channels: usize) -> usize {
        let out_channels = out_channels.max(1);
        let source_channels = self.audio.channels() as usize;
        let total = self.audio.frames();
        let samples = self.audio.samples();

        self.mono.clear();
        let mut frames = 0;
        for output in out.chunks_exact_mut(out_channels) {
            if self.position >= total as f64 {
                break;
            }
            let index = self.position as usize;
            let next = (index + 1).min(total - 1);
            let frac = (self.position - index as f64) as f32;
            let current = &samples[index * source_channels..(index + 1) * source_channels];
            let following = &samples[next * source_channels..(next + 1) * source_channels];

            let mut sum = 0.0;
            for channel in 0..source_channels {
                let value = current[channel] * (1.0 - frac) + following[channel] * frac;
                sum += value;
                if channel < out_channels {
                    output[channel] = value;
                }
            }
            for slot in source_channels..out_channels {
                output[slot] = output[slot % source_channels];
            }
            self.mono.push(sum / source_channels as f32);

            self.position += self.step;
            frames += 1;
        }
        out[frames * out_channels..].fill(0.0);

        if let Err(err) = self.tap.push(&self.mono) {
            tracing::error!(%err, "dropping analysis samples");
        }

        if self.position >= total as f64 && !self.finished.swap(true, Ordering::AcqRel) {
            // Nothing flows after the last sample; the analyser reads silence.
            if let Err(err) = self.tap.disconnect() {
                tracing::error!(%err, "failed to disconnect analysis tap");
            }
        }
        frames
    }

    /// Source frames played so far.
    pub fn position_frames(&self) -> usize {
        (self.position as usize).min(self.audio.frames())
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl fmt::Debug for PlaybackStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackStream")
            .field("position", &self.position_frames())
            .field("frames", &self.audio.frames())
            .field("step", &self.step)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Plays through the default `cpal` output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl OutputBackend for CpalBackend {
    fn open(&self, format: StreamFormat) -> Result<Box<dyn AudioOutput>> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| VisualiserError::output("no audio output device found"))?;

        let supported = select_stream_config(&device, format)?;
        let sample_format = supported.sample_format();
        let config = supported.config();

        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            source_rate = format.sample_rate,
            source_channels = format.channels,
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            ?sample_format,
            "opened audio context"
        );

        Ok(Box::new(CpalOutput {
            device: Some(device),
            config,
            sample_format,
            stream: None,
        }))
    }
}

/// Picks a device configuration for `format`, falling back to the device
/// default when nothing supports the source rate.
fn select_stream_config(
    device: &cpal::Device,
    format: StreamFormat,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges = device
        .supported_output_configs()
        .map_err(|err| VisualiserError::output(format!("cannot query output configs: {err}")))?;

    if let Some(config) = best_config(ranges, format) {
        return Ok(config);
    }
    device
        .default_output_config()
        .map_err(|err| VisualiserError::output(format!("no usable output config: {err}")))
}

/// Among the ranges that include the source rate, prefers a matching channel
/// count, then `f32` samples, then at least as many channels as the source.
fn best_config(
    ranges: impl IntoIterator<Item = cpal::SupportedStreamConfigRange>,
    format: StreamFormat,
) -> Option<cpal::SupportedStreamConfig> {
    let rate = cpal::SampleRate(format.sample_rate);
    ranges
        .into_iter()
        .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
        .filter(|range| is_supported_format(range.sample_format()))
        .max_by_key(|range| {
            (
                range.channels() == format.channels,
                range.sample_format() == cpal::SampleFormat::F32,
                range.channels() >= format.channels,
            )
        })
        .map(|range| range.with_sample_rate(rate))
}

fn is_supported_format(format: cpal::SampleFormat) -> bool {
    matches!(
        format,
        cpal::SampleFormat::F32 | cpal::SampleFormat::I16 | cpal::SampleFormat::U16
    )
}

struct CpalOutput {
    device: Option<cpal::Device>,
    config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    stream: Option<cpal::Stream>,
}

impl AudioOutput for CpalOutput {
    fn start(&mut self, mut stream: PlaybackStream) -> Result<()> {
        if self.stream.is_some() {
            return Err(VisualiserError::invalid_state(
                "output sink already has an active stream",
            ));
        }
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| VisualiserError::invalid_state("audio context is closed"))?;

        stream.set_output_rate(self.config.sample_rate.0);
        let handle = match self.sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(device, &self.config, stream)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(device, &self.config, stream)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(device, &self.config, stream)?,
            other => {
                return Err(VisualiserError::output(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        };
        handle
            .play()
            .map_err(|err| VisualiserError::output(format!("failed to start stream: {err}")))?;

        self.stream = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stream = None;
    }

    fn close(&mut self) {
        self.stop();
        if self.device.take().is_some() {
            tracing::info!("closed audio context");
        }
    }

    fn is_closed(&self) -> bool {
        self.device.is_none()
    }
}

/// Builds an output stream in the device's sample type. Audio is rendered as
/// `f32` and converted per sample.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut stream: PlaybackStream,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                stream.render(&mut scratch, channels);
                for (dst, src) in data.iter_mut().zip(&scratch) {
                    *dst = T::from_sample(*src);
                }
            },
            |err| tracing::error!(%err, "audio stream error"),
            None,
        )
        .map_err(|err| VisualiserError::output(format!("failed to build stream: {err}")))
}

/// Output that only advances when told to. Used for headless rendering and
/// tests; one output at a time can hold a stream.
#[derive(Clone, Default)]
pub struct ManualBackend {
    shared: Arc<Mutex<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    stream: Option<PlaybackStream>,
    channels: usize,
    contexts_opened: usize,
    open_contexts: usize,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulls `frames` sample frames through the active stream, discarding the
    /// output. Returns the number of source frames consumed.
    pub fn render(&self, frames: usize) -> Result<usize> {
        let mut state = self.lock()?;
        let channels = state.channels.max(1);
        match state.stream.as_mut() {
            Some(stream) => {
                let mut buffer = vec![0.0; frames * channels];
                Ok(stream.render(&mut buffer, channels))
            }
            None => Ok(0),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().map(|state| state.stream.is_some()).unwrap_or(false)
    }

    /// Number of contexts ever opened through this backend.
    pub fn contexts_opened(&self) -> usize {
        self.lock().map(|state| state.contexts_opened).unwrap_or(0)
    }

    /// Number of contexts opened and not yet closed.
    pub fn open_contexts(&self) -> usize {
        self.lock().map(|state| state.open_contexts).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManualState>> {
        lock_state(&self.shared)
    }
}

impl OutputBackend for ManualBackend {
    fn open(&self, format: StreamFormat) -> Result<Box<dyn AudioOutput>> {
        let mut state = self.lock()?;
        state.contexts_opened += 1;
        state.open_contexts += 1;
        state.channels = format.channels as usize;

        Ok(Box::new(ManualOutput {
            shared: self.shared.clone(),
            closed: false,
        }))
    }
}

impl fmt::Debug for ManualBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualBackend")
            .field("streaming", &self.is_streaming())
            .field("open_contexts", &self.open_contexts())
            .finish()
    }
}

struct ManualOutput {
    shared: Arc<Mutex<ManualState>>,
    closed: bool,
}

impl AudioOutput for ManualOutput {
    fn start(&mut self, stream: PlaybackStream) -> Result<()> {
        if self.closed {
            return Err(VisualiserError::invalid_state("audio context is closed"));
        }
        let mut state = lock_state(&self.shared)?;
        if state.stream.is_some() {
            return Err(VisualiserError::invalid_state(
                "output sink already has an active stream",
            ));
        }
        state.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut state) = lock_state(&self.shared) {
            state.stream = None;
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop();
        if let Ok(mut state) = lock_state(&self.shared) {
            state.open_contexts = state.open_contexts.saturating_sub(1);
        }
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ManualOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_state(shared: &Mutex<ManualState>) -> Result<MutexGuard<'_, ManualState>> {
    shared
        .lock()
        .map_err(|_| VisualiserError::invalid_state("manual output has been poisoned"))
}
