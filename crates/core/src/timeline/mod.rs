use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use crate::{FrequencyFrame, Result, SpectrumAnalyser, VisualiserError};

/// Handle returned when a frame callback is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// The implicit "now" a host hands to frame callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    pub index: u64,
    pub elapsed: Duration,
}

pub type FrameCallback = Box<dyn FnMut(FrameTick)>;

/// Display-synchronised loop that calls registered callbacks once per frame
/// until they are unregistered.
pub trait RenderLoopHost {
    fn register_frame_callback(&mut self, callback: FrameCallback) -> CallbackId;
    /// Returns `false` if `id` was not registered.
    fn unregister_frame_callback(&mut self, id: CallbackId) -> bool;
}

/// Monotonic time since the loop started.
#[derive(Debug, Default, Clone)]
pub struct FrameClock {
    elapsed: Duration,
}

impl FrameClock {
    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }

    pub fn advance(&mut self, delta: Duration) {
        self.elapsed += delta;
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Render loop that only advances when [`ManualRenderLoop::run_frame`] is
/// called. Callbacks run to completion, in registration order, before the
/// call returns.
#[derive(Default)]
pub struct ManualRenderLoop {
    callbacks: Vec<(CallbackId, FrameCallback)>,
    next_id: u64,
    frames: u64,
    clock: FrameClock,
}

impl ManualRenderLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `delta` and fires every callback once. Returns the
    /// number of callbacks invoked.
    pub fn run_frame(&mut self, delta: Duration) -> usize {
        self.clock.advance(delta);
        let tick = FrameTick {
            index: self.frames,
            elapsed: self.clock.elapsed(),
        };
        self.frames += 1;

        for (_, callback) in &mut self.callbacks {
            callback(tick);
        }
        self.callbacks.len()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    pub fn frames_run(&self) -> u64 {
        self.frames
    }
}

impl RenderLoopHost for ManualRenderLoop {
    fn register_frame_callback(&mut self, callback: FrameCallback) -> CallbackId {
        self.next_id += 1;
        let id = CallbackId(self.next_id);
        self.callbacks.push((id, callback));
        id
    }

    fn unregister_frame_callback(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(registered, _)| *registered != id);
        self.callbacks.len() != before
    }
}

impl fmt::Debug for ManualRenderLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualRenderLoop")
            .field("callbacks", &self.callbacks.len())
            .field("frames", &self.frames)
            .field("clock", &self.clock)
            .finish()
    }
}

/// Render loop paced to a fixed frame rate by sleeping between frames.
#[derive(Debug)]
pub struct PacedRenderLoop {
    inner: ManualRenderLoop,
    interval: Duration,
}

impl PacedRenderLoop {
    pub fn new(fps: u32) -> Result<Self> {
        if fps == 0 {
            return Err(VisualiserError::config("frame rate must be positive"));
        }
        Ok(Self {
            inner: ManualRenderLoop::new(),
            interval: Duration::from_secs(1) / fps,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `frames` frames, or until no callback is registered.
    pub fn run(&mut self, frames: u64) {
        for _ in 0..frames {
            let started = Instant::now();
            if self.inner.run_frame(self.interval) == 0 {
                break;
            }
            if let Some(remaining) = self.interval.checked_sub(started.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }

    pub fn pending_callbacks(&self) -> usize {
        self.inner.pending_callbacks()
    }
}

impl RenderLoopHost for PacedRenderLoop {
    fn register_frame_callback(&mut self, callback: FrameCallback) -> CallbackId {
        self.inner.register_frame_callback(callback)
    }

    fn unregister_frame_callback(&mut self, id: CallbackId) -> bool {
        self.inner.unregister_frame_callback(id)
    }
}

/// Pulls one spectrum per displayed frame and holds it as the current frame.
#[derive(Debug, Clone)]
pub struct SamplePump {
    current: FrequencyFrame,
    last_tick: Option<u64>,
    samples: u64,
}

impl SamplePump {
    pub fn new(bin_count: usize) -> Self {
        Self {
            current: FrequencyFrame::zeroed(bin_count),
            last_tick: None,
            samples: 0,
        }
    }

    /// Samples `analyser` once for `tick` and publishes the result. A second
    /// call for the same tick returns the frame already published. Without an
    /// analyser the published frame is silence.
    pub fn tick(
        &mut self,
        tick: FrameTick,
        analyser: Option<&mut SpectrumAnalyser>,
    ) -> Result<&FrequencyFrame> {
        if self.last_tick == Some(tick.index) {
            return Ok(&self.current);
        }

        let bins = self.current.len();
        self.current = match analyser {
            Some(analyser) => analyser.sample()?,
            None => FrequencyFrame::zeroed(bins),
        };
        self.last_tick = Some(tick.index);
        self.samples += 1;
        Ok(&self.current)
    }

    pub fn current(&self) -> &FrequencyFrame {
        &self.current
    }

    /// Number of frames published so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}
