//! Audio analysis and frame synchronisation core for the Radial Visualiser.
//!
//! An audio source is decoded and played through a frequency-analysis tap. On
//! every display frame the current spectrum is sampled once, mapped onto a ring
//! of bars, smoothed, and written into a registry of visual elements owned by
//! the rendering layer. Each module owns one stage of that pipeline.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod mapping;
pub mod record;
pub mod render;
pub mod scene;
pub mod source;
pub mod timeline;
pub mod visualiser;

pub use analysis::{AnalysisTap, FrequencyFrame, SpectrumAnalyser};
pub use audio::{
    AnalysisGraph, AudioOutput, CpalBackend, ManualBackend, OutputBackend, PlaybackController,
    PlaybackPhase, PlaybackSession, PlaybackStream, StreamFormat,
};
pub use config::{AnalyserConfig, BarConfig, SmoothingParams, VisualiserConfig};
pub use error::{Result, VisualiserError};
pub use mapping::BandMapper;
pub use record::{FrameRecord, FrameRecorder, RecordingSettings, Trace};
pub use render::{BindReport, VisualBinder, VisualElement, VisualElementRegistry, VisualState};
pub use scene::{BarField, BarTransform, RadialLayout};
pub use source::{
    AudioBlob, AudioLoader, AudioSourceRef, DecodedAudio, HttpFetcher, SourceFetcher,
    SymphoniaLoader,
};
pub use timeline::{
    CallbackId, FrameCallback, FrameClock, FrameTick, ManualRenderLoop, PacedRenderLoop,
    RenderLoopHost, SamplePump,
};
pub use visualiser::{mount, FrameReport, Mount, Visualiser};
