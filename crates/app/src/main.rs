use std::{cell::RefCell, path::PathBuf, rc::Rc, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use radial_visualiser_core::{
    mount, AudioBlob, AudioSourceRef, BarField, FrameRecorder, HttpFetcher, ManualBackend,
    ManualRenderLoop, PacedRenderLoop, PlaybackPhase, RadialLayout, RecordingSettings,
    RenderLoopHost, SymphoniaLoader, Visualiser, VisualiserConfig,
};
use tracing_subscriber::EnvFilter;

fn main() -> radial_visualiser_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play { input, frames } => run_play(&input, frames),
        Commands::Trace {
            input,
            output,
            frames,
        } => run_trace(&input, output, frames),
    }
}

fn run_play(input: &InputArgs, frames: Option<u64>) -> radial_visualiser_core::Result<()> {
    let config = input.config()?;
    let source = input.source()?;
    tracing::info!(%source, fps = input.fps, "starting playback");

    let mut visualiser = Visualiser::with_default_backend(config.clone())?;
    visualiser.set_source(source)?;
    let frames = frames.unwrap_or_else(|| frames_for(&visualiser, input.fps));
    visualiser.play()?;

    let visualiser = Rc::new(RefCell::new(visualiser));
    let field = Rc::new(RefCell::new(BarField::build(&RadialLayout::from(&config.bars))));
    let mut host = PacedRenderLoop::new(input.fps)?;
    let mounted = mount(&mut host, visualiser.clone(), field.clone());

    let fps = u64::from(input.fps);
    let meter = field.clone();
    let logger = host.register_frame_callback(Box::new(move |tick| {
        if tick.index % fps == 0 {
            let heights = meter.borrow().heights();
            let peak = heights.iter().copied().fold(0.0_f32, f32::max);
            let mean = heights.iter().sum::<f32>() / heights.len().max(1) as f32;
            tracing::info!(frame = tick.index, peak, mean, "bar heights");
        }
    }));

    host.run(frames);

    host.unregister_frame_callback(logger);
    mounted.unmount(&mut host);
    Ok(())
}

fn run_trace(
    input: &InputArgs,
    output: PathBuf,
    frames: Option<u64>,
) -> radial_visualiser_core::Result<()> {
    let config = input.config()?;
    let source = input.source()?;
    tracing::info!(%source, ?output, "tracing bar heights");

    let backend = ManualBackend::new();
    let mut visualiser = Visualiser::new(
        config.clone(),
        Arc::new(SymphoniaLoader::new(HttpFetcher::new())),
        Box::new(backend.clone()),
    )?;
    visualiser.set_source(source)?;
    let sample_rate = visualiser
        .controller()
        .decoded()
        .map(|audio| audio.sample_rate())
        .unwrap_or(48_000);
    let frames = frames.unwrap_or_else(|| frames_for(&visualiser, input.fps));
    visualiser.play()?;

    let visualiser = Rc::new(RefCell::new(visualiser));
    let field = Rc::new(RefCell::new(BarField::build(&RadialLayout::from(&config.bars))));
    let recorder = Rc::new(RefCell::new(FrameRecorder::new(
        RecordingSettings {
            output_path: output,
            fps: input.fps,
        },
        config.bars.count,
    )));

    let mut host = ManualRenderLoop::new();
    let mounted = mount(&mut host, visualiser.clone(), field.clone());
    let sink = recorder.clone();
    let meter = field.clone();
    let capture = host.register_frame_callback(Box::new(move |tick| {
        if let Err(err) = sink.borrow_mut().record(tick, &meter.borrow().heights()) {
            tracing::warn!(%err, "frame not recorded");
        }
    }));

    recorder.borrow_mut().start();
    let interval = Duration::from_secs(1) / input.fps;
    let samples_per_frame = f64::from(sample_rate) / f64::from(input.fps);
    let mut rendered = 0.0_f64;
    let mut finished = false;
    for frame in 0..frames {
        let target = samples_per_frame * (frame + 1) as f64;
        let due = (target - rendered).round().max(0.0) as usize;
        backend.render(due)?;
        rendered += due as f64;
        host.run_frame(interval);

        if !finished && visualiser.borrow().phase() == PlaybackPhase::Paused {
            tracing::info!(frame, "source finished; bars decaying");
            finished = true;
        }
    }
    recorder.borrow_mut().stop();

    host.unregister_frame_callback(capture);
    mounted.unmount(&mut host);
    let recorder = recorder.borrow();
    recorder.write()
}

/// Enough frames to play the whole source plus one second of decay.
fn frames_for(visualiser: &Visualiser, fps: u32) -> u64 {
    let seconds = visualiser
        .controller()
        .decoded()
        .map(|audio| audio.duration_seconds())
        .unwrap_or(0.0);
    ((seconds + 1.0) * fps as f32).ceil() as u64
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive radial bar visualiser", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play an audio source on the default output device and log bar heights.
    Play {
        #[command(flatten)]
        input: InputArgs,
        /// Number of frames to run. Defaults to the source length plus one second.
        #[arg(long)]
        frames: Option<u64>,
    },
    /// Render bar heights headlessly and write them to a JSON trace.
    Trace {
        #[command(flatten)]
        input: InputArgs,
        /// Output path for the generated trace.
        #[arg(short, long)]
        output: PathBuf,
        /// Number of frames to render. Defaults to the source length plus one second.
        #[arg(long)]
        frames: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Audio file path or http(s) URL.
    source: String,
    /// Read the file into memory first and load it as a blob.
    #[arg(long)]
    blob: bool,
    /// Optional JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Display frame rate.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..=1000))]
    fps: u32,
}

impl InputArgs {
    fn config(&self) -> radial_visualiser_core::Result<VisualiserConfig> {
        match &self.config {
            Some(path) => VisualiserConfig::from_path(path),
            None => Ok(VisualiserConfig::default()),
        }
    }

    fn source(&self) -> radial_visualiser_core::Result<AudioSourceRef> {
        if !self.blob {
            return Ok(AudioSourceRef::url(self.source.clone()));
        }
        let bytes = std::fs::read(&self.source)?;
        Ok(AudioSourceRef::Blob(
            AudioBlob::new(bytes).with_name(self.source.clone()),
        ))
    }
}
