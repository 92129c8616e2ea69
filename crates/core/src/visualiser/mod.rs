use std::{cell::RefCell, fmt, rc::Rc, sync::Arc};

use crate::{
    AudioLoader, AudioSourceRef, BandMapper, BindReport, CallbackId, CpalBackend, FrameTick,
    HttpFetcher, OutputBackend, PlaybackController, PlaybackPhase, RenderLoopHost, Result, SamplePump,
    SymphoniaLoader, VisualBinder, VisualElementRegistry, VisualiserConfig, VisualiserError,
};

/// What happened during one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub tick: u64,
    pub phase: PlaybackPhase,
    pub bind: BindReport,
    /// True when the frame carried no energy in any bin.
    pub silent: bool,
}

/// Audio-reactive bar driver: playback controls on one side, a per-frame
/// entry point for the render loop on the other.
pub struct Visualiser {
    config: VisualiserConfig,
    controller: PlaybackController,
    pump: SamplePump,
    binder: VisualBinder,
    last_load_error: Option<VisualiserError>,
    last_report: Option<FrameReport>,
    torn_down: bool,
}

impl Visualiser {
    /// Validates `config` and wires the pipeline. Nothing is loaded yet.
    pub fn new(
        config: VisualiserConfig,
        loader: Arc<dyn AudioLoader>,
        backend: Box<dyn OutputBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let mapper = BandMapper::new(
            config.smoothing,
            config.bars.count,
            config.analyser.bin_count(),
        )?;
        let controller = PlaybackController::new(loader, backend, config.analyser.clone())?;

        Ok(Self {
            pump: SamplePump::new(config.analyser.bin_count()),
            binder: VisualBinder::new(mapper),
            config,
            controller,
            last_load_error: None,
            last_report: None,
            torn_down: false,
        })
    }

    /// Decodes with symphonia and plays on the default output device.
    pub fn with_default_backend(config: VisualiserConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(SymphoniaLoader::new(HttpFetcher::new())),
            Box::new(CpalBackend),
        )
    }

    pub fn config(&self) -> &VisualiserConfig {
        &self.config
    }

    pub fn controller(&self) -> &PlaybackController {
        &self.controller
    }

    pub fn binder(&self) -> &VisualBinder {
        &self.binder
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.controller.phase()
    }

    pub fn is_playing(&self) -> bool {
        self.controller.is_playing()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Replaces the source and decodes it before returning. Lands in `Loaded`;
    /// never starts playback by itself.
    pub fn set_source(&mut self, source: AudioSourceRef) -> Result<()> {
        self.ensure_live()?;
        self.last_load_error = None;
        self.controller.load(source)
    }

    /// Replaces the source and decodes it in the background. Frames keep
    /// rendering at rest until the load lands.
    pub fn request_source(&mut self, source: AudioSourceRef) -> Result<()> {
        self.ensure_live()?;
        self.last_load_error = None;
        self.controller.request_load(source)
    }

    /// Error from the most recent background load, if it failed.
    pub fn take_load_error(&mut self) -> Option<VisualiserError> {
        self.last_load_error.take()
    }

    pub fn play(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.controller.play()
    }

    pub fn pause(&mut self) {
        self.controller.pause();
    }

    /// Samples the spectrum once, advances the smoothed bar heights and writes
    /// them into `registry`. Rendering the same tick again changes nothing and
    /// returns the earlier report.
    pub fn render_frame(
        &mut self,
        tick: FrameTick,
        registry: &mut dyn VisualElementRegistry,
    ) -> Result<FrameReport> {
        self.ensure_live()?;
        if let Some(report) = self.last_report.filter(|report| report.tick == tick.index) {
            return Ok(report);
        }

        if let Err(err) = self.controller.refresh() {
            if !err.is_load_failure() {
                return Err(err);
            }
            self.last_load_error = Some(err);
        }

        let frame = self.pump.tick(tick, self.controller.analyser_mut())?;
        let silent = frame.is_silent();
        let bind = self.binder.bind(frame, registry);

        let report = FrameReport {
            tick: tick.index,
            phase: self.controller.phase(),
            bind,
            silent,
        };
        self.last_report = Some(report);
        Ok(report)
    }

    /// Stops playback and releases the decoded audio and audio context. Later
    /// calls other than `pause` fail with an invalid-state error.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.controller.unload();
        self.binder.reset();
        self.last_report = None;
        self.torn_down = true;
        tracing::debug!("visualiser torn down");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            Err(VisualiserError::invalid_state("visualiser has been torn down"))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Visualiser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Visualiser")
            .field("config", &self.config)
            .field("controller", &self.controller)
            .field("frames", &self.pump.samples())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

/// A visualiser attached to a render loop.
#[derive(Debug)]
pub struct Mount {
    id: CallbackId,
    visualiser: Rc<RefCell<Visualiser>>,
}

/// Registers a frame callback on `host` that renders `visualiser` into
/// `registry` every frame.
pub fn mount<R>(
    host: &mut dyn RenderLoopHost,
    visualiser: Rc<RefCell<Visualiser>>,
    registry: Rc<RefCell<R>>,
) -> Mount
where
    R: VisualElementRegistry + 'static,
{
    let target = Rc::clone(&visualiser);
    let id = host.register_frame_callback(Box::new(move |tick| {
        let (Ok(mut visualiser), Ok(mut registry)) = (target.try_borrow_mut(), registry.try_borrow_mut())
        else {
            tracing::warn!(frame = tick.index, "visualiser or registry busy; frame skipped");
            return;
        };
        if let Err(err) = visualiser.render_frame(tick, &mut *registry) {
            tracing::warn!(frame = tick.index, %err, "frame skipped");
        }
    }));

    Mount { id, visualiser }
}

impl Mount {
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Unregisters the frame callback and tears the visualiser down.
    pub fn unmount(self, host: &mut dyn RenderLoopHost) {
        if !host.unregister_frame_callback(self.id) {
            tracing::warn!(id = ?self.id, "frame callback was already unregistered");
        }
        self.visualiser.borrow_mut().teardown();
    }
}
