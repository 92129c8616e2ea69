mod output;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, TryRecvError},
        Arc,
    },
    thread,
};

pub use output::{AudioOutput, CpalBackend, ManualBackend, OutputBackend, PlaybackStream, StreamFormat};

use crate::{
    AnalyserConfig, AudioLoader, AudioSourceRef, DecodedAudio, Result, SpectrumAnalyser,
    VisualiserError,
};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackPhase {
    /// No decoded audio.
    Idle,
    /// Audio decoded and analysis graph built; nothing playing.
    Loaded,
    /// Exactly one session is feeding the analysis graph.
    Playing,
    /// Session stopped. Playing again restarts from the beginning.
    Paused,
}

/// Frequency-analysis node for one source. Lives across play/pause cycles and
/// is rebuilt only when the source changes.
#[derive(Debug)]
pub struct AnalysisGraph {
    analyser: SpectrumAnalyser,
}

impl AnalysisGraph {
    pub fn new(config: &AnalyserConfig) -> Result<Self> {
        Ok(Self {
            analyser: SpectrumAnalyser::with_config(config.clone())?,
        })
    }

    pub fn analyser_mut(&mut self) -> &mut SpectrumAnalyser {
        &mut self.analyser
    }

    fn open_session(&self, id: u64, audio: Arc<DecodedAudio>) -> Result<(PlaybackSession, PlaybackStream)> {
        let tap = self.analyser.tap().clone();
        tap.connect()?;
        let finished = Arc::new(AtomicBool::new(false));
        let stream = PlaybackStream::new(audio, tap, finished.clone());
        Ok((PlaybackSession { id, finished }, stream))
    }

    fn disconnect(&self) {
        if let Err(err) = self.analyser.tap().disconnect() {
            tracing::error!(%err, "failed to disconnect analysis tap");
        }
    }
}

/// One live run of the decoded audio through the analysis graph.
#[derive(Debug)]
pub struct PlaybackSession {
    id: u64,
    finished: Arc<AtomicBool>,
}

impl PlaybackSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once the stream has played past the last sample.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

struct LoadedSource {
    source: AudioSourceRef,
    audio: Arc<DecodedAudio>,
    graph: AnalysisGraph,
    context: Box<dyn AudioOutput>,
}

struct PendingLoad {
    source: AudioSourceRef,
    receiver: Receiver<Result<DecodedAudio>>,
}

/// Playback state machine. Owns the decoded audio, the analysis graph and the
/// audio context for the current source, and at most one session.
pub struct PlaybackController {
    loader: Arc<dyn AudioLoader>,
    backend: Box<dyn OutputBackend>,
    analyser_config: AnalyserConfig,
    phase: PlaybackPhase,
    loaded: Option<LoadedSource>,
    session: Option<PlaybackSession>,
    pending: Option<PendingLoad>,
    sessions_started: u64,
}

impl PlaybackController {
    pub fn new(
        loader: Arc<dyn AudioLoader>,
        backend: Box<dyn OutputBackend>,
        analyser_config: AnalyserConfig,
    ) -> Result<Self> {
        analyser_config.validate()?;
        Ok(Self {
            loader,
            backend,
            analyser_config,
            phase: PlaybackPhase::Idle,
            loaded: None,
            session: None,
            pending: None,
            sessions_started: 0,
        })
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn is_playing(&self) -> bool {
        self.phase == PlaybackPhase::Playing
    }

    /// True while a background load has been requested but not collected.
    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn source(&self) -> Option<&AudioSourceRef> {
        self.loaded.as_ref().map(|loaded| &loaded.source)
    }

    pub fn decoded(&self) -> Option<&DecodedAudio> {
        self.loaded.as_ref().map(|loaded| loaded.audio.as_ref())
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started
    }

    /// Analyser for the current source; `None` while idle.
    pub fn analyser_mut(&mut self) -> Option<&mut SpectrumAnalyser> {
        self.loaded
            .as_mut()
            .map(|loaded| loaded.graph.analyser_mut())
    }

    /// Tears down whatever is loaded and decodes `source` on the calling
    /// thread. Lands in `Loaded` on success and `Idle` on failure.
    pub fn load(&mut self, source: AudioSourceRef) -> Result<()> {
        self.unload();
        tracing::info!(%source, "loading audio source");

        let audio = self.loader.load(&source).map_err(|err| {
            tracing::warn!(%source, %err, "audio source failed to load");
            err
        })?;
        self.install(source, audio)
    }

    /// Tears down whatever is loaded and decodes `source` on a worker thread.
    /// The controller stays `Idle` until [`Self::refresh`] collects the result.
    pub fn request_load(&mut self, source: AudioSourceRef) -> Result<()> {
        self.unload();
        tracing::info!(%source, "loading audio source in the background");

        let (sender, receiver) = mpsc::channel();
        let loader = Arc::clone(&self.loader);
        let job_source = source.clone();
        thread::Builder::new()
            .name("audio-loader".to_string())
            .spawn(move || {
                // The receiver is gone if the request was superseded.
                let _ = sender.send(loader.load(&job_source));
            })?;

        self.pending = Some(PendingLoad { source, receiver });
        Ok(())
    }

    /// Per-frame housekeeping: collects a finished background load and ends a
    /// session that has played to the end of its buffer.
    pub fn refresh(&mut self) -> Result<()> {
        let finished = self
            .session
            .as_ref()
            .map(PlaybackSession::is_finished)
            .unwrap_or(false);
        if finished {
            tracing::debug!("playback reached the end of the source");
            self.stop_session();
            self.set_phase(PlaybackPhase::Paused);
        }

        self.collect_pending()
    }

    /// Starts a fresh session from the beginning. A no-op while already
    /// playing; an error before a source has loaded.
    pub fn play(&mut self) -> Result<()> {
        match self.phase {
            PlaybackPhase::Playing => return Ok(()),
            PlaybackPhase::Idle => {
                return Err(VisualiserError::invalid_state(
                    "play() requires a loaded audio source",
                ))
            }
            PlaybackPhase::Loaded | PlaybackPhase::Paused => {}
        }

        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| VisualiserError::invalid_state("no decoded audio for this phase"))?;

        let id = self.sessions_started + 1;
        let (session, stream) = loaded.graph.open_session(id, Arc::clone(&loaded.audio))?;
        if let Err(err) = loaded.context.start(stream) {
            loaded.graph.disconnect();
            return Err(err);
        }

        self.sessions_started = id;
        self.session = Some(session);
        self.set_phase(PlaybackPhase::Playing);
        Ok(())
    }

    /// Stops the live session. Does nothing unless playing.
    pub fn pause(&mut self) {
        if self.phase != PlaybackPhase::Playing {
            return;
        }
        self.stop_session();
        self.set_phase(PlaybackPhase::Paused);
    }

    /// Stops playback, drops the analysis graph and decoded audio, closes the
    /// audio context and abandons any pending load. Safe to call repeatedly.
    pub fn unload(&mut self) {
        self.stop_session();
        if let Some(mut loaded) = self.loaded.take() {
            loaded.context.close();
            tracing::debug!(source = %loaded.source, "released audio source");
        }
        if let Some(pending) = self.pending.take() {
            tracing::debug!(source = %pending.source, "abandoned pending load");
        }
        self.set_phase(PlaybackPhase::Idle);
    }

    fn install(&mut self, source: AudioSourceRef, audio: DecodedAudio) -> Result<()> {
        let graph = AnalysisGraph::new(&self.analyser_config)?;
        let context = self.backend.open(output::StreamFormat::of(&audio))?;

        self.loaded = Some(LoadedSource {
            source,
            audio: Arc::new(audio),
            graph,
            context,
        });
        self.set_phase(PlaybackPhase::Loaded);
        Ok(())
    }

    fn collect_pending(&mut self) -> Result<()> {
        let Some(pending) = self.pending.as_ref() else {
            return Ok(());
        };

        let result = match pending.receiver.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => Err(VisualiserError::invalid_state(
                "audio loader exited without a result",
            )),
        };

        let Some(PendingLoad { source, .. }) = self.pending.take() else {
            return Ok(());
        };
        match result {
            Ok(audio) => self.install(source, audio),
            Err(err) => {
                tracing::warn!(%source, %err, "audio source failed to load");
                Err(err)
            }
        }
    }

    fn stop_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Some(loaded) = self.loaded.as_mut() {
            loaded.context.stop();
            loaded.graph.disconnect();
        }
        tracing::debug!(session = session.id(), "stopped playback session");
    }

    fn set_phase(&mut self, next: PlaybackPhase) {
        if self.phase != next {
            tracing::debug!(from = ?self.phase, to = ?next, "playback phase changed");
            self.phase = next;
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.unload();
    }
}

impl fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackController")
            .field("phase", &self.phase)
            .field("source", &self.source())
            .field("session", &self.session)
            .field("loading", &self.is_loading())
            .field("sessions_started", &self.sessions_started)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    use super::*;

    /// Loader that produces a fixed buffer per source and counts calls.
    #[derive(Default)]
    pub(crate) struct CountingLoader {
        pub(crate) calls: AtomicUsize,
    }

    impl CountingLoader {
        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AudioLoader for CountingLoader {
        fn load(&self, source: &AudioSourceRef) -> Result<DecodedAudio> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match source {
                AudioSourceRef::Url(url) if url.contains("missing") => {
                    Err(VisualiserError::fetch(format!("{url}: not found")))
                }
                AudioSourceRef::Url(url) if url.contains("garbage") => {
                    Err(VisualiserError::decode("not audio"))
                }
                _ => DecodedAudio::new(vec![0.5; 8_000], 8_000, 1),
            }
        }
    }

    fn controller() -> (PlaybackController, Arc<CountingLoader>, ManualBackend) {
        let loader = Arc::new(CountingLoader::default());
        let backend = ManualBackend::new();
        let controller = PlaybackController::new(
            loader.clone(),
            Box::new(backend.clone()),
            AnalyserConfig::default(),
        )
        .unwrap();
        (controller, loader, backend)
    }

    #[test]
    fn play_before_load_is_an_invalid_state() {
        let (mut controller, _, _) = controller();
        let err = controller.play().unwrap_err();
        assert!(matches!(err, VisualiserError::InvalidState(_)));
        assert_eq!(controller.phase(), PlaybackPhase::Idle);
    }

    #[test]
    fn play_twice_keeps_a_single_session() {
        let (mut controller, _, backend) = controller();
        controller.load(AudioSourceRef::url("a.wav")).unwrap();

        controller.play().unwrap();
        controller.play().unwrap();

        assert!(controller.is_playing());
        assert_eq!(controller.sessions_started(), 1);
        assert!(backend.is_streaming());
    }

    #[test]
    fn pause_is_a_no_op_outside_playing() {
        let (mut controller, _, _) = controller();
        controller.pause();
        assert_eq!(controller.phase(), PlaybackPhase::Idle);

        controller.load(AudioSourceRef::url("a.wav")).unwrap();
        controller.pause();
        assert_eq!(controller.phase(), PlaybackPhase::Loaded);

        controller.play().unwrap();
        controller.pause();
        controller.pause();
        assert_eq!(controller.phase(), PlaybackPhase::Paused);
    }

    #[test]
    fn play_after_pause_restarts_from_the_beginning() {
        let (mut controller, _, backend) = controller();
        controller.load(AudioSourceRef::url("a.wav")).unwrap();
        controller.play().unwrap();
        assert_eq!(backend.render(6_000).unwrap(), 6_000);

        controller.pause();
        assert!(!backend.is_streaming());
        controller.play().unwrap();

        assert_eq!(controller.sessions_started(), 2);
        assert_eq!(controller.session().unwrap().id(), 2);
        assert_eq!(backend.render(8_000).unwrap(), 8_000);
    }

    #[test]
    fn load_failures_leave_the_controller_idle() {
        let (mut controller, _, backend) = controller();

        let err = controller.load(AudioSourceRef::url("missing.mp3")).unwrap_err();
        assert!(matches!(err, VisualiserError::Fetch(_)));
        assert_eq!(controller.phase(), PlaybackPhase::Idle);

        let err = controller.load(AudioSourceRef::url("garbage.mp3")).unwrap_err();
        assert!(matches!(err, VisualiserError::Decode(_)));
        assert_eq!(backend.contexts_opened(), 0);

        controller.load(AudioSourceRef::url("fixed.mp3")).unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Loaded);
    }

    #[test]
    fn changing_source_while_playing_stops_and_reloads() {
        let (mut controller, loader, backend) = controller();
        controller.load(AudioSourceRef::url("a.wav")).unwrap();
        controller.play().unwrap();

        controller.load(AudioSourceRef::url("b.wav")).unwrap();

        assert_eq!(controller.phase(), PlaybackPhase::Loaded);
        assert_eq!(controller.source(), Some(&AudioSourceRef::url("b.wav")));
        assert!(!backend.is_streaming());
        assert_eq!(backend.open_contexts(), 1);
        assert_eq!(backend.contexts_opened(), 2);
        assert_eq!(loader.calls(), 2);
    }

    #[test]
    fn switching_back_reloads_the_first_source() {
        let (mut controller, loader, _) = controller();
        for url in ["a.wav", "b.wav", "a.wav"] {
            controller.load(AudioSourceRef::url(url)).unwrap();
        }
        assert_eq!(loader.calls(), 3);
    }

    #[test]
    fn session_end_transitions_to_paused() {
        let (mut controller, _, backend) = controller();
        controller.load(AudioSourceRef::url("a.wav")).unwrap();
        controller.play().unwrap();

        backend.render(10_000).unwrap();
        controller.refresh().unwrap();

        assert_eq!(controller.phase(), PlaybackPhase::Paused);
        assert!(controller.session().is_none());
    }

    #[test]
    fn background_load_stays_idle_until_collected() {
        let (mut controller, _, _) = controller();
        controller.request_load(AudioSourceRef::url("a.wav")).unwrap();
        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        assert!(controller.is_loading());
        assert!(controller.play().is_err());

        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.is_loading() && Instant::now() < deadline {
            controller.refresh().unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(controller.phase(), PlaybackPhase::Loaded);
        controller.play().unwrap();
    }

    #[test]
    fn unload_closes_the_context() {
        let (mut controller, _, backend) = controller();
        controller.load(AudioSourceRef::url("a.wav")).unwrap();
        controller.play().unwrap();

        controller.unload();
        controller.unload();

        assert_eq!(controller.phase(), PlaybackPhase::Idle);
        assert_eq!(backend.open_contexts(), 0);
        assert!(controller.analyser_mut().is_none());
    }
}
