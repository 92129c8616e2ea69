use std::{fmt, io::Cursor, io::Read, path::Path, sync::Arc};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSource, MediaSourceStream},
    meta::MetadataOptions,
    probe::Hint,
};

use crate::{Result, VisualiserError};

/// Upper bound on how much we are willing to pull over HTTP for one source.
const MAX_FETCH_BYTES: u64 = 512 * 1024 * 1024;

/// Where the audio comes from. Changing it rebuilds the whole playback and
/// analysis chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSourceRef {
    /// `http(s)://` and `file://` URLs, or a plain filesystem path.
    Url(String),
    /// Bytes the caller already holds, e.g. from a file picker.
    Blob(AudioBlob),
}

impl AudioSourceRef {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }

    pub fn blob(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Blob(AudioBlob::new(bytes))
    }

    /// File extension used as a probe hint, if one can be inferred.
    pub fn extension_hint(&self) -> Option<String> {
        let name = match self {
            Self::Url(url) => url.split(['?', '#']).next().unwrap_or(url),
            Self::Blob(blob) => blob.name.as_deref()?,
        };
        Path::new(name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }
}

impl fmt::Display for AudioSourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Blob(blob) => match &blob.name {
                Some(name) => write!(f, "blob:{name} ({} bytes)", blob.len()),
                None => write!(f, "blob ({} bytes)", blob.len()),
            },
        }
    }
}

/// Opaque in-memory audio file. Cloning shares the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioBlob {
    bytes: Arc<[u8]>,
    name: Option<String>,
}

impl AudioBlob {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            name: None,
        }
    }

    /// Attaches the original file name so its extension can guide probing.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for AudioBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBlob")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Fully decoded PCM audio, interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 {
            return Err(VisualiserError::decode("sample rate must be non-zero"));
        }
        if channels == 0 {
            return Err(VisualiserError::decode("audio must have at least one channel"));
        }
        if samples.len() % channels as usize != 0 {
            return Err(VisualiserError::decode(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_seconds(&self) -> f32 {
        self.frames() as f32 / self.sample_rate as f32
    }
}

/// Turns an [`AudioSourceRef`] into decoded audio. Implementations run on a
/// worker thread when loading in the background.
pub trait AudioLoader: Send + Sync {
    fn load(&self, source: &AudioSourceRef) -> Result<DecodedAudio>;
}

/// Resolves a URL or path to raw bytes.
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Default fetcher: HTTP(S) through `ureq`, everything else from disk.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
        }
    }

    fn fetch_http(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.agent.get(url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                VisualiserError::fetch(format!("{url} responded with HTTP {code}"))
            }
            ureq::Error::Transport(transport) => {
                VisualiserError::fetch(format!("{url}: {transport}"))
            }
        })?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_FETCH_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| VisualiserError::fetch(format!("{url}: {err}")))?;
        Ok(bytes)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.fetch_http(url);
        }

        let path = url.strip_prefix("file://").unwrap_or(url);
        std::fs::read(path).map_err(|err| VisualiserError::fetch(format!("{path}: {err}")))
    }
}

/// Loader that fetches bytes and decodes them with symphonia.
#[derive(Debug, Clone, Default)]
pub struct SymphoniaLoader<F = HttpFetcher> {
    fetcher: F,
}

impl<F: SourceFetcher> SymphoniaLoader<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

impl<F: SourceFetcher> AudioLoader for SymphoniaLoader<F> {
    fn load(&self, source: &AudioSourceRef) -> Result<DecodedAudio> {
        let hint = source.extension_hint();
        let audio = match source {
            AudioSourceRef::Url(url) => {
                let bytes = self.fetcher.fetch(url)?;
                decode(Cursor::new(bytes), hint.as_deref())?
            }
            AudioSourceRef::Blob(blob) => {
                decode(Cursor::new(blob.bytes.clone()), hint.as_deref())?
            }
        };

        tracing::info!(
            %source,
            sample_rate = audio.sample_rate(),
            channels = audio.channels(),
            duration = audio.duration_seconds(),
            "decoded audio source"
        );
        Ok(audio)
    }
}

/// Decodes the default track of an in-memory media file into interleaved
/// `f32` samples.
pub fn decode<S: MediaSource + 'static>(source: S, extension: Option<&str>) -> Result<DecodedAudio> {
    let stream = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| VisualiserError::decode("no audio track found"))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut channels = track.codec_params.channels.map(|c| c.count() as u16);

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    let mut buffer: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(err.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                tracing::warn!(reason, "skipping undecodable packet");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let spec = *decoded.spec();
        sample_rate.get_or_insert(spec.rate);
        channels.get_or_insert(spec.channels.count() as u16);

        let needs_alloc = buffer
            .as_ref()
            .map(|buf| buf.capacity() < decoded.capacity() * spec.channels.count())
            .unwrap_or(true);
        if needs_alloc {
            buffer = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = buffer.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    if samples.is_empty() {
        return Err(VisualiserError::decode("source contains no audio samples"));
    }

    let sample_rate = sample_rate.ok_or_else(|| VisualiserError::decode("unknown sample rate"))?;
    let channels = channels.ok_or_else(|| VisualiserError::decode("unknown channel layout"))?;
    DecodedAudio::new(samples, sample_rate, channels)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Writes a 16-bit mono WAV file holding a sine tone.
    pub(crate) fn sine_wav(sample_rate: u32, frequency: f32, seconds: f32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let total = (sample_rate as f32 * seconds) as usize;
            for n in 0..total {
                let t = n as f32 / sample_rate as f32;
                let value = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.8;
                writer.write_sample((value * i16::MAX as f32) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    struct StaticFetcher(Vec<u8>);

    impl SourceFetcher for StaticFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn decodes_wav_blob() {
        let wav = sine_wav(8_000, 440.0, 0.5);
        let source = AudioSourceRef::Blob(AudioBlob::new(wav).with_name("tone.wav"));

        let audio = SymphoniaLoader::new(HttpFetcher::new()).load(&source).unwrap();

        assert_eq!(audio.sample_rate(), 8_000);
        assert_eq!(audio.channels(), 1);
        assert_eq!(audio.frames(), 4_000);
        let peak = audio.samples().iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
        assert!((peak - 0.8).abs() < 0.01, "peak was {peak}");
    }

    #[test]
    fn decodes_fetched_url() {
        let loader = SymphoniaLoader::new(StaticFetcher(sine_wav(16_000, 220.0, 0.25)));
        let audio = loader
            .load(&AudioSourceRef::url("https://example.invalid/tone.wav"))
            .unwrap();
        assert_eq!(audio.frames(), 4_000);
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let source = AudioSourceRef::blob(vec![0x42_u8; 512]);
        let err = SymphoniaLoader::new(HttpFetcher::new())
            .load(&source)
            .unwrap_err();
        assert!(matches!(err, VisualiserError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn missing_file_is_a_fetch_error() {
        let source = AudioSourceRef::url("file:///definitely/not/here.mp3");
        let err = SymphoniaLoader::new(HttpFetcher::new())
            .load(&source)
            .unwrap_err();
        assert!(matches!(err, VisualiserError::Fetch(_)), "got {err:?}");
    }

    #[test]
    fn extension_hint_ignores_query_strings() {
        let source = AudioSourceRef::url("https://cdn.example/track.MP3?token=abc");
        assert_eq!(source.extension_hint().as_deref(), Some("mp3"));
        assert_eq!(AudioSourceRef::blob(vec![1_u8]).extension_hint(), None);
    }

    #[test]
    fn rejects_ragged_sample_buffers() {
        assert!(DecodedAudio::new(vec![0.0; 3], 44_100, 2).is_err());
        assert!(DecodedAudio::new(vec![0.0; 4], 0, 2).is_err());
    }
}
