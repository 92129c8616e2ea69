/// Result alias that carries the custom [`VisualiserError`] type.
pub type Result<T> = std::result::Result<T, VisualiserError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum VisualiserError {
    /// The audio source could not be reached (network failure, missing file,
    /// non-success HTTP status).
    #[error("failed to fetch audio source: {0}")]
    Fetch(String),
    /// The fetched bytes are not audio that can be decoded.
    #[error("failed to decode audio: {0}")]
    Decode(String),
    /// The operation is not valid for the current playback phase.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The configuration cannot be used to build an analysis pipeline.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The audio output device or stream failed.
    #[error("audio output error: {0}")]
    Output(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration or trace files that are not valid JSON.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl VisualiserError {
    pub fn fetch<T: Into<String>>(msg: T) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn decode<T: Into<String>>(msg: T) -> Self {
        Self::Decode(msg.into())
    }

    pub fn invalid_state<T: Into<String>>(msg: T) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn output<T: Into<String>>(msg: T) -> Self {
        Self::Output(msg.into())
    }

    /// Load failures are reported to the caller and leave the controller idle;
    /// everything else is a programming or device error.
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Decode(_))
    }
}

impl From<symphonia::core::errors::Error> for VisualiserError {
    fn from(value: symphonia::core::errors::Error) -> Self {
        // Symphonia only ever reads from in-memory bytes here, so its IO errors
        // mean truncated or malformed data.
        Self::Decode(value.to_string())
    }
}
