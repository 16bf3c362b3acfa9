//! Error types for the synthesis engine.

use crate::inference::InferenceError;

/// Result type alias for engine operations
pub type TtsResult<T> = Result<T, TtsError>;

/// Main error type for synthesis operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TtsError {
    /// Request rejected before any inference attempt
    #[error("Invalid request: {message}")]
    ValidationError {
        /// Error message describing the invalid input
        message: String,
    },

    /// Speaker selector did not resolve to a catalog entry
    #[error("Speaker '{speaker}' not found")]
    SpeakerNotFound {
        /// The selector that was not found
        speaker: String,
    },

    /// SSML markup could not be parsed
    #[error("Malformed SSML: {message}")]
    SsmlMalformed {
        /// Parser message
        message: String,
    },

    /// Device memory exhausted during inference, after the conservative retry
    #[error("Resource exhaustion: {message}")]
    ResourceExhaustion {
        /// Error message describing the exhaustion
        message: String,
    },

    /// Read or write failure against the latent store or the content cache
    #[error("Cache I/O error: {message}")]
    CacheIoError {
        /// Error message describing the cache failure
        message: String,
    },

    /// No compute device can serve inference
    #[error("Device unavailable: {message}")]
    DeviceUnavailable {
        /// Error message describing the device issue
        message: String,
    },

    /// TTS synthesis failed
    #[error("TTS synthesis failed: {message}")]
    SynthesisError {
        /// Error message describing the failure
        message: String,
    },

    /// Audio format or processing error
    #[error("Audio processing error: {message}")]
    AudioProcessingError {
        /// Error message describing the processing issue
        message: String,
    },

    /// File I/O error
    #[error("File I/O error: {message}")]
    FileError {
        /// Error message describing the file operation failure
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Inference worker or channel failure
    #[error("Concurrency error: {message}")]
    ConcurrencyError {
        /// Error message describing the concurrency issue
        message: String,
    },
}

impl TtsError {
    /// Create a new validation error
    #[must_use]
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    /// Create a new speaker not found error
    #[must_use]
    pub fn speaker_not_found<S: Into<String>>(speaker: S) -> Self {
        Self::SpeakerNotFound {
            speaker: speaker.into(),
        }
    }

    /// Create a new malformed SSML error
    #[must_use]
    pub fn ssml_malformed<S: Into<String>>(message: S) -> Self {
        Self::SsmlMalformed {
            message: message.into(),
        }
    }

    /// Create a new resource exhaustion error
    #[must_use]
    pub fn resource_exhaustion<S: Into<String>>(message: S) -> Self {
        Self::ResourceExhaustion {
            message: message.into(),
        }
    }

    /// Create a new cache I/O error
    #[must_use]
    pub fn cache_io<S: Into<String>>(message: S) -> Self {
        Self::CacheIoError {
            message: message.into(),
        }
    }

    /// Create a new device unavailable error
    #[must_use]
    pub fn device_unavailable<S: Into<String>>(message: S) -> Self {
        Self::DeviceUnavailable {
            message: message.into(),
        }
    }

    /// Create a new synthesis error
    #[must_use]
    pub fn synthesis<S: Into<String>>(message: S) -> Self {
        Self::SynthesisError {
            message: message.into(),
        }
    }

    /// Create a new audio processing error
    #[must_use]
    pub fn audio_processing<S: Into<String>>(message: S) -> Self {
        Self::AudioProcessingError {
            message: message.into(),
        }
    }

    /// Create a new file error
    #[must_use]
    pub fn file<S: Into<String>>(message: S) -> Self {
        Self::FileError {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Create a new concurrency error
    #[must_use]
    pub fn concurrency<S: Into<String>>(message: S) -> Self {
        Self::ConcurrencyError {
            message: message.into(),
        }
    }

    /// Check if this error is retriable by the caller
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhaustion { .. } | Self::CacheIoError { .. } | Self::ConcurrencyError { .. }
        )
    }

    /// Check if this error is due to invalid user input
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::ValidationError { .. } | Self::SpeakerNotFound { .. } | Self::SsmlMalformed { .. }
        )
    }

    /// Check if this error ends the request (as opposed to being recovered locally)
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhaustion { .. }
                | Self::DeviceUnavailable { .. }
                | Self::SynthesisError { .. }
                | Self::ConcurrencyError { .. }
        )
    }

    /// Get the error category for logging/metrics
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "validation",
            Self::SpeakerNotFound { .. } => "speaker",
            Self::SsmlMalformed { .. } => "ssml",
            Self::ResourceExhaustion { .. } => "resource",
            Self::CacheIoError { .. } => "cache",
            Self::DeviceUnavailable { .. } => "device",
            Self::SynthesisError { .. } => "synthesis",
            Self::AudioProcessingError { .. } => "audio_processing",
            Self::FileError { .. } => "file",
            Self::ConfigurationError { .. } => "configuration",
            Self::ConcurrencyError { .. } => "concurrency",
        }
    }
}

// Convert from common error types
impl From<std::io::Error> for TtsError {
    fn from(err: std::io::Error) -> Self {
        Self::file(err.to_string())
    }
}

impl From<serde_json::Error> for TtsError {
    fn from(err: serde_json::Error) -> Self {
        Self::file(format!("JSON serialization error: {err}"))
    }
}

impl From<toml::de::Error> for TtsError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(format!("Invalid TOML: {err}"))
    }
}

impl From<hound::Error> for TtsError {
    fn from(err: hound::Error) -> Self {
        Self::audio_processing(format!("WAV encoding failed: {err}"))
    }
}

impl From<InferenceError> for TtsError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::OutOfMemory { message } => Self::resource_exhaustion(message),
            other => Self::synthesis(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for TtsError {
    fn from(err: anyhow::Error) -> Self {
        Self::synthesis(err.to_string())
    }
}
