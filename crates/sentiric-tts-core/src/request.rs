//! Request and response types for the synthesis engine.

use crate::audio_writer::AudioFormat;
use crate::error::{TtsError, TtsResult};
use crate::inference::InferenceParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Style used when a selector names none
pub const DEFAULT_STYLE: &str = "default";

/// Sampling and prosody parameters of a request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParams {
    /// Sampling temperature (0.0, 2.0]
    pub temperature: f32,
    /// Speed multiplier [0.25, 4.0]
    pub speed: f32,
    /// Top-k cutoff (>= 1)
    pub top_k: u32,
    /// Nucleus cutoff (0.0, 1.0]
    pub top_p: f32,
    /// Repetition penalty (>= 1.0)
    pub repetition_penalty: f32,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            temperature: 0.75,
            speed: 1.0,
            top_k: 50,
            top_p: 0.85,
            repetition_penalty: 2.0,
        }
    }
}

impl TuningParams {
    /// Validate parameter ranges
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first out-of-range parameter.
    pub fn validate(&self) -> TtsResult<()> {
        if !(self.temperature > 0.0 && self.temperature <= 2.0) {
            return Err(TtsError::validation(format!(
                "Temperature must be in (0.0, 2.0], got {}",
                self.temperature
            )));
        }

        if !(0.25..=4.0).contains(&self.speed) {
            return Err(TtsError::validation(format!(
                "Speed must be between 0.25 and 4.0, got {}",
                self.speed
            )));
        }

        if self.top_k == 0 {
            return Err(TtsError::validation("top_k must be at least 1"));
        }

        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(TtsError::validation(format!(
                "top_p must be in (0.0, 1.0], got {}",
                self.top_p
            )));
        }

        if !(self.repetition_penalty >= 1.0 && self.repetition_penalty.is_finite()) {
            return Err(TtsError::validation(format!(
                "repetition_penalty must be >= 1.0, got {}",
                self.repetition_penalty
            )));
        }

        Ok(())
    }

    /// Parameters for one primitive call
    #[must_use]
    pub fn to_inference_params(&self, enable_text_splitting: bool) -> InferenceParams {
        InferenceParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            speed: self.speed,
            enable_text_splitting,
        }
    }
}

/// Speaker identity: a catalog name with an optional style
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpeakerSelector {
    /// Speaker name; empty means the system default speaker
    pub name: String,
    /// Style name
    pub style: String,
}

impl SpeakerSelector {
    /// Create a selector for `name` with the default style
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            style: DEFAULT_STYLE.to_string(),
        }
    }

    /// Parse `name` or `name/style`
    #[must_use]
    pub fn parse(selector: &str) -> Self {
        let selector = selector.trim();
        match selector.split_once('/') {
            Some((name, style)) if !style.trim().is_empty() => Self {
                name: name.trim().to_string(),
                style: style.trim().to_string(),
            },
            Some((name, _)) => Self::new(name.trim()),
            None => Self::new(selector),
        }
    }

    /// Whether the selector asks for the system default speaker
    #[must_use]
    pub fn is_system_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Whether the default style is selected
    #[must_use]
    pub fn is_default_style(&self) -> bool {
        self.style == DEFAULT_STYLE
    }
}

impl Default for SpeakerSelector {
    fn default() -> Self {
        Self::new("")
    }
}

impl std::fmt::Display for SpeakerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_default_style() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.name, self.style)
        }
    }
}

impl From<&str> for SpeakerSelector {
    fn from(selector: &str) -> Self {
        Self::parse(selector)
    }
}

/// A synthesis request as handed over by the transport layer
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Plain or SSML-marked text
    pub text: String,
    /// Language code, or `"auto"`
    pub language: String,
    /// Catalog speaker
    pub speaker: SpeakerSelector,
    /// Sampling parameters
    pub tuning: TuningParams,
    /// Output container (buffered requests)
    pub output_format: AudioFormat,
    /// Output sample rate (buffered requests)
    pub sample_rate: u32,
    /// Deliver audio incrementally instead of fully buffered
    pub stream: bool,
    /// Reference recordings for ad-hoc voice cloning
    pub reference_audio: Vec<PathBuf>,
}

impl SynthesisRequest {
    /// Create a request with default parameters
    #[must_use]
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            language: "auto".to_string(),
            speaker: SpeakerSelector::default(),
            tuning: TuningParams::default(),
            output_format: AudioFormat::Wav,
            sample_rate: crate::NATIVE_SAMPLE_RATE,
            stream: false,
            reference_audio: Vec::new(),
        }
    }

    /// Set the language code
    #[must_use]
    pub fn with_language<S: Into<String>>(mut self, language: S) -> Self {
        self.language = language.into();
        self
    }

    /// Set the speaker selector (`name` or `name/style`)
    #[must_use]
    pub fn with_speaker(mut self, selector: &str) -> Self {
        self.speaker = SpeakerSelector::parse(selector);
        self
    }

    /// Set the tuning parameters
    #[must_use]
    pub fn with_tuning(mut self, tuning: TuningParams) -> Self {
        self.tuning = tuning;
        self
    }

    /// Set the output container
    #[must_use]
    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Set the output sample rate
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Request incremental delivery
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Clone the voice from the given reference recordings
    #[must_use]
    pub fn with_reference_audio(mut self, paths: Vec<PathBuf>) -> Self {
        self.reference_audio = paths;
        self
    }

    /// Whether this request clones a voice from reference audio
    #[must_use]
    pub fn is_voice_clone(&self) -> bool {
        !self.reference_audio.is_empty()
    }

    /// Validate the request
    ///
    /// # Errors
    ///
    /// Returns a validation error for blank or oversized text, bad tuning or
    /// an unsupported sample rate.
    pub fn validate(&self, max_text_length: usize) -> TtsResult<()> {
        if self.text.trim().is_empty() {
            return Err(TtsError::validation("Text cannot be empty"));
        }

        let length = self.text.chars().count();
        if length > max_text_length {
            return Err(TtsError::validation(format!(
                "Text length {length} exceeds maximum of {max_text_length}"
            )));
        }

        if !(8000..=48_000).contains(&self.sample_rate) {
            return Err(TtsError::validation(format!(
                "Sample rate must be between 8000 and 48000 Hz, got {}",
                self.sample_rate
            )));
        }

        self.tuning.validate()
    }
}

/// Finished buffered synthesis
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    /// Encoded audio
    pub audio: Vec<u8>,
    /// Container actually produced
    pub format: AudioFormat,
    /// Sample rate of the encoded audio
    pub sample_rate: u32,
    /// Served from the content-addressed cache
    pub cache_hit: bool,
    /// Audio duration, when it can be derived from the container
    pub duration_secs: Option<f32>,
}

impl SynthesisOutput {
    /// MIME type of the produced container
    #[must_use]
    pub const fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }
}
