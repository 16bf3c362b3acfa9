//! # Sentiric TTS Core
//!
//! Synthesis orchestration engine for a shared, non-thread-safe multilingual
//! voice-cloning model.
//!
//! ## Features
//!
//! - Single-worker inference scheduling with out-of-memory retry
//! - SSML breaks, prosody rate and emphasis
//! - Speaker catalog with per-style reference recordings
//! - Persistent conditioning-latent store
//! - Content-addressed cache of finished responses
//! - WAV, MP3 and raw PCM output, plus PCM streaming
//! - Device-memory pressure management
//!
//! ## Example
//!
//! ```rust,no_run
//! use sentiric_tts_core::{EngineConfig, InferencePrimitive, SynthesisEngine, SynthesisRequest};
//!
//! # async fn run(model: Box<dyn InferencePrimitive>) -> sentiric_tts_core::TtsResult<()> {
//! let engine = SynthesisEngine::new(EngineConfig::with_root("/var/lib/tts"), model)?;
//! let request = SynthesisRequest::new("Hello, world!")
//!     .with_language("en")
//!     .with_speaker("Ana/happy");
//! let output = engine.synthesize(request).await?;
//! println!("{} bytes of {}", output.audio.len(), output.mime_type());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod audio_writer;
pub mod config;
pub mod content_cache;
pub mod engine;
pub mod error;
pub mod inference;
pub mod language;
pub mod latent_cache;
pub mod post_processor;
pub mod request;
pub mod scheduler;
pub mod speaker_catalog;
pub mod ssml;
pub mod text_normalizer;
pub mod vram;

// Re-export main types for convenience
pub use audio_writer::{AudioFormat, AudioWriter, EncodedAudio, EncodingSettings};
pub use config::{AudioConfig, EngineConfig, TtsDevice, VramConfig};
pub use content_cache::{CacheKey, CacheLookup, ContentCache};
pub use engine::{AudioStream, EngineStats, SynthesisEngine, SynthesisResponse};
pub use error::{TtsError, TtsResult};
pub use inference::{
    ChunkIter, ComputeDevice, InferenceError, InferenceParams, InferencePrimitive,
    InferenceResult, MemoryUsage, SpeakerLatents,
};
pub use post_processor::{AudioPiece, PostProcessor, StreamShaper, TrimSettings};
pub use request::{SpeakerSelector, SynthesisOutput, SynthesisRequest, TuningParams};
pub use scheduler::SchedulerState;
pub use speaker_catalog::{RefreshReport, SpeakerCatalog};
pub use ssml::SsmlSegment;

/// Version information for the sentiric-tts-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Native output sample rate of the voice model (24 kHz)
pub const NATIVE_SAMPLE_RATE: u32 = 24_000;

/// Default number of audio channels (mono)
pub const DEFAULT_CHANNELS: u16 = 1;

/// Maximum text length for synthesis, in characters
pub const MAX_TEXT_LENGTH: usize = 5_000;
