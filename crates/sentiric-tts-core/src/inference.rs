//! Contract between the engine and the pretrained voice model.
//!
//! The network itself is opaque. The engine only needs buffered synthesis,
//! chunked synthesis and conditioning-latent extraction, plus a little device
//! introspection for memory management. None of these calls are safe to run
//! concurrently; the [`crate::scheduler`] worker is the only caller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Errors reported by an inference primitive
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// Device memory exhausted (CUDA OOM or equivalent)
    #[error("out of memory: {message}")]
    OutOfMemory {
        /// Backend message
        message: String,
    },

    /// Any other inference failure
    #[error("inference failed: {message}")]
    Failed {
        /// Backend message
        message: String,
    },
}

impl InferenceError {
    /// Create a new out-of-memory error
    #[must_use]
    pub fn out_of_memory<S: Into<String>>(message: S) -> Self {
        Self::OutOfMemory {
            message: message.into(),
        }
    }

    /// Create a new generic failure
    #[must_use]
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Whether this failure is device-memory exhaustion
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

/// Result alias for primitive calls
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Conditioning data for one voice: the GPT conditioning latent and the
/// speaker embedding, both stored flattened with their shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerLatents {
    /// Flattened conditioning latent
    pub gpt_cond_latent: Vec<f32>,
    /// Shape of the conditioning latent
    pub gpt_cond_shape: Vec<usize>,
    /// Flattened speaker embedding
    pub speaker_embedding: Vec<f32>,
    /// Shape of the speaker embedding
    pub speaker_embedding_shape: Vec<usize>,
}

impl SpeakerLatents {
    /// Build latents from 1-D vectors
    #[must_use]
    pub fn from_vectors(gpt_cond_latent: Vec<f32>, speaker_embedding: Vec<f32>) -> Self {
        Self {
            gpt_cond_shape: vec![gpt_cond_latent.len()],
            speaker_embedding_shape: vec![speaker_embedding.len()],
            gpt_cond_latent,
            speaker_embedding,
        }
    }

    /// Check that the flattened data matches the declared shapes and is finite
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let product = |shape: &[usize]| shape.iter().product::<usize>();
        !self.gpt_cond_latent.is_empty()
            && !self.speaker_embedding.is_empty()
            && product(&self.gpt_cond_shape) == self.gpt_cond_latent.len()
            && product(&self.speaker_embedding_shape) == self.speaker_embedding.len()
            && self.gpt_cond_latent.iter().all(|v| v.is_finite())
            && self.speaker_embedding.iter().all(|v| v.is_finite())
    }
}

/// Temperature factor applied on the out-of-memory retry
pub const CONSERVATIVE_TEMPERATURE_SCALE: f32 = 0.8;

/// Sampling parameters passed to a single inference call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    /// Sampling temperature
    pub temperature: f32,
    /// Top-k sampling cutoff
    pub top_k: u32,
    /// Nucleus sampling cutoff
    pub top_p: f32,
    /// Repetition penalty
    pub repetition_penalty: f32,
    /// Speech rate multiplier
    pub speed: f32,
    /// Let the model split long input into sentences internally
    pub enable_text_splitting: bool,
}

impl InferenceParams {
    /// Settings used for the single retry after an out-of-memory failure.
    ///
    /// Always lighter than `self`: top-k is halved and the temperature scaled
    /// down on top of sentence splitting.
    #[must_use]
    pub fn conservative(self) -> Self {
        Self {
            top_k: (self.top_k / 2).max(1),
            temperature: (self.temperature * CONSERVATIVE_TEMPERATURE_SCALE).max(f32::EPSILON),
            enable_text_splitting: true,
            ..self
        }
    }
}

/// Compute device an inference primitive can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    /// Host CPU
    Cpu,
    /// CUDA accelerator
    Cuda,
}

impl ComputeDevice {
    /// Whether this is an accelerator with its own memory pool
    #[must_use]
    pub const fn is_accelerator(self) -> bool {
        matches!(self, Self::Cuda)
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// Device memory snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes currently reserved by the runtime
    pub used_bytes: u64,
    /// Total device capacity in bytes
    pub total_bytes: u64,
}

impl MemoryUsage {
    /// Fraction of device memory in use, 0.0 when capacity is unknown
    #[must_use]
    pub fn ratio(&self) -> f32 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.used_bytes as f64 / self.total_bytes as f64) as f32
        }
    }
}

/// Chunk iterator returned by streaming inference
pub type ChunkIter<'a> = Box<dyn Iterator<Item = InferenceResult<Vec<f32>>> + 'a>;

/// The pretrained multilingual voice model.
///
/// Implementations are not required to be thread-safe; they are moved into the
/// inference worker and only ever called from there.
pub trait InferencePrimitive: Send {
    /// Native output sample rate of the model
    fn sample_rate(&self) -> u32 {
        crate::NATIVE_SAMPLE_RATE
    }

    /// Devices this primitive can serve inference on, in preference order
    fn available_devices(&self) -> Vec<ComputeDevice> {
        vec![ComputeDevice::Cpu]
    }

    /// Move the model onto `device`
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be placed on the device.
    fn bind_device(&mut self, device: ComputeDevice) -> InferenceResult<()>;

    /// Device the model currently runs on
    fn device(&self) -> ComputeDevice;

    /// Synthesize `text` in one call and return the full waveform
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::OutOfMemory`] on device memory exhaustion.
    fn inference(
        &mut self,
        text: &str,
        language: &str,
        latents: &SpeakerLatents,
        params: &InferenceParams,
    ) -> InferenceResult<Vec<f32>>;

    /// Synthesize `text` as a sequence of waveform chunks
    ///
    /// # Errors
    ///
    /// Returns an error if generation cannot start; per-chunk failures are
    /// reported through the iterator.
    fn inference_stream<'a>(
        &'a mut self,
        text: &str,
        language: &str,
        latents: &SpeakerLatents,
        params: &InferenceParams,
    ) -> InferenceResult<ChunkIter<'a>>;

    /// Extract conditioning latents from one or more reference recordings
    ///
    /// # Errors
    ///
    /// Returns an error if the recordings cannot be read or encoded.
    fn conditioning_latents(&mut self, audio_paths: &[PathBuf]) -> InferenceResult<SpeakerLatents>;

    /// Current device memory usage, `None` on CPU or when unknown
    fn memory_usage(&self) -> Option<MemoryUsage> {
        None
    }

    /// Run a garbage collection and release cached device allocations
    fn release_device_cache(&mut self) {}
}
