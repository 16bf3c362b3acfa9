//! Engine configuration.
//!
//! Configuration is a plain struct with sensible defaults; a TOML document can
//! override any subset of fields. Reading environment variables is left to the
//! embedding service.

use crate::error::{TtsError, TtsResult};
use crate::inference::ComputeDevice;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Requested device for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsDevice {
    /// Use CPU for inference
    Cpu,
    /// Use a CUDA accelerator, falling back to CPU when absent
    Cuda,
    /// Automatically select the best device
    Auto,
}

impl TtsDevice {
    /// Pick a concrete device from what the primitive can serve.
    ///
    /// # Errors
    ///
    /// Returns [`TtsError::DeviceUnavailable`] if `available` is empty.
    pub fn resolve(self, available: &[ComputeDevice]) -> TtsResult<ComputeDevice> {
        if available.is_empty() {
            return Err(TtsError::device_unavailable(
                "inference primitive reports no usable compute device",
            ));
        }
        let has = |d: ComputeDevice| available.contains(&d);
        let device = match self {
            Self::Cpu if has(ComputeDevice::Cpu) => ComputeDevice::Cpu,
            Self::Cuda | Self::Auto if has(ComputeDevice::Cuda) => ComputeDevice::Cuda,
            _ if has(ComputeDevice::Cpu) => ComputeDevice::Cpu,
            _ => available[0],
        };
        Ok(device)
    }
}

/// Device-memory reclamation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VramConfig {
    /// Reclaim every N completed inferences (0 disables the periodic trigger)
    pub cleanup_interval: u64,
    /// Reclaim whenever used/total device memory exceeds this ratio
    pub memory_threshold: f32,
    /// Reclaim after every inference
    pub low_resource_mode: bool,
}

impl Default for VramConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: 10,
            memory_threshold: 0.85,
            low_resource_mode: false,
        }
    }
}

/// Post-processing and encoding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Amplitude above which a sample counts as speech when trimming
    pub trim_threshold: f32,
    /// Length of the tail fade-out in milliseconds
    pub fade_ms: u32,
    /// Streaming chunks with a lower peak are suppressed
    pub noise_gate_threshold: f32,
    /// Silence prepended to buffered output, in milliseconds
    pub leading_silence_ms: u32,
    /// Peak ceiling for buffered output in dBFS; `None` disables normalization
    pub peak_normalize_dbfs: Option<f32>,
    /// MP3 bitrate in kbps
    pub mp3_bitrate_kbps: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            trim_threshold: 0.01,
            fade_ms: 50,
            noise_gate_threshold: 0.003,
            leading_silence_ms: 250,
            peak_normalize_dbfs: Some(-1.5),
            mp3_bitrate_kbps: 192,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Speaker reference recordings (flat files or per-speaker directories)
    pub speakers_dir: PathBuf,
    /// Content-addressed audio cache
    pub cache_dir: PathBuf,
    /// Latent store; defaults to `cache_dir/latents`
    pub latents_dir: Option<PathBuf>,
    /// Recording used when a selector cannot be resolved
    pub default_speaker_wav: Option<PathBuf>,
    /// Device to use for inference
    pub device: TtsDevice,
    /// Native model sample rate
    pub native_sample_rate: u32,
    /// Maximum text length in characters
    pub max_text_length: usize,
    /// Speaker catalog time-to-live in seconds
    pub catalog_ttl_secs: u64,
    /// Enable the content-addressed cache
    pub cache_enabled: bool,
    /// Chunks buffered between the inference worker and a stream consumer
    pub stream_buffer_chunks: usize,
    /// Device-memory settings
    pub vram: VramConfig,
    /// Post-processing settings
    pub audio: AudioConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base_dir = default_data_dir();

        Self {
            speakers_dir: base_dir.join("speakers"),
            cache_dir: base_dir.join("cache"),
            latents_dir: None,
            default_speaker_wav: None,
            device: TtsDevice::Auto,
            native_sample_rate: crate::NATIVE_SAMPLE_RATE,
            max_text_length: crate::MAX_TEXT_LENGTH,
            catalog_ttl_secs: 300,
            cache_enabled: true,
            stream_buffer_chunks: 8,
            vram: VramConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at a single data directory
    #[must_use]
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            speakers_dir: root.join("speakers"),
            cache_dir: root.join("cache"),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing fields keep their defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or fails validation.
    pub fn from_toml_str(content: &str) -> TtsResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> TtsResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TtsError::configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolved latent store directory
    #[must_use]
    pub fn latents_dir(&self) -> PathBuf {
        self.latents_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("latents"))
    }

    /// Speaker catalog time-to-live
    #[must_use]
    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid value.
    pub fn validate(&self) -> TtsResult<()> {
        if !(8000..=48_000).contains(&self.native_sample_rate) {
            return Err(TtsError::configuration(format!(
                "native_sample_rate must be between 8000 and 48000 Hz, got {}",
                self.native_sample_rate
            )));
        }

        if self.max_text_length == 0 {
            return Err(TtsError::configuration("max_text_length must be greater than 0"));
        }

        if self.stream_buffer_chunks == 0 {
            return Err(TtsError::configuration(
                "stream_buffer_chunks must be greater than 0",
            ));
        }

        if !(0.0..=1.0).contains(&self.vram.memory_threshold) {
            return Err(TtsError::configuration(format!(
                "vram.memory_threshold must be between 0.0 and 1.0, got {}",
                self.vram.memory_threshold
            )));
        }

        if !(0.0..1.0).contains(&self.audio.trim_threshold) {
            return Err(TtsError::configuration(format!(
                "audio.trim_threshold must be in [0.0, 1.0), got {}",
                self.audio.trim_threshold
            )));
        }

        if let Some(dbfs) = self.audio.peak_normalize_dbfs {
            if !(-60.0..=0.0).contains(&dbfs) {
                return Err(TtsError::configuration(format!(
                    "audio.peak_normalize_dbfs must be between -60 and 0, got {dbfs}"
                )));
            }
        }

        if !(32..=320).contains(&self.audio.mp3_bitrate_kbps) {
            return Err(TtsError::configuration(format!(
                "audio.mp3_bitrate_kbps must be between 32 and 320, got {}",
                self.audio.mp3_bitrate_kbps
            )));
        }

        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("ai", "Sentiric", "sentiric-tts")
        .map_or_else(|| PathBuf::from("./data"), |dirs| dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.device, TtsDevice::Auto);
        assert_eq!(config.max_text_length, crate::MAX_TEXT_LENGTH);
        assert_eq!(config.native_sample_rate, crate::NATIVE_SAMPLE_RATE);
        assert!(config.cache_enabled);
        assert!(config.validate().is_ok());
        assert_eq!(config.latents_dir(), config.cache_dir.join("latents"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            speakers_dir = "/srv/speakers"
            device = "cuda"

            [vram]
            low_resource_mode = true
            "#,
        )
        .expect("valid config");

        assert_eq!(config.speakers_dir, PathBuf::from("/srv/speakers"));
        assert_eq!(config.device, TtsDevice::Cuda);
        assert!(config.vram.low_resource_mode);
        assert_eq!(config.vram.cleanup_interval, 10);
        assert_eq!(config.audio.fade_ms, 50);
    }

    #[test]
    fn test_invalid_toml_values_rejected() {
        assert!(EngineConfig::from_toml_str("native_sample_rate = 100").is_err());
        assert!(EngineConfig::from_toml_str("[vram]\nmemory_threshold = 1.5").is_err());
        assert!(EngineConfig::from_toml_str("device = \"tpu\"").is_err());
    }

    #[test]
    fn test_device_resolution() {
        let both = [ComputeDevice::Cuda, ComputeDevice::Cpu];
        let cpu_only = [ComputeDevice::Cpu];

        assert_eq!(TtsDevice::Auto.resolve(&both).unwrap(), ComputeDevice::Cuda);
        assert_eq!(TtsDevice::Cpu.resolve(&both).unwrap(), ComputeDevice::Cpu);
        assert_eq!(TtsDevice::Cuda.resolve(&cpu_only).unwrap(), ComputeDevice::Cpu);
        assert_eq!(TtsDevice::Cpu.resolve(&[ComputeDevice::Cuda]).unwrap(), ComputeDevice::Cuda);

        let err = TtsDevice::Auto.resolve(&[]).unwrap_err();
        assert!(matches!(err, TtsError::DeviceUnavailable { .. }));
    }
}
