//! In-memory audio encoding with support for multiple containers.

use crate::error::{TtsError, TtsResult};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::{debug, warn};

/// Size of a canonical PCM WAV header
pub const WAV_HEADER_BYTES: usize = 44;

/// Supported audio output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// WAV format (uncompressed 16-bit PCM)
    Wav,
    /// MP3 format (lossy compression)
    Mp3,
    /// Opus format (lossy compression, served as WAV)
    Opus,
    /// Raw headerless signed 16-bit little-endian PCM
    Pcm,
}

impl AudioFormat {
    /// Get file extension for the format
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Pcm => "pcm",
        }
    }

    /// Get MIME type for the format
    #[must_use]
    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Opus => "audio/ogg",
            Self::Pcm => "audio/L16",
        }
    }

    /// Check if the format is lossy
    #[must_use]
    pub const fn is_lossy(self) -> bool {
        matches!(self, Self::Mp3 | Self::Opus)
    }

    /// Whether this build can produce the format itself
    #[must_use]
    pub const fn is_encodable(self) -> bool {
        match self {
            Self::Wav | Self::Pcm => true,
            Self::Mp3 => cfg!(feature = "mp3"),
            Self::Opus => false,
        }
    }

    /// Detect format from file extension
    ///
    /// # Errors
    ///
    /// Returns an error if the extension is not supported
    pub fn from_extension(extension: &str) -> TtsResult<Self> {
        match extension.trim().to_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "mp3" => Ok(Self::Mp3),
            "opus" | "ogg" => Ok(Self::Opus),
            "pcm" | "raw" => Ok(Self::Pcm),
            _ => Err(TtsError::validation(format!(
                "Unsupported audio format: {extension}"
            ))),
        }
    }

    /// Guess the container of already-encoded bytes
    #[must_use]
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => Some(Self::Wav),
            [b'I', b'D', b'3', ..] => Some(Self::Mp3),
            [0xFF, second, ..] if second & 0xE0 == 0xE0 => Some(Self::Mp3),
            [b'O', b'g', b'g', b'S', ..] => Some(Self::Opus),
            _ => None,
        }
    }

    /// Get all supported formats
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Wav, Self::Mp3, Self::Opus, Self::Pcm]
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension().to_uppercase())
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = TtsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s)
    }
}

/// Audio encoding settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingSettings {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of audio channels
    pub channels: u16,
    /// MP3 bitrate in kbps
    pub mp3_bitrate_kbps: u32,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            sample_rate: crate::NATIVE_SAMPLE_RATE,
            channels: crate::DEFAULT_CHANNELS,
            mp3_bitrate_kbps: 192,
        }
    }
}

impl EncodingSettings {
    /// Create new mono encoding settings
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Default::default()
        }
    }

    /// Set the MP3 bitrate
    #[must_use]
    pub fn with_mp3_bitrate(mut self, kbps: u32) -> Self {
        self.mp3_bitrate_kbps = kbps;
        self
    }

    /// Validate encoding settings
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range sample rate or channel count.
    pub fn validate(&self) -> TtsResult<()> {
        if !(8000..=48_000).contains(&self.sample_rate) {
            return Err(TtsError::audio_processing(format!(
                "Sample rate must be between 8000 and 48000 Hz, got {}",
                self.sample_rate
            )));
        }

        if self.channels == 0 || self.channels > 2 {
            return Err(TtsError::audio_processing(format!(
                "Channels must be 1 or 2, got {}",
                self.channels
            )));
        }

        Ok(())
    }
}

/// Encoded audio together with the container actually produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudio {
    /// Encoded bytes
    pub bytes: Vec<u8>,
    /// Container of `bytes`
    pub format: AudioFormat,
}

/// Audio encoder producing in-memory containers
#[derive(Debug, Clone, Default)]
pub struct AudioWriter {
    default_settings: EncodingSettings,
}

impl AudioWriter {
    /// Create a new audio writer with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new audio writer with custom default settings
    #[must_use]
    pub fn with_settings(settings: EncodingSettings) -> Self {
        Self {
            default_settings: settings,
        }
    }

    /// Encode samples into `format`.
    ///
    /// Formats this build cannot produce are written as WAV; the returned
    /// [`EncodedAudio::format`] reports what was actually produced.
    ///
    /// # Errors
    ///
    /// Returns an error if the samples contain NaN/infinity, the settings are
    /// invalid or the encoder fails.
    pub fn encode(
        &self,
        samples: &[f32],
        format: AudioFormat,
        settings: Option<&EncodingSettings>,
    ) -> TtsResult<EncodedAudio> {
        let settings = settings.unwrap_or(&self.default_settings);
        Self::validate_inputs(samples, settings)?;

        let format = if format.is_encodable() {
            format
        } else {
            warn!("No {} encoder available, returning WAV", format);
            AudioFormat::Wav
        };

        debug!(
            "Encoding {} samples as {} at {} Hz",
            samples.len(),
            format,
            settings.sample_rate
        );

        let bytes = match format {
            AudioFormat::Wav | AudioFormat::Opus => encode_wav(samples, settings)?,
            AudioFormat::Pcm => encode_pcm_s16le(samples),
            AudioFormat::Mp3 => encode_mp3(samples, settings)?,
        };

        Ok(EncodedAudio { bytes, format })
    }

    /// Estimate encoded size in bytes
    #[must_use]
    pub fn estimate_encoded_size(
        samples: usize,
        format: AudioFormat,
        settings: &EncodingSettings,
    ) -> usize {
        let pcm_bytes = samples * 2;
        match format {
            AudioFormat::Wav | AudioFormat::Opus => pcm_bytes + WAV_HEADER_BYTES,
            AudioFormat::Pcm => pcm_bytes,
            AudioFormat::Mp3 => {
                let seconds = samples as f64
                    / f64::from(settings.sample_rate)
                    / f64::from(settings.channels.max(1));
                (seconds * f64::from(settings.mp3_bitrate_kbps) * 1000.0 / 8.0) as usize
            }
        }
    }

    fn validate_inputs(samples: &[f32], settings: &EncodingSettings) -> TtsResult<()> {
        if let Some((i, sample)) = samples.iter().enumerate().find(|(_, s)| !s.is_finite()) {
            return Err(TtsError::audio_processing(format!(
                "Invalid audio sample at index {i}: {sample}"
            )));
        }
        settings.validate()
    }
}

/// Convert a float sample to 16-bit PCM, clipping to [-1, 1]
#[must_use]
pub fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Raw signed 16-bit little-endian PCM
#[must_use]
pub fn encode_pcm_s16le(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| to_i16(sample).to_le_bytes())
        .collect()
}

/// 16-bit PCM WAV
///
/// # Errors
///
/// Returns an error if the WAV writer fails.
pub fn encode_wav(samples: &[f32], settings: &EncodingSettings) -> TtsResult<Vec<u8>> {
    let spec = WavSpec {
        channels: settings.channels,
        sample_rate: settings.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(samples.len() * 2 + WAV_HEADER_BYTES));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(to_i16(sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Duration in seconds of a WAV byte buffer
#[must_use]
pub fn wav_duration_secs(bytes: &[u8]) -> Option<f32> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(reader.duration() as f32 / spec.sample_rate as f32)
}

#[cfg(feature = "mp3")]
fn encode_mp3(samples: &[f32], settings: &EncodingSettings) -> TtsResult<Vec<u8>> {
    use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

    let mut builder =
        Builder::new().ok_or_else(|| TtsError::audio_processing("Failed to create LAME encoder"))?;
    builder
        .set_num_channels(1)
        .map_err(|e| TtsError::audio_processing(format!("LAME channels: {e:?}")))?;
    builder
        .set_sample_rate(settings.sample_rate)
        .map_err(|e| TtsError::audio_processing(format!("LAME sample rate: {e:?}")))?;
    let bitrate = match settings.mp3_bitrate_kbps {
        0..=63 => Bitrate::Kbps48,
        64..=95 => Bitrate::Kbps64,
        96..=127 => Bitrate::Kbps96,
        128..=159 => Bitrate::Kbps128,
        160..=191 => Bitrate::Kbps160,
        192..=223 => Bitrate::Kbps192,
        224..=255 => Bitrate::Kbps224,
        256..=319 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    };
    builder
        .set_brate(bitrate)
        .map_err(|e| TtsError::audio_processing(format!("LAME bitrate: {e:?}")))?;
    builder
        .set_quality(Quality::Good)
        .map_err(|e| TtsError::audio_processing(format!("LAME quality: {e:?}")))?;
    let mut encoder = builder
        .build()
        .map_err(|e| TtsError::audio_processing(format!("LAME init: {e:?}")))?;

    let pcm: Vec<i16> = samples.iter().map(|&s| to_i16(s)).collect();
    let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(pcm.len()));
    encoder
        .encode_to_vec(MonoPcm(&pcm), &mut out)
        .map_err(|e| TtsError::audio_processing(format!("MP3 encoding failed: {e:?}")))?;
    encoder
        .flush_to_vec::<FlushNoGap>(&mut out)
        .map_err(|e| TtsError::audio_processing(format!("MP3 flush failed: {e:?}")))?;
    Ok(out)
}

#[cfg(not(feature = "mp3"))]
fn encode_mp3(samples: &[f32], settings: &EncodingSettings) -> TtsResult<Vec<u8>> {
    encode_wav(samples, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect()
    }

    #[rstest]
    #[case(AudioFormat::Wav, "wav", "audio/wav")]
    #[case(AudioFormat::Mp3, "mp3", "audio/mpeg")]
    #[case(AudioFormat::Opus, "opus", "audio/ogg")]
    #[case(AudioFormat::Pcm, "pcm", "audio/L16")]
    fn test_format_metadata(#[case] format: AudioFormat, #[case] ext: &str, #[case] mime: &str) {
        assert_eq!(format.extension(), ext);
        assert_eq!(format.mime_type(), mime);
        assert_eq!(AudioFormat::from_extension(ext).unwrap(), format);
    }

    #[test]
    fn test_audio_format_from_extension() {
        assert_eq!(AudioFormat::from_extension("WAV").unwrap(), AudioFormat::Wav);
        assert_eq!("ogg".parse::<AudioFormat>().unwrap(), AudioFormat::Opus);
        assert!(AudioFormat::from_extension("flac").is_err());
    }

    #[test]
    fn test_audio_format_display() {
        assert_eq!(AudioFormat::Wav.to_string(), "WAV");
        assert_eq!(AudioFormat::Pcm.to_string(), "PCM");
        assert_eq!(AudioFormat::all().len(), 4);
    }

    #[test]
    fn test_encoding_settings_validation() {
        assert!(EncodingSettings::default().validate().is_ok());
        assert!(EncodingSettings::new(4000).validate().is_err());
        let stereo = EncodingSettings {
            channels: 3,
            ..EncodingSettings::default()
        };
        assert!(stereo.validate().is_err());
    }

    #[test]
    fn test_wav_encoding_round_trip() {
        let samples = tone(2400);
        let encoded = AudioWriter::new()
            .encode(&samples, AudioFormat::Wav, None)
            .unwrap();

        assert_eq!(encoded.format, AudioFormat::Wav);
        assert_eq!(AudioFormat::sniff(&encoded.bytes), Some(AudioFormat::Wav));
        assert_eq!(encoded.bytes.len(), WAV_HEADER_BYTES + samples.len() * 2);

        let reader = hound::WavReader::new(Cursor::new(&encoded.bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, crate::NATIVE_SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len() as usize, samples.len());

        let duration = wav_duration_secs(&encoded.bytes).unwrap();
        assert!((duration - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_pcm_is_little_endian_and_clipped() {
        let bytes = encode_pcm_s16le(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -32767);
        assert_eq!(i16::from_le_bytes([bytes[6], bytes[7]]), 32767);
    }

    #[test]
    fn test_opus_falls_back_to_wav() {
        let encoded = AudioWriter::new()
            .encode(&tone(100), AudioFormat::Opus, None)
            .unwrap();
        assert_eq!(encoded.format, AudioFormat::Wav);
        assert_eq!(AudioFormat::sniff(&encoded.bytes), Some(AudioFormat::Wav));
    }

    #[cfg(feature = "mp3")]
    #[test]
    fn test_mp3_encoding() {
        let settings = EncodingSettings::new(24_000).with_mp3_bitrate(128);
        let encoded = AudioWriter::new()
            .encode(&tone(24_000), AudioFormat::Mp3, Some(&settings))
            .unwrap();
        assert_eq!(encoded.format, AudioFormat::Mp3);
        assert!(!encoded.bytes.is_empty());
    }

    #[test]
    fn test_invalid_samples_rejected() {
        let writer = AudioWriter::new();
        assert!(writer.encode(&[0.1, f32::NAN], AudioFormat::Wav, None).is_err());
        assert!(writer.encode(&[f32::INFINITY], AudioFormat::Pcm, None).is_err());
    }

    #[test]
    fn test_estimate_encoded_size() {
        let settings = EncodingSettings::new(24_000);
        assert_eq!(
            AudioWriter::estimate_encoded_size(24_000, AudioFormat::Wav, &settings),
            48_044
        );
        assert_eq!(
            AudioWriter::estimate_encoded_size(24_000, AudioFormat::Pcm, &settings),
            48_000
        );
        assert_eq!(
            AudioWriter::estimate_encoded_size(24_000, AudioFormat::Mp3, &settings),
            24_000
        );
    }
}
