//! Waveform post-processing: tail trimming, assembly, gating, resampling and
//! the final hand-off to the encoder.
//!
//! Everything here runs outside the inference worker.

use crate::audio_writer::{AudioFormat, AudioWriter, EncodedAudio, EncodingSettings};
use crate::config::AudioConfig;
use crate::error::{TtsError, TtsResult};
use rubato::{FftFixedIn, Resampler};
use std::time::Duration;
use tracing::debug;

const RESAMPLE_CHUNK: usize = 1024;
const RESAMPLE_SUB_CHUNKS: usize = 2;
const NORMALIZE_FLOOR: f32 = 1e-4;

/// Tail trimming parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimSettings {
    /// Amplitude above which a sample counts as speech
    pub threshold: f32,
    /// Fade-out window in samples
    pub fade_samples: usize,
}

impl TrimSettings {
    /// Settings for a waveform at `sample_rate`
    #[must_use]
    pub fn new(threshold: f32, fade_ms: u32, sample_rate: u32) -> Self {
        Self {
            threshold,
            fade_samples: samples_for(Duration::from_millis(u64::from(fade_ms)), sample_rate),
        }
    }
}

/// Piece of a synthesized utterance before assembly
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPiece {
    /// Model output for one text segment
    Voiced(Vec<f32>),
    /// Exact-length silence, in samples
    Silence(usize),
}

/// Number of samples covering `duration` at `sample_rate`
#[must_use]
pub fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize
}

/// Remove trailing low-level artifacts and fade the tail to zero.
///
/// The waveform is cut `fade_samples` after the last sample louder than the
/// threshold, and the final `fade_samples` of what remains are faded linearly
/// to zero. A waveform with no sample above the threshold trims to nothing.
#[must_use]
pub fn trim_and_fade(samples: &[f32], settings: &TrimSettings) -> Vec<f32> {
    let Some(last_loud) = samples.iter().rposition(|s| s.abs() > settings.threshold) else {
        return Vec::new();
    };

    let end = (last_loud + 1 + settings.fade_samples).min(samples.len());
    let mut trimmed = samples[..end].to_vec();

    let fade = settings.fade_samples.min(trimmed.len());
    let start = trimmed.len() - fade;
    for (k, sample) in trimmed[start..].iter_mut().enumerate() {
        *sample *= (fade - 1 - k) as f32 / fade as f32;
    }

    trimmed
}

/// Largest absolute sample value
#[must_use]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()))
}

/// Scale `samples` so the peak sits at `ceiling_dbfs`
pub fn peak_normalize(samples: &mut [f32], ceiling_dbfs: f32) {
    let current = peak(samples);
    if current < NORMALIZE_FLOOR {
        return;
    }
    let gain = 10.0_f32.powf(ceiling_dbfs / 20.0) / current;
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}

/// Convert mono audio between sample rates
///
/// # Errors
///
/// Returns an error if the resampler cannot be built for the given rates.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> TtsResult<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLE_CHUNK,
        RESAMPLE_SUB_CHUNKS,
        1,
    )
    .map_err(|e| TtsError::audio_processing(format!("Resampler setup failed: {e}")))?;
    let resample_err = |e: rubato::ResampleError| {
        TtsError::audio_processing(format!("Resampling failed: {e}"))
    };

    let delay = resampler.output_delay();
    let expected =
        (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut pos = 0;
    while samples.len() - pos >= resampler.input_frames_next() {
        let next = resampler.input_frames_next();
        let input = [&samples[pos..pos + next]];
        let block = resampler.process(&input[..], None).map_err(resample_err)?;
        out.extend_from_slice(&block[0]);
        pos += next;
    }

    if pos < samples.len() {
        let input = [&samples[pos..]];
        let block = resampler
            .process_partial(Some(&input[..]), None)
            .map_err(resample_err)?;
        out.extend_from_slice(&block[0]);
    }

    while out.len() < expected + delay {
        let block = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(resample_err)?;
        if block[0].is_empty() {
            break;
        }
        out.extend_from_slice(&block[0]);
    }

    Ok(out.into_iter().skip(delay).take(expected).collect())
}

/// Post-processing pipeline configured for one engine
#[derive(Debug, Clone)]
pub struct PostProcessor {
    native_rate: u32,
    trim: TrimSettings,
    noise_gate: f32,
    leading_silence: Duration,
    peak_ceiling_dbfs: Option<f32>,
    mp3_bitrate_kbps: u32,
    writer: AudioWriter,
}

impl PostProcessor {
    /// Create a pipeline for audio produced at `native_rate`
    #[must_use]
    pub fn new(config: &AudioConfig, native_rate: u32) -> Self {
        Self {
            native_rate,
            trim: TrimSettings::new(config.trim_threshold, config.fade_ms, native_rate),
            noise_gate: config.noise_gate_threshold,
            leading_silence: Duration::from_millis(u64::from(config.leading_silence_ms)),
            peak_ceiling_dbfs: config.peak_normalize_dbfs,
            mp3_bitrate_kbps: config.mp3_bitrate_kbps,
            writer: AudioWriter::with_settings(EncodingSettings::new(native_rate)),
        }
    }

    /// Trim settings in use
    #[must_use]
    pub const fn trim_settings(&self) -> &TrimSettings {
        &self.trim
    }

    /// Trim one waveform
    #[must_use]
    pub fn trim_and_fade(&self, samples: &[f32]) -> Vec<f32> {
        trim_and_fade(samples, &self.trim)
    }

    /// Concatenate pieces, trimming every voiced piece and keeping silences exact
    #[must_use]
    pub fn assemble(&self, pieces: &[AudioPiece]) -> Vec<f32> {
        let total: usize = pieces
            .iter()
            .map(|piece| match piece {
                AudioPiece::Voiced(samples) => samples.len(),
                AudioPiece::Silence(len) => *len,
            })
            .sum();

        let mut waveform = Vec::with_capacity(total);
        for piece in pieces {
            match piece {
                AudioPiece::Voiced(samples) => waveform.extend(self.trim_and_fade(samples)),
                AudioPiece::Silence(len) => waveform.resize(waveform.len() + len, 0.0),
            }
        }
        waveform
    }

    /// Produce the final buffered response: assemble, pad, normalize,
    /// resample and encode.
    ///
    /// # Errors
    ///
    /// Returns an error if resampling or encoding fails.
    pub fn finalize(
        &self,
        pieces: &[AudioPiece],
        format: AudioFormat,
        sample_rate: u32,
    ) -> TtsResult<EncodedAudio> {
        let speech = self.assemble(pieces);

        let pad = samples_for(self.leading_silence, self.native_rate);
        let mut waveform = Vec::with_capacity(pad + speech.len());
        waveform.resize(pad, 0.0);
        waveform.extend(speech);

        if let Some(ceiling) = self.peak_ceiling_dbfs {
            peak_normalize(&mut waveform, ceiling);
        }

        let waveform = resample(&waveform, self.native_rate, sample_rate)?;
        debug!(
            "Post-processed {} pieces into {} samples at {} Hz",
            pieces.len(),
            waveform.len(),
            sample_rate
        );

        let settings = EncodingSettings::new(sample_rate).with_mp3_bitrate(self.mp3_bitrate_kbps);
        self.writer.encode(&waveform, format, Some(&settings))
    }

    /// Shaper for one streaming response
    #[must_use]
    pub fn stream_shaper(&self) -> StreamShaper {
        StreamShaper::new(self.noise_gate, self.trim)
    }
}

/// Per-chunk treatment of a streaming response.
///
/// Chunks whose peak is below the gate are replaced by silence of the same
/// length. One chunk is held back so the final chunk can be trimmed once the
/// stream ends.
#[derive(Debug, Clone)]
pub struct StreamShaper {
    noise_gate: f32,
    trim: TrimSettings,
    pending: Option<Vec<f32>>,
}

impl StreamShaper {
    /// Create a shaper
    #[must_use]
    pub fn new(noise_gate: f32, trim: TrimSettings) -> Self {
        Self {
            noise_gate,
            trim,
            pending: None,
        }
    }

    /// Accept the next model chunk; returns the previous one, ready to emit
    pub fn push(&mut self, mut chunk: Vec<f32>) -> Option<Vec<f32>> {
        if peak(&chunk) < self.noise_gate {
            chunk.iter_mut().for_each(|s| *s = 0.0);
        }
        self.pending.replace(chunk)
    }

    /// End of stream: the held-back chunk, trimmed and faded
    pub fn finish(&mut self) -> Option<Vec<f32>> {
        let last = trim_and_fade(&self.pending.take()?, &self.trim);
        (!last.is_empty()).then_some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TrimSettings {
        TrimSettings {
            threshold: 0.01,
            fade_samples: 100,
        }
    }

    fn speech_with_tail(speech: usize, tail: usize) -> Vec<f32> {
        let mut samples: Vec<f32> = (0..speech)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        samples.extend(std::iter::repeat(0.004).take(tail));
        samples
    }

    #[test]
    fn test_trim_cuts_after_fade_window() {
        let samples = speech_with_tail(1000, 5000);
        let trimmed = trim_and_fade(&samples, &settings());
        assert_eq!(trimmed.len(), 1100);
        assert_eq!(*trimmed.last().unwrap(), 0.0);
    }

    #[test]
    fn test_fade_envelope_is_monotonic() {
        let mut samples = vec![0.8_f32; 1000];
        samples.extend(vec![0.005_f32; 400]);
        let trimmed = trim_and_fade(&samples, &settings());

        let tail = &trimmed[trimmed.len() - 100..];
        for pair in tail.windows(2) {
            assert!(pair[1].abs() <= pair[0].abs());
        }
        assert_eq!(tail[99], 0.0);
        // untouched before the fade window
        assert_eq!(trimmed[trimmed.len() - 101], 0.8);
    }

    #[test]
    fn test_short_tail_fades_speech() {
        let samples = vec![0.5_f32; 50];
        let trimmed = trim_and_fade(&samples, &settings());
        assert_eq!(trimmed.len(), 50);
        assert!((trimmed[0] - 0.5 * 49.0 / 50.0).abs() < 1e-6);
        assert_eq!(trimmed[49], 0.0);
    }

    #[test]
    fn test_silent_waveform_trims_to_nothing() {
        assert!(trim_and_fade(&[0.001; 500], &settings()).is_empty());
        assert!(trim_and_fade(&[], &settings()).is_empty());
    }

    #[test]
    fn test_assemble_keeps_exact_silence() {
        let config = AudioConfig {
            fade_ms: 0,
            ..AudioConfig::default()
        };
        let processor = PostProcessor::new(&config, 1000);
        let pieces = vec![
            AudioPiece::Voiced(vec![0.5; 10]),
            AudioPiece::Silence(1000),
            AudioPiece::Voiced(vec![0.5; 10]),
        ];
        let waveform = processor.assemble(&pieces);
        assert_eq!(waveform.len(), 1020);
        assert!(waveform[10..1010].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_peak_normalize() {
        let mut samples = vec![0.1, -0.25, 0.2];
        peak_normalize(&mut samples, -1.5);
        let target = 10.0_f32.powf(-1.5 / 20.0);
        assert!((peak(&samples) - target).abs() < 1e-5);

        let mut silence = vec![0.0; 10];
        peak_normalize(&mut silence, -1.5);
        assert!(silence.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_resample_length() {
        let samples: Vec<f32> = (0..24_000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        let out = resample(&samples, 24_000, 16_000).unwrap();
        assert_eq!(out.len(), 16_000);

        let up = resample(&samples, 24_000, 48_000).unwrap();
        assert_eq!(up.len(), 48_000);

        let same = resample(&samples, 24_000, 24_000).unwrap();
        assert_eq!(same, samples);
    }

    #[test]
    fn test_finalize_pads_and_encodes() {
        let processor = PostProcessor::new(&AudioConfig::default(), 24_000);
        let pieces = vec![AudioPiece::Voiced(vec![0.5; 2400])];
        let encoded = processor.finalize(&pieces, AudioFormat::Pcm, 24_000).unwrap();

        assert_eq!(encoded.format, AudioFormat::Pcm);
        // 250 ms pad + 100 ms speech, two bytes per sample
        assert_eq!(encoded.bytes.len(), (6000 + 2400) * 2);
        assert!(encoded.bytes[..12_000].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stream_shaper_holds_back_and_trims_last() {
        let mut shaper = StreamShaper::new(0.003, settings());

        assert!(shaper.push(vec![0.5; 300]).is_none());
        let first = shaper.push(vec![0.001; 300]).unwrap();
        assert_eq!(first, vec![0.5; 300]);

        let gated = shaper.push(speech_with_tail(200, 1000)).unwrap();
        assert!(gated.iter().all(|&s| s == 0.0));
        assert_eq!(gated.len(), 300);

        let last = shaper.finish().unwrap();
        assert_eq!(last.len(), 300);
        assert_eq!(*last.last().unwrap(), 0.0);
        assert!(shaper.finish().is_none());
    }
}
