//! Shared fixtures: a deterministic stand-in for the voice model and helpers
//! for on-disk speaker assets.

#![allow(dead_code)]

use parking_lot::Mutex;
use sentiric_tts_core::{
    ChunkIter, ComputeDevice, EngineConfig, InferenceError, InferenceParams, InferencePrimitive,
    InferenceResult, MemoryUsage, SpeakerLatents, NATIVE_SAMPLE_RATE,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Amplitude of trailing low-level "ghost" samples appended to every waveform
pub const GHOST_LEVEL: f32 = 0.002;

/// Samples per streamed chunk
pub const STREAM_CHUNK: usize = 2_400;

/// Chunks per stream
pub const STREAM_CHUNKS: usize = 5;

/// What the mock model observed
#[derive(Debug, Default)]
pub struct ModelProbe {
    pub inference_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub latent_calls: AtomicUsize,
    pub releases: AtomicUsize,
    oom_budget: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    intervals: Mutex<Vec<(Instant, Instant)>>,
    params: Mutex<Vec<InferenceParams>>,
    texts: Mutex<Vec<String>>,
}

impl ModelProbe {
    /// Make the next `n` inference calls fail with out-of-memory
    pub fn fail_next_with_oom(&self, n: usize) {
        self.oom_budget.store(n, Ordering::SeqCst);
    }

    pub fn inference_calls(&self) -> usize {
        self.inference_calls.load(Ordering::SeqCst)
    }

    pub fn latent_calls(&self) -> usize {
        self.latent_calls.load(Ordering::SeqCst)
    }

    /// Highest number of primitive calls observed running at once
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.intervals.lock().clone()
    }

    pub fn params(&self) -> Vec<InferenceParams> {
        self.params.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    fn enter(&self) -> Instant {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        Instant::now()
    }

    fn leave(&self, started: Instant) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.intervals.lock().push((started, Instant::now()));
    }

    fn take_oom(&self) -> bool {
        self.oom_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Deterministic voice model double
pub struct MockVoiceModel {
    probe: Arc<ModelProbe>,
    devices: Vec<ComputeDevice>,
    device: ComputeDevice,
    delay: Duration,
}

impl MockVoiceModel {
    pub fn new() -> (Self, Arc<ModelProbe>) {
        let probe = Arc::new(ModelProbe::default());
        let model = Self {
            probe: Arc::clone(&probe),
            devices: vec![ComputeDevice::Cpu],
            device: ComputeDevice::Cpu,
            delay: Duration::ZERO,
        };
        (model, probe)
    }

    /// Sleep this long inside every inference call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Devices reported to the engine
    pub fn with_devices(mut self, devices: Vec<ComputeDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn boxed(self) -> Box<dyn InferencePrimitive> {
        Box::new(self)
    }
}

/// Number of voiced samples the mock produces for `text`
pub fn voiced_len(text: &str) -> usize {
    4_800 + text.chars().count() * 240
}

/// 440 Hz tone at half scale, followed by ghost samples
pub fn tone(text: &str) -> Vec<f32> {
    let rate = NATIVE_SAMPLE_RATE as f32;
    let mut samples: Vec<f32> = (0..voiced_len(text))
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate).sin())
        .collect();
    samples.extend(std::iter::repeat(GHOST_LEVEL).take(480));
    samples
}

/// Constant level of stream chunk `index` for `text`
pub fn stream_level(text: &str, index: usize) -> f32 {
    0.1 + 0.05 * (text.chars().count() % 8) as f32 + 0.01 * index as f32
}

impl InferencePrimitive for MockVoiceModel {
    fn available_devices(&self) -> Vec<ComputeDevice> {
        self.devices.clone()
    }

    fn bind_device(&mut self, device: ComputeDevice) -> InferenceResult<()> {
        self.device = device;
        Ok(())
    }

    fn device(&self) -> ComputeDevice {
        self.device
    }

    fn inference(
        &mut self,
        text: &str,
        _language: &str,
        latents: &SpeakerLatents,
        params: &InferenceParams,
    ) -> InferenceResult<Vec<f32>> {
        assert!(latents.is_valid(), "engine passed invalid latents");
        let started = self.probe.enter();
        self.probe.inference_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.params.lock().push(*params);
        self.probe.texts.lock().push(text.to_string());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = if self.probe.take_oom() {
            Err(InferenceError::out_of_memory("CUDA out of memory (mock)"))
        } else {
            Ok(tone(text))
        };
        self.probe.leave(started);
        result
    }

    fn inference_stream<'a>(
        &'a mut self,
        text: &str,
        _language: &str,
        _latents: &SpeakerLatents,
        params: &InferenceParams,
    ) -> InferenceResult<ChunkIter<'a>> {
        self.probe.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.params.lock().push(*params);
        self.probe.texts.lock().push(text.to_string());
        if self.probe.take_oom() {
            return Err(InferenceError::out_of_memory("CUDA out of memory (mock)"));
        }

        let started = self.probe.enter();
        let probe = Arc::clone(&self.probe);
        let delay = self.delay;
        let text = text.to_string();
        let chunks = StreamChunks {
            probe,
            started,
            delay,
            text,
            next: 0,
        };
        Ok(Box::new(chunks))
    }

    fn conditioning_latents(&mut self, audio_paths: &[PathBuf]) -> InferenceResult<SpeakerLatents> {
        self.probe.latent_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(missing) = audio_paths.iter().find(|p| !p.is_file()) {
            return Err(InferenceError::failed(format!(
                "reference recording {} not found",
                missing.display()
            )));
        }
        let seed = audio_paths.len() as f32;
        Ok(SpeakerLatents::from_vectors(vec![0.1 * seed; 32], vec![0.2; 8]))
    }

    fn memory_usage(&self) -> Option<MemoryUsage> {
        self.device.is_accelerator().then_some(MemoryUsage {
            used_bytes: 512 * 1024 * 1024,
            total_bytes: 1024 * 1024 * 1024,
        })
    }

    fn release_device_cache(&mut self) {
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Chunk generator; records the call interval when dropped
struct StreamChunks {
    probe: Arc<ModelProbe>,
    started: Instant,
    delay: Duration,
    text: String,
    next: usize,
}

impl Iterator for StreamChunks {
    type Item = InferenceResult<Vec<f32>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= STREAM_CHUNKS {
            return None;
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay / STREAM_CHUNKS as u32);
        }
        let level = stream_level(&self.text, self.next);
        self.next += 1;
        Some(Ok(vec![level; STREAM_CHUNK]))
    }
}

impl Drop for StreamChunks {
    fn drop(&mut self) {
        self.probe.leave(self.started);
    }
}

/// Engine configuration rooted in `dir`
pub fn engine_config(dir: &Path) -> EngineConfig {
    let config = EngineConfig::with_root(dir);
    std::fs::create_dir_all(&config.speakers_dir).expect("create speakers dir");
    config
}

/// Write a short reference recording to `path`
pub fn write_recording(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create recording dir");
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: NATIVE_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    for i in 0..2_400 {
        let sample = (i as f32 * 0.05).sin() * 8_000.0;
        writer.write_sample(sample as i16).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
}

/// Decode 16-bit WAV bytes into normalized samples
pub fn decode_wav(bytes: &[u8]) -> (u32, Vec<f32>) {
    let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes)).expect("valid wav");
    let rate = reader.spec().sample_rate;
    let samples = reader
        .samples::<i16>()
        .map(|s| f32::from(s.expect("sample")) / 32_767.0)
        .collect();
    (rate, samples)
}

/// Decode PCM16 LE bytes
pub fn decode_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Route engine logs to the test output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
