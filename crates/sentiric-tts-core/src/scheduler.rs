//! Single-worker inference scheduler.
//!
//! The inference primitive is not safe to call concurrently, so it is moved
//! into one dedicated OS thread and every call goes through a job queue.
//! Buffered jobs hold the worker for the inference only; post-processing
//! happens on the caller's side. Stream jobs hold the worker until the last
//! chunk is handed over or the consumer goes away, so a slow stream consumer
//! stalls every other request.

use crate::audio_writer::encode_pcm_s16le;
use crate::config::VramConfig;
use crate::error::{TtsError, TtsResult};
use crate::inference::{
    ComputeDevice, InferenceError, InferenceParams, InferencePrimitive, SpeakerLatents,
};
use crate::latent_cache::SpeakerLatentCache;
use crate::post_processor::{samples_for, AudioPiece, StreamShaper};
use crate::request::{SpeakerSelector, TuningParams};
use crate::ssml::{ProsodyOverrides, SsmlSegment};
use crate::vram::VramPressureManager;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const JOB_QUEUE_DEPTH: usize = 64;

/// One item of a stream: a PCM16 LE chunk or the error that ended the stream
pub type StreamItem = TtsResult<Vec<u8>>;

/// What the inference worker is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Waiting for a job
    Idle,
    /// Running a buffered job
    Inferencing,
    /// Feeding a stream consumer
    StreamingInferencing,
}

impl SchedulerState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Inferencing => 1,
            Self::StreamingInferencing => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Inferencing,
            2 => Self::StreamingInferencing,
            _ => Self::Idle,
        }
    }
}

/// Work description for one request
#[derive(Debug, Clone)]
pub struct InferenceJob {
    /// Ordered directives; plain text is a single text segment
    pub segments: Vec<SsmlSegment>,
    /// Resolved model language code
    pub language: String,
    /// Catalog speaker
    pub speaker: SpeakerSelector,
    /// Request tuning, before per-segment overrides
    pub tuning: TuningParams,
    /// Reference recordings for voice cloning; bypasses the latent store
    pub clone_references: Vec<PathBuf>,
}

impl InferenceJob {
    /// Job speaking `text` as a single segment
    #[must_use]
    pub fn plain<T: Into<String>, L: Into<String>>(
        text: T,
        language: L,
        speaker: SpeakerSelector,
        tuning: TuningParams,
    ) -> Self {
        Self {
            segments: vec![SsmlSegment::Text {
                content: text.into(),
                prosody: ProsodyOverrides::default(),
            }],
            language: language.into(),
            speaker,
            tuning,
            clone_references: Vec::new(),
        }
    }

    /// Use `paths` as cloning references
    #[must_use]
    pub fn with_clone_references(mut self, paths: Vec<PathBuf>) -> Self {
        self.clone_references = paths;
        self
    }

    /// All spoken text joined; streams ignore breaks and overrides
    #[must_use]
    pub fn spoken_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                SsmlSegment::Text { content, .. } => Some(content.as_str()),
                SsmlSegment::Break { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

enum Job {
    Buffered {
        job: InferenceJob,
        reply: oneshot::Sender<TtsResult<Vec<AudioPiece>>>,
    },
    Stream {
        job: InferenceJob,
        shaper: StreamShaper,
        chunks: mpsc::Sender<StreamItem>,
    },
}

#[derive(Debug, Default)]
struct Counters {
    jobs: AtomicU64,
    oom_retries: AtomicU64,
}

/// Handle to the inference worker
#[derive(Debug)]
pub struct SynthesisScheduler {
    jobs: mpsc::Sender<Job>,
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
    reclaims: Arc<AtomicU64>,
    device: ComputeDevice,
    native_rate: u32,
    _worker: JoinHandle<()>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered { job, .. } => f.debug_struct("Buffered").field("job", job).finish(),
            Self::Stream { job, .. } => f.debug_struct("Stream").field("job", job).finish(),
        }
    }
}

impl SynthesisScheduler {
    /// Move `primitive` onto a new worker thread.
    ///
    /// The primitive must already be bound to its device.
    ///
    /// # Errors
    ///
    /// Returns [`TtsError::ConcurrencyError`] if the thread cannot be spawned.
    pub fn spawn(
        primitive: Box<dyn InferencePrimitive>,
        latents: Arc<SpeakerLatentCache>,
        vram: VramConfig,
    ) -> TtsResult<Self> {
        let (jobs, queue) = mpsc::channel(JOB_QUEUE_DEPTH);
        let state = Arc::new(AtomicU8::new(SchedulerState::Idle.as_u8()));
        let counters = Arc::new(Counters::default());
        let vram = VramPressureManager::new(vram);
        let reclaims = vram.reclaim_counter();
        let device = primitive.device();
        let native_rate = primitive.sample_rate();

        let worker = Worker {
            primitive,
            latents,
            vram,
            native_rate,
            state: Arc::clone(&state),
            counters: Arc::clone(&counters),
        };

        let handle = std::thread::Builder::new()
            .name("tts-inference".to_string())
            .spawn(move || worker.run(queue))
            .map_err(|e| TtsError::concurrency(format!("Failed to spawn inference worker: {e}")))?;

        info!("Inference worker started on {} ({} Hz)", device, native_rate);

        Ok(Self {
            jobs,
            state,
            counters,
            reclaims,
            device,
            native_rate,
            _worker: handle,
        })
    }

    /// Run a buffered job and return its raw pieces
    ///
    /// # Errors
    ///
    /// Returns the job's inference error, or a concurrency error if the worker
    /// is gone.
    pub async fn synthesize(&self, job: InferenceJob) -> TtsResult<Vec<AudioPiece>> {
        let (reply, result) = oneshot::channel();
        self.submit(Job::Buffered { job, reply }).await?;
        result
            .await
            .map_err(|_| TtsError::concurrency("Inference worker dropped the request"))?
    }

    /// Queue a stream job; chunks arrive on the returned receiver.
    ///
    /// Dropping the receiver stops generation and frees the worker.
    ///
    /// # Errors
    ///
    /// Returns a concurrency error if the worker is gone.
    pub async fn synthesize_stream(
        &self,
        job: InferenceJob,
        shaper: StreamShaper,
        buffer_chunks: usize,
    ) -> TtsResult<mpsc::Receiver<StreamItem>> {
        let (chunks, receiver) = mpsc::channel(buffer_chunks.max(1));
        self.submit(Job::Stream {
            job,
            shaper,
            chunks,
        })
        .await?;
        Ok(receiver)
    }

    async fn submit(&self, job: Job) -> TtsResult<()> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| TtsError::concurrency("Inference worker has stopped"))
    }

    /// Current worker state
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Device the primitive runs on
    #[must_use]
    pub const fn device(&self) -> ComputeDevice {
        self.device
    }

    /// Native sample rate of the primitive
    #[must_use]
    pub const fn native_sample_rate(&self) -> u32 {
        self.native_rate
    }

    /// Jobs the worker has finished
    #[must_use]
    pub fn completed_jobs(&self) -> u64 {
        self.counters.jobs.load(Ordering::Relaxed)
    }

    /// Out-of-memory retries performed
    #[must_use]
    pub fn oom_retries(&self) -> u64 {
        self.counters.oom_retries.load(Ordering::Relaxed)
    }

    /// Device-memory reclaim cycles performed
    #[must_use]
    pub fn reclaims(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }
}

enum StreamEnd {
    Completed,
    ReceiverDropped,
    Failed {
        error: InferenceError,
        delivered: usize,
    },
}

struct Worker {
    primitive: Box<dyn InferencePrimitive>,
    latents: Arc<SpeakerLatentCache>,
    vram: VramPressureManager,
    native_rate: u32,
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(mut self, mut queue: mpsc::Receiver<Job>) {
        while let Some(job) = queue.blocking_recv() {
            match job {
                Job::Buffered { job, reply } => {
                    if reply.is_closed() {
                        debug!("Skipping buffered job, caller went away");
                        continue;
                    }
                    self.set_state(SchedulerState::Inferencing);
                    let result = catch_unwind(AssertUnwindSafe(|| self.run_buffered(&job)))
                        .unwrap_or_else(|panic| Err(panicked(panic.as_ref())));
                    self.set_state(SchedulerState::Idle);
                    if reply.send(result).is_err() {
                        debug!("Buffered caller went away before the result was ready");
                    }
                }
                Job::Stream {
                    job,
                    shaper,
                    chunks,
                } => {
                    if chunks.is_closed() {
                        debug!("Skipping stream job, receiver already dropped");
                        continue;
                    }
                    self.set_state(SchedulerState::StreamingInferencing);
                    let sender = chunks.clone();
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| self.run_stream(&job, &shaper, &chunks)));
                    drop(chunks);
                    if let Err(panic) = outcome {
                        let _ = sender.blocking_send(Err(panicked(panic.as_ref())));
                    }
                    drop(sender);
                    self.set_state(SchedulerState::Idle);
                }
            }
            self.counters.jobs.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Inference worker shutting down");
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn resolve_latents(&mut self, job: &InferenceJob) -> TtsResult<Arc<SpeakerLatents>> {
        self.latents
            .resolve(self.primitive.as_mut(), &job.speaker, &job.clone_references)
    }

    fn run_buffered(&mut self, job: &InferenceJob) -> TtsResult<Vec<AudioPiece>> {
        let latents = self.resolve_latents(job)?;

        let mut pieces = Vec::with_capacity(job.segments.len());
        for segment in &job.segments {
            match segment {
                SsmlSegment::Break { duration } => {
                    pieces.push(AudioPiece::Silence(samples_for(*duration, self.native_rate)));
                }
                SsmlSegment::Text { content, prosody } => {
                    if content.trim().is_empty() {
                        continue;
                    }
                    let params = prosody.apply(&job.tuning).to_inference_params(false);
                    let waveform = self.infer(content, &job.language, &latents, params)?;
                    pieces.push(AudioPiece::Voiced(waveform));
                }
            }
        }
        Ok(pieces)
    }

    fn infer(
        &mut self,
        text: &str,
        language: &str,
        latents: &SpeakerLatents,
        params: InferenceParams,
    ) -> TtsResult<Vec<f32>> {
        let first = self.primitive.inference(text, language, latents, &params);
        self.vram.after_inference(self.primitive.as_mut());

        match first {
            Ok(waveform) => Ok(waveform),
            Err(err) if err.is_out_of_memory() => {
                self.prepare_retry(&err);
                let retry = self
                    .primitive
                    .inference(text, language, latents, &params.conservative());
                self.vram.after_inference(self.primitive.as_mut());
                retry.map_err(exhausted)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn prepare_retry(&mut self, err: &InferenceError) {
        warn!("{}; reclaiming device memory and retrying once", err);
        self.counters.oom_retries.fetch_add(1, Ordering::Relaxed);
        self.vram.force_reclaim(self.primitive.as_mut());
    }

    fn run_stream(
        &mut self,
        job: &InferenceJob,
        shaper: &StreamShaper,
        chunks: &mpsc::Sender<StreamItem>,
    ) {
        let latents = match self.resolve_latents(job) {
            Ok(latents) => latents,
            Err(err) => {
                let _ = chunks.blocking_send(Err(err));
                return;
            }
        };

        let text = job.spoken_text();
        let params = job.tuning.to_inference_params(true);

        let end = match self.stream_once(&text, &job.language, &latents, params, shaper, chunks) {
            StreamEnd::Failed {
                error,
                delivered: 0,
            } if error.is_out_of_memory() => {
                self.prepare_retry(&error);
                let conservative = params.conservative();
                match self.stream_once(&text, &job.language, &latents, conservative, shaper, chunks) {
                    StreamEnd::Failed { error, .. } => {
                        let _ = chunks.blocking_send(Err(exhausted(error)));
                        return;
                    }
                    other => other,
                }
            }
            other => other,
        };

        match end {
            StreamEnd::Completed => debug!("Stream completed"),
            StreamEnd::ReceiverDropped => info!("Stream receiver dropped, releasing worker"),
            StreamEnd::Failed { error, delivered } => {
                error!("Stream failed after {} chunks: {}", delivered, error);
                let _ = chunks.blocking_send(Err(error.into()));
            }
        }
    }

    /// One pass over the primitive's chunk iterator
    fn stream_once(
        &mut self,
        text: &str,
        language: &str,
        latents: &SpeakerLatents,
        params: InferenceParams,
        template: &StreamShaper,
        chunks: &mpsc::Sender<StreamItem>,
    ) -> StreamEnd {
        let end = drive_stream(
            self.primitive.as_mut(),
            text,
            language,
            latents,
            &params,
            template.clone(),
            chunks,
        );
        self.vram.after_inference(self.primitive.as_mut());
        end
    }
}

fn drive_stream(
    primitive: &mut dyn InferencePrimitive,
    text: &str,
    language: &str,
    latents: &SpeakerLatents,
    params: &InferenceParams,
    mut shaper: StreamShaper,
    chunks: &mpsc::Sender<StreamItem>,
) -> StreamEnd {
    let iter = match primitive.inference_stream(text, language, latents, params) {
        Ok(iter) => iter,
        Err(error) => {
            return StreamEnd::Failed {
                error,
                delivered: 0,
            }
        }
    };

    let mut delivered = 0;
    for chunk in iter {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => return StreamEnd::Failed { error, delivered },
        };
        if let Some(ready) = shaper.push(chunk) {
            if chunks.blocking_send(Ok(encode_pcm_s16le(&ready))).is_err() {
                return StreamEnd::ReceiverDropped;
            }
            delivered += 1;
        }
    }

    if let Some(last) = shaper.finish() {
        if chunks.blocking_send(Ok(encode_pcm_s16le(&last))).is_err() {
            return StreamEnd::ReceiverDropped;
        }
    }
    StreamEnd::Completed
}

fn exhausted(err: InferenceError) -> TtsError {
    if err.is_out_of_memory() {
        TtsError::resource_exhaustion(format!("Still out of memory after conservative retry: {err}"))
    } else {
        err.into()
    }
}

fn panicked(payload: &(dyn Any + Send)) -> TtsError {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    error!("Inference worker job panicked: {}", message);
    TtsError::synthesis(format!("Inference panicked: {message}"))
}
