//! Synthesis engine facade.
//!
//! [`SynthesisEngine`] is the single long-lived object a transport layer holds.
//! It is cheap to clone; every clone talks to the same inference worker,
//! caches and speaker catalog.

use crate::audio_writer::{wav_duration_secs, AudioFormat};
use crate::config::{EngineConfig, TtsDevice};
use crate::content_cache::{CacheKey, CacheLookup, ContentCache};
use crate::error::{TtsError, TtsResult};
use crate::inference::{ComputeDevice, InferencePrimitive};
use crate::language::resolve_language;
use crate::latent_cache::SpeakerLatentCache;
use crate::post_processor::PostProcessor;
use crate::request::{SynthesisOutput, SynthesisRequest};
use crate::scheduler::{InferenceJob, SchedulerState, StreamItem, SynthesisScheduler};
use crate::speaker_catalog::{RefreshReport, SpeakerCatalog};
use crate::ssml::{self, ProsodyOverrides, SsmlSegment};
use crate::text_normalizer::normalize;
use futures::Stream;
use serde::Serialize;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine counters and current state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    /// Buffered requests accepted
    pub buffered_requests: u64,
    /// Stream requests accepted
    pub stream_requests: u64,
    /// Buffered responses served from the content cache
    pub cache_hits: u64,
    /// Cache-eligible requests that had to be synthesized
    pub cache_misses: u64,
    /// Conditioning-latent extractions
    pub latent_extractions: u64,
    /// Device-memory reclaim cycles
    pub memory_reclaims: u64,
    /// Out-of-memory retries
    pub oom_retries: u64,
    /// What the inference worker is doing
    pub scheduler_state: SchedulerState,
    /// Device inference runs on
    pub device: ComputeDevice,
    /// Native model sample rate
    pub native_sample_rate: u32,
    /// Speakers in the catalog
    pub speakers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    buffered: AtomicU64,
    streams: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    config: EngineConfig,
    catalog: Arc<SpeakerCatalog>,
    latents: Arc<SpeakerLatentCache>,
    scheduler: SynthesisScheduler,
    post: Arc<PostProcessor>,
    cache: Option<ContentCache>,
    counters: Counters,
}

/// Text-to-speech engine over one shared inference primitive
#[derive(Debug, Clone)]
pub struct SynthesisEngine {
    inner: Arc<Inner>,
}

impl SynthesisEngine {
    /// Build the engine and start the inference worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, no device can serve
    /// inference, or the latent store cannot be prepared.
    pub fn new(config: EngineConfig, mut primitive: Box<dyn InferencePrimitive>) -> TtsResult<Self> {
        config.validate()?;

        let available = primitive.available_devices();
        let device = config.device.resolve(&available)?;
        if config.device == TtsDevice::Cuda && device != ComputeDevice::Cuda {
            warn!(
                "{}; falling back to {}",
                TtsError::device_unavailable("CUDA requested but not available"),
                device
            );
        }
        primitive.bind_device(device).map_err(|e| {
            TtsError::device_unavailable(format!("Failed to bind model to {device}: {e}"))
        })?;

        let native_rate = primitive.sample_rate();
        if native_rate != config.native_sample_rate {
            warn!(
                "Model reports {} Hz but configuration says {} Hz; using the model rate",
                native_rate, config.native_sample_rate
            );
        }

        let catalog = Arc::new(SpeakerCatalog::open(
            config.speakers_dir.clone(),
            config.catalog_ttl(),
        ));
        let latents = Arc::new(SpeakerLatentCache::new(
            Arc::clone(&catalog),
            config.latents_dir(),
            config.default_speaker_wav.clone(),
        )?);

        let cache = if config.cache_enabled {
            Some(ContentCache::new(&config.cache_dir)?)
        } else {
            None
        };

        let scheduler =
            SynthesisScheduler::spawn(primitive, Arc::clone(&latents), config.vram.clone())?;
        let post = Arc::new(PostProcessor::new(&config.audio, native_rate));

        info!(
            "Synthesis engine ready: device={}, speakers={} ({}), cache={}",
            device,
            catalog.len(),
            config.speakers_dir.display(),
            cache
                .as_ref()
                .map_or_else(|| "disabled".to_string(), |c| c.dir().display().to_string())
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                latents,
                scheduler,
                post,
                cache,
                counters: Counters::default(),
            }),
        })
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Synthesize a fully buffered response.
    ///
    /// Plain-text requests are served from the content cache when possible;
    /// SSML and voice-cloning requests always run inference.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad requests, resource exhaustion when
    /// the device runs out of memory twice, or a synthesis/audio error.
    pub async fn synthesize(&self, request: SynthesisRequest) -> TtsResult<SynthesisOutput> {
        let inner = &self.inner;
        request.validate(inner.config.max_text_length)?;
        let language = resolve_language(&request.language, &request.text)?;

        let (segments, cache_key) = if ssml::is_markup(&request.text) {
            debug!("Request contains SSML, bypassing the content cache");
            (markup_segments(&request, &language), None)
        } else {
            let text = normalize(&request.text, &language);
            let key = (inner.cache.is_some() && !request.is_voice_clone()).then(|| {
                CacheKey::new(
                    &text,
                    &language,
                    &request.speaker,
                    &request.tuning,
                    request.output_format,
                    request.sample_rate,
                )
            });
            let segment = SsmlSegment::Text {
                content: text,
                prosody: ProsodyOverrides::default(),
            };
            (vec![segment], key)
        };
        ensure_speakable(&segments)?;

        inner.counters.buffered.fetch_add(1, Ordering::Relaxed);
        self.refresh_catalog_if_stale().await;

        if let Some(key) = &cache_key {
            if let Some(bytes) = self.cache_lookup(key).await {
                inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                info!("Cache hit {}", key);
                let format = match request.output_format {
                    AudioFormat::Pcm => AudioFormat::Pcm,
                    requested => AudioFormat::sniff(&bytes).unwrap_or(requested),
                };
                return Ok(output(bytes, format, request.sample_rate, true));
            }
            inner.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss {}", key);
        }

        let job = InferenceJob {
            segments,
            language,
            speaker: request.speaker.clone(),
            tuning: request.tuning,
            clone_references: request.reference_audio.clone(),
        };
        let pieces = inner.scheduler.synthesize(job).await?;

        let post = Arc::clone(&inner.post);
        let (format, sample_rate) = (request.output_format, request.sample_rate);
        let encoded = tokio::task::spawn_blocking(move || post.finalize(&pieces, format, sample_rate))
            .await
            .map_err(|e| TtsError::concurrency(format!("Post-processing task failed: {e}")))??;

        if let Some(key) = cache_key {
            self.cache_store(key, encoded.bytes.clone()).await;
        }

        Ok(output(encoded.bytes, encoded.format, sample_rate, false))
    }

    /// Start an incremental synthesis.
    ///
    /// Chunks are raw PCM16 LE at the model's native rate. Markup is stripped
    /// to plain text. The stream owns the inference worker until it is
    /// exhausted or dropped.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad requests, or a concurrency error if
    /// the worker is gone.
    pub async fn synthesize_stream(&self, request: SynthesisRequest) -> TtsResult<AudioStream> {
        let inner = &self.inner;
        request.validate(inner.config.max_text_length)?;
        let language = resolve_language(&request.language, &request.text)?;

        let text = if ssml::is_markup(&request.text) {
            normalize(&ssml::strip_tags(&request.text), &language)
        } else {
            normalize(&request.text, &language)
        };
        if text.trim().is_empty() {
            return Err(TtsError::validation("Text cannot be empty"));
        }

        inner.counters.streams.fetch_add(1, Ordering::Relaxed);
        self.refresh_catalog_if_stale().await;

        let job = InferenceJob::plain(text, language, request.speaker, request.tuning)
            .with_clone_references(request.reference_audio);
        let receiver = inner
            .scheduler
            .synthesize_stream(job, inner.post.stream_shaper(), inner.config.stream_buffer_chunks)
            .await?;

        Ok(AudioStream {
            receiver,
            sample_rate: inner.scheduler.native_sample_rate(),
        })
    }

    /// Serve `request` buffered or streamed, as its `stream` flag asks
    ///
    /// # Errors
    ///
    /// Same as [`Self::synthesize`] and [`Self::synthesize_stream`].
    pub async fn dispatch(&self, request: SynthesisRequest) -> TtsResult<SynthesisResponse> {
        if request.stream {
            self.synthesize_stream(request).await.map(SynthesisResponse::Stream)
        } else {
            self.synthesize(request).await.map(SynthesisResponse::Buffered)
        }
    }

    /// Speakers and their styles
    #[must_use]
    pub fn list_speakers(&self) -> BTreeMap<String, Vec<String>> {
        if self.inner.catalog.is_stale() {
            self.inner.catalog.refresh(false);
        }
        self.inner.catalog.list()
    }

    /// Rescan the speaker directory; without `force` only when the TTL expired
    ///
    /// # Errors
    ///
    /// Returns a concurrency error if the scan task panicked.
    pub async fn refresh_speaker_catalog(&self, force: bool) -> TtsResult<RefreshReport> {
        let catalog = Arc::clone(&self.inner.catalog);
        tokio::task::spawn_blocking(move || catalog.refresh(force))
            .await
            .map_err(|e| TtsError::concurrency(format!("Catalog refresh task failed: {e}")))
    }

    /// Counters and current state
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        EngineStats {
            buffered_requests: inner.counters.buffered.load(Ordering::Relaxed),
            stream_requests: inner.counters.streams.load(Ordering::Relaxed),
            cache_hits: inner.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: inner.counters.cache_misses.load(Ordering::Relaxed),
            latent_extractions: inner.latents.extraction_count(),
            memory_reclaims: inner.scheduler.reclaims(),
            oom_retries: inner.scheduler.oom_retries(),
            scheduler_state: inner.scheduler.state(),
            device: inner.scheduler.device(),
            native_sample_rate: inner.scheduler.native_sample_rate(),
            speakers: inner.catalog.len(),
        }
    }

    async fn refresh_catalog_if_stale(&self) {
        if !self.inner.catalog.is_stale() {
            return;
        }
        let catalog = Arc::clone(&self.inner.catalog);
        if let Err(e) = tokio::task::spawn_blocking(move || catalog.refresh(false)).await {
            warn!("Speaker catalog refresh failed: {}", e);
        }
    }

    async fn cache_lookup(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let cache = self.inner.cache.clone()?;
        let key = key.clone();
        let lookup = tokio::task::spawn_blocking(move || cache.get(&key))
            .await
            .map_err(|e| TtsError::concurrency(e.to_string()))
            .and_then(|result| result);

        match lookup {
            Ok(CacheLookup::Hit(bytes)) => Some(bytes),
            Ok(CacheLookup::Miss) => None,
            Err(e) => {
                warn!("Cache read failed, synthesizing uncached: {}", e);
                None
            }
        }
    }

    async fn cache_store(&self, key: CacheKey, bytes: Vec<u8>) {
        let Some(cache) = self.inner.cache.clone() else {
            return;
        };
        let stored = tokio::task::spawn_blocking(move || cache.put(&key, &bytes))
            .await
            .map_err(|e| TtsError::concurrency(e.to_string()))
            .and_then(|result| result);
        if let Err(e) = stored {
            warn!("Cache write failed: {}", e);
        }
    }
}

fn ensure_speakable(segments: &[SsmlSegment]) -> TtsResult<()> {
    let speakable = segments.iter().any(|segment| {
        matches!(segment, SsmlSegment::Text { content, .. } if !content.trim().is_empty())
    });
    if speakable {
        Ok(())
    } else {
        Err(TtsError::validation("Text cannot be empty"))
    }
}

fn markup_segments(request: &SynthesisRequest, language: &str) -> Vec<SsmlSegment> {
    ssml::parse(&request.text, &request.tuning)
        .into_iter()
        .map(|segment| match segment {
            SsmlSegment::Text { content, prosody } => SsmlSegment::Text {
                content: normalize(&content, language),
                prosody,
            },
            other => other,
        })
        .collect()
}

fn output(audio: Vec<u8>, format: AudioFormat, sample_rate: u32, cache_hit: bool) -> SynthesisOutput {
    let duration_secs = match format {
        AudioFormat::Wav => wav_duration_secs(&audio),
        AudioFormat::Pcm => Some(audio.len() as f32 / 2.0 / sample_rate as f32),
        AudioFormat::Mp3 | AudioFormat::Opus => None,
    };
    SynthesisOutput {
        audio,
        format,
        sample_rate,
        cache_hit,
        duration_secs,
    }
}

/// Result of [`SynthesisEngine::dispatch`]
#[derive(Debug)]
pub enum SynthesisResponse {
    /// Fully buffered audio
    Buffered(SynthesisOutput),
    /// Incremental PCM chunks
    Stream(AudioStream),
}

/// Incremental synthesis output.
///
/// Yields PCM16 LE chunks in order. An `Err` item ends the stream. Dropping
/// the stream tells the inference worker to stop.
#[derive(Debug)]
pub struct AudioStream {
    receiver: mpsc::Receiver<StreamItem>,
    sample_rate: u32,
}

impl AudioStream {
    /// Next chunk, or `None` once the stream is finished
    pub async fn next_chunk(&mut self) -> Option<StreamItem> {
        self.receiver.recv().await
    }

    /// Sample rate of the PCM chunks
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Wire format of the chunks
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        AudioFormat::Pcm
    }

    /// Drain the stream into one buffer
    ///
    /// # Errors
    ///
    /// Returns the first error item.
    pub async fn collect_all(mut self) -> TtsResult<Vec<u8>> {
        let mut audio = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            audio.extend(chunk?);
        }
        Ok(audio)
    }
}

impl Stream for AudioStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
