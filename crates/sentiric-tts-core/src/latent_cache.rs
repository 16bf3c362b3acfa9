//! Speaker conditioning latents, memoized in memory and persisted on disk.
//!
//! Latents are keyed by the SHA-256 of the resolved recording *path*. Replacing
//! a recording in place keeps serving the old latents until the store entry
//! is deleted.

use crate::error::{TtsError, TtsResult};
use crate::inference::{InferencePrimitive, SpeakerLatents};
use crate::request::SpeakerSelector;
use crate::speaker_catalog::SpeakerCatalog;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name of the generated placeholder recording inside the latent store
pub const FALLBACK_RECORDING: &str = "system_default.wav";

const FALLBACK_TONE_HZ: f32 = 220.0;
const FALLBACK_SECONDS: u32 = 3;
const FALLBACK_AMPLITUDE: f32 = 0.3;

/// Stable identity of a recording for the latent store
#[must_use]
pub fn latent_key(recording: &Path) -> String {
    format!(
        "{:x}",
        Sha256::digest(recording.to_string_lossy().as_bytes())
    )
}

/// Resolves selectors to conditioning latents.
///
/// Every call that extracts latents takes the inference primitive by mutable
/// reference, so it can only run on the inference worker.
#[derive(Debug)]
pub struct SpeakerLatentCache {
    catalog: Arc<SpeakerCatalog>,
    store_dir: PathBuf,
    default_recording: Option<PathBuf>,
    fallback_recording: PathBuf,
    memory: Mutex<HashMap<String, Arc<SpeakerLatents>>>,
    extractions: AtomicU64,
}

impl SpeakerLatentCache {
    /// Open the latent store and make sure a fallback recording exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be created or the
    /// placeholder recording cannot be generated.
    pub fn new<P: Into<PathBuf>>(
        catalog: Arc<SpeakerCatalog>,
        store_dir: P,
        default_recording: Option<PathBuf>,
    ) -> TtsResult<Self> {
        let store_dir = store_dir.into();
        std::fs::create_dir_all(&store_dir).map_err(|e| {
            TtsError::configuration(format!(
                "Cannot create latent store {}: {e}",
                store_dir.display()
            ))
        })?;

        let default_recording = match default_recording {
            Some(path) if path.is_file() => Some(path),
            Some(path) => {
                warn!(
                    "Configured default speaker recording {} does not exist",
                    path.display()
                );
                None
            }
            None => None,
        };

        let fallback_recording = store_dir.join(FALLBACK_RECORDING);
        if !fallback_recording.is_file() {
            write_placeholder_recording(&fallback_recording, crate::NATIVE_SAMPLE_RATE)?;
            info!(
                "Generated placeholder speaker recording at {}",
                fallback_recording.display()
            );
        }

        Ok(Self {
            catalog,
            store_dir,
            default_recording,
            fallback_recording,
            memory: Mutex::new(HashMap::new()),
            extractions: AtomicU64::new(0),
        })
    }

    /// Number of latent extractions performed by this process
    #[must_use]
    pub fn extraction_count(&self) -> u64 {
        self.extractions.load(Ordering::Relaxed)
    }

    /// Recording backing `selector`, falling back to the system default.
    ///
    /// Never fails: unknown selectors resolve to the configured default
    /// recording, then the first catalog recording, then the placeholder.
    #[must_use]
    pub fn resolve_recording(&self, selector: &SpeakerSelector) -> PathBuf {
        if let Some(path) = self.catalog.locate(selector) {
            return path;
        }

        if !selector.is_system_default() {
            warn!(
                "{}; using the system default speaker",
                TtsError::speaker_not_found(selector.to_string())
            );
        }

        self.default_recording
            .clone()
            .or_else(|| self.catalog.first_recording())
            .unwrap_or_else(|| self.fallback_recording.clone())
    }

    /// Latents for `selector`, or freshly extracted from `clone_references`
    /// when any are given.
    ///
    /// # Errors
    ///
    /// Returns an error only if latent extraction itself fails.
    pub fn resolve(
        &self,
        primitive: &mut dyn InferencePrimitive,
        selector: &SpeakerSelector,
        clone_references: &[PathBuf],
    ) -> TtsResult<Arc<SpeakerLatents>> {
        if !clone_references.is_empty() {
            debug!(
                "Extracting latents from {} reference recordings",
                clone_references.len()
            );
            return Ok(Arc::new(self.extract(primitive, clone_references)?));
        }

        let recording = self.resolve_recording(selector);
        let key = latent_key(&recording);

        if let Some(latents) = self.memory.lock().get(&key) {
            return Ok(Arc::clone(latents));
        }

        let latents = match self.load(&key) {
            Some(latents) => {
                debug!("Loaded latents for {} from store", recording.display());
                latents
            }
            None => {
                info!("Computing latents for {}", recording.display());
                let latents = self.extract(primitive, std::slice::from_ref(&recording))?;
                if let Err(e) = self.persist(&key, &latents) {
                    warn!("{}", e);
                }
                latents
            }
        };

        let latents = Arc::new(latents);
        self.memory.lock().insert(key, Arc::clone(&latents));
        Ok(latents)
    }

    fn extract(
        &self,
        primitive: &mut dyn InferencePrimitive,
        recordings: &[PathBuf],
    ) -> TtsResult<SpeakerLatents> {
        let latents = primitive.conditioning_latents(recordings)?;
        self.extractions.fetch_add(1, Ordering::Relaxed);
        if !latents.is_valid() {
            return Err(TtsError::synthesis(
                "Latent extraction returned malformed tensors",
            ));
        }
        Ok(latents)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.store_dir.join(format!("{key}.json"))
    }

    fn load(&self, key: &str) -> Option<SpeakerLatents> {
        let path = self.entry_path(key);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(
                    "{}",
                    TtsError::cache_io(format!("Failed to read {}: {e}", path.display()))
                );
                return None;
            }
        };

        match serde_json::from_slice::<SpeakerLatents>(&content) {
            Ok(latents) if latents.is_valid() => Some(latents),
            Ok(_) => {
                warn!("Latent entry {} is malformed, recomputing", path.display());
                None
            }
            Err(e) => {
                warn!("Latent entry {} is corrupt ({}), recomputing", path.display(), e);
                None
            }
        }
    }

    fn persist(&self, key: &str, latents: &SpeakerLatents) -> TtsResult<()> {
        let path = self.entry_path(key);
        let tmp = self
            .store_dir
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));
        let io_err = |e: std::io::Error| {
            TtsError::cache_io(format!("Failed to persist latents {}: {e}", path.display()))
        };

        let json = serde_json::to_vec(latents)?;
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            io_err(e)
        })
    }
}

/// Write a fixed-tone mono WAV used when no speaker recording exists at all
fn write_placeholder_recording(path: &Path, sample_rate: u32) -> TtsResult<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let fatal = |e: hound::Error| {
        TtsError::configuration(format!(
            "Cannot create fallback speaker recording {}: {e}",
            path.display()
        ))
    };

    let mut writer = hound::WavWriter::create(path, spec).map_err(fatal)?;
    let total = sample_rate * FALLBACK_SECONDS;
    for i in 0..total {
        let t = i as f32 / sample_rate as f32;
        let sample = (2.0 * std::f32::consts::PI * FALLBACK_TONE_HZ * t).sin() * FALLBACK_AMPLITUDE;
        writer
            .write_sample(crate::audio_writer::to_i16(sample))
            .map_err(fatal)?;
    }
    writer.finalize().map_err(fatal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{ChunkIter, ComputeDevice, InferenceParams, InferenceResult};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Extractor {
        calls: Vec<Vec<PathBuf>>,
    }

    impl InferencePrimitive for Extractor {
        fn bind_device(&mut self, _device: ComputeDevice) -> InferenceResult<()> {
            Ok(())
        }

        fn device(&self) -> ComputeDevice {
            ComputeDevice::Cpu
        }

        fn inference(
            &mut self,
            _text: &str,
            _language: &str,
            _latents: &SpeakerLatents,
            _params: &InferenceParams,
        ) -> InferenceResult<Vec<f32>> {
            Ok(Vec::new())
        }

        fn inference_stream<'a>(
            &'a mut self,
            _text: &str,
            _language: &str,
            _latents: &SpeakerLatents,
            _params: &InferenceParams,
        ) -> InferenceResult<ChunkIter<'a>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn conditioning_latents(&mut self, paths: &[PathBuf]) -> InferenceResult<SpeakerLatents> {
            self.calls.push(paths.to_vec());
            let seed = paths.len() as f32;
            Ok(SpeakerLatents::from_vectors(vec![seed; 16], vec![seed; 4]))
        }
    }

    fn setup(with_speakers: bool) -> (TempDir, SpeakerLatentCache) {
        let dir = TempDir::new().unwrap();
        let speakers = dir.path().join("speakers");
        std::fs::create_dir_all(&speakers).unwrap();
        if with_speakers {
            std::fs::write(speakers.join("Ana.wav"), b"RIFF").unwrap();
        }
        let catalog = Arc::new(SpeakerCatalog::open(&speakers, Duration::from_secs(300)));
        let cache = SpeakerLatentCache::new(catalog, dir.path().join("latents"), None).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_latents_extracted_once() {
        let (_dir, cache) = setup(true);
        let mut primitive = Extractor::default();
        let selector = SpeakerSelector::parse("Ana");

        let first = cache.resolve(&mut primitive, &selector, &[]).unwrap();
        let second = cache.resolve(&mut primitive, &selector, &[]).unwrap();

        assert_eq!(first, second);
        assert_eq!(primitive.calls.len(), 1);
        assert_eq!(cache.extraction_count(), 1);
    }

    #[test]
    fn test_store_survives_restart() {
        let (dir, cache) = setup(true);
        let mut primitive = Extractor::default();
        let selector = SpeakerSelector::parse("Ana");
        cache.resolve(&mut primitive, &selector, &[]).unwrap();

        let catalog = Arc::new(SpeakerCatalog::open(
            dir.path().join("speakers"),
            Duration::from_secs(300),
        ));
        let reopened = SpeakerLatentCache::new(catalog, dir.path().join("latents"), None).unwrap();
        reopened.resolve(&mut primitive, &selector, &[]).unwrap();
        assert_eq!(primitive.calls.len(), 1);
    }

    #[test]
    fn test_corrupt_entry_is_recomputed() {
        let (dir, cache) = setup(true);
        let mut primitive = Extractor::default();
        let recording = dir.path().join("speakers/Ana.wav");
        let entry = dir
            .path()
            .join("latents")
            .join(format!("{}.json", latent_key(&recording)));
        std::fs::write(&entry, b"{not json").unwrap();

        let latents = cache
            .resolve(&mut primitive, &SpeakerSelector::parse("Ana"), &[])
            .unwrap();
        assert!(latents.is_valid());
        assert_eq!(primitive.calls.len(), 1);
        let stored: SpeakerLatents =
            serde_json::from_slice(&std::fs::read(&entry).unwrap()).unwrap();
        assert_eq!(&stored, latents.as_ref());
    }

    #[test]
    fn test_clone_references_bypass_cache() {
        let (_dir, cache) = setup(true);
        let mut primitive = Extractor::default();
        let refs = vec![PathBuf::from("/tmp/a.wav"), PathBuf::from("/tmp/b.wav")];

        cache
            .resolve(&mut primitive, &SpeakerSelector::default(), &refs)
            .unwrap();
        cache
            .resolve(&mut primitive, &SpeakerSelector::default(), &refs)
            .unwrap();
        assert_eq!(primitive.calls.len(), 2);
        assert_eq!(primitive.calls[0], refs);
    }

    #[test]
    fn test_unknown_speaker_falls_back() {
        let (dir, cache) = setup(true);
        assert_eq!(
            cache.resolve_recording(&SpeakerSelector::parse("ZZZ-unknown")),
            dir.path().join("speakers/Ana.wav")
        );
    }

    #[test]
    fn test_empty_catalog_uses_placeholder() {
        let (dir, cache) = setup(false);
        let placeholder = dir.path().join("latents").join(FALLBACK_RECORDING);
        assert_eq!(
            cache.resolve_recording(&SpeakerSelector::parse("anyone")),
            placeholder
        );

        let reader = hound::WavReader::open(&placeholder).unwrap();
        assert_eq!(reader.spec().sample_rate, crate::NATIVE_SAMPLE_RATE);
        assert_eq!(reader.duration(), crate::NATIVE_SAMPLE_RATE * FALLBACK_SECONDS);

        let mut primitive = Extractor::default();
        let latents = cache
            .resolve(&mut primitive, &SpeakerSelector::parse("anyone"), &[])
            .unwrap();
        assert!(latents.is_valid());
        assert_eq!(primitive.calls[0], vec![placeholder]);
    }

    #[test]
    fn test_latent_key_is_path_based() {
        let a = latent_key(Path::new("/srv/speakers/Ana.wav"));
        assert_eq!(a, latent_key(Path::new("/srv/speakers/Ana.wav")));
        assert_ne!(a, latent_key(Path::new("/srv/speakers/Bora.wav")));
        assert_eq!(a.len(), 64);
    }
}
