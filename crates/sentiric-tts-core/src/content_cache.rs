//! Content-addressed store of finished buffered responses.
//!
//! One file per key under the cache directory. Entries are never evicted;
//! growth is bounded only by whoever manages the directory.

use crate::audio_writer::AudioFormat;
use crate::error::{TtsError, TtsResult};
use crate::request::{SpeakerSelector, TuningParams};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Entries shorter than this cannot hold any valid response and are discarded
pub const MIN_ENTRY_BYTES: u64 = 44;

const ENTRY_EXTENSION: &str = "bin";

/// Hex-encoded SHA-256 over the canonical request parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for the parameters that determine a buffered response
    #[must_use]
    pub fn new(
        normalized_text: &str,
        language: &str,
        speaker: &SpeakerSelector,
        tuning: &TuningParams,
        format: AudioFormat,
        sample_rate: u32,
    ) -> Self {
        // Field order is the serialization order; keep it alphabetical.
        #[derive(Serialize)]
        struct Canonical<'a> {
            format: &'a str,
            language: &'a str,
            sample_rate: u32,
            speaker: String,
            speed: f32,
            temperature: f32,
            text: &'a str,
        }

        let canonical = Canonical {
            format: format.extension(),
            language,
            sample_rate,
            speaker: speaker.to_string(),
            speed: tuning.speed,
            temperature: tuning.temperature,
            text: normalized_text,
        };

        // Serializing a struct of strings and numbers cannot fail.
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(format!("{:x}", Sha256::digest(&json)))
    }

    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a cache read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Stored response bytes
    Hit(Vec<u8>),
    /// Nothing usable stored under the key
    Miss,
}

/// File-per-key response cache
#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
}

impl ContentCache {
    /// Open (and create) the cache directory
    ///
    /// # Errors
    ///
    /// Returns [`TtsError::CacheIoError`] if the directory cannot be created.
    pub fn new<P: Into<PathBuf>>(dir: P) -> TtsResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            TtsError::cache_io(format!("Failed to create {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    /// Cache directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`
    #[must_use]
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    /// Read the entry for `key`.
    ///
    /// A truncated entry is deleted and reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns [`TtsError::CacheIoError`] if an existing entry cannot be read.
    pub fn get(&self, key: &CacheKey) -> TtsResult<CacheLookup> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CacheLookup::Miss),
            Err(e) => {
                return Err(TtsError::cache_io(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        if (bytes.len() as u64) < MIN_ENTRY_BYTES {
            warn!(
                "Discarding truncated cache entry {} ({} bytes)",
                key,
                bytes.len()
            );
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
            return Ok(CacheLookup::Miss);
        }

        debug!("Cache entry {} ({} bytes)", key, bytes.len());
        Ok(CacheLookup::Hit(bytes))
    }

    /// Store `bytes` under `key`.
    ///
    /// Writes go to a temporary file that is renamed into place, so readers
    /// never see a partial entry. Concurrent writers of the same key race
    /// harmlessly; the content is identical.
    ///
    /// # Errors
    ///
    /// Returns [`TtsError::CacheIoError`] if the entry cannot be written.
    pub fn put(&self, key: &CacheKey, bytes: &[u8]) -> TtsResult<()> {
        if (bytes.len() as u64) < MIN_ENTRY_BYTES {
            return Err(TtsError::cache_io(format!(
                "Refusing to cache {} bytes for {key}",
                bytes.len()
            )));
        }

        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));
        let io_err = |e: std::io::Error| TtsError::cache_io(format!("Failed to write {key}: {e}"));

        std::fs::write(&tmp, bytes).map_err(io_err)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        debug!("Cached {} bytes as {}", bytes.len(), key);
        Ok(())
    }

    /// Number of stored entries
    ///
    /// # Errors
    ///
    /// Returns [`TtsError::CacheIoError`] if the directory cannot be listed.
    pub fn entry_count(&self) -> TtsResult<usize> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| TtsError::cache_io(format!("Failed to list cache: {e}")))?;
        Ok(entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry.path().extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION)
            })
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key_for(text: &str) -> CacheKey {
        CacheKey::new(
            text,
            "en",
            &SpeakerSelector::parse("Ana"),
            &TuningParams::default(),
            AudioFormat::Wav,
            24_000,
        )
    }

    #[test]
    fn test_key_is_stable_and_sensitive() {
        assert_eq!(key_for("Hello"), key_for("Hello"));
        assert_ne!(key_for("Hello"), key_for("Hello!"));
        assert_eq!(key_for("Hello").as_str().len(), 64);

        let slower = TuningParams {
            speed: 0.9,
            ..TuningParams::default()
        };
        let other = CacheKey::new(
            "Hello",
            "en",
            &SpeakerSelector::parse("Ana"),
            &slower,
            AudioFormat::Wav,
            24_000,
        );
        assert_ne!(other, key_for("Hello"));

        let styled = CacheKey::new(
            "Hello",
            "en",
            &SpeakerSelector::parse("Ana/happy"),
            &TuningParams::default(),
            AudioFormat::Wav,
            24_000,
        );
        assert_ne!(styled, key_for("Hello"));
    }

    #[test]
    fn test_key_ignores_untracked_tuning() {
        let tuning = TuningParams {
            top_k: 10,
            ..TuningParams::default()
        };
        let key = CacheKey::new(
            "Hello",
            "en",
            &SpeakerSelector::parse("Ana"),
            &tuning,
            AudioFormat::Wav,
            24_000,
        );
        assert_eq!(key, key_for("Hello"));
    }

    #[test]
    fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();
        let key = key_for("Hello");

        assert_eq!(cache.get(&key).unwrap(), CacheLookup::Miss);
        cache.put(&key, &[7u8; 100]).unwrap();
        assert_eq!(cache.get(&key).unwrap(), CacheLookup::Hit(vec![7u8; 100]));
        assert_eq!(cache.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_truncated_entry_is_removed() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let key = key_for("Hello");

        std::fs::write(cache.path_for(&key), [1u8; 10]).unwrap();
        assert_eq!(cache.get(&key).unwrap(), CacheLookup::Miss);
        assert!(!cache.path_for(&key).exists());
    }

    #[test]
    fn test_tiny_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let err = cache.put(&key_for("x"), &[0u8; 4]).unwrap_err();
        assert!(matches!(err, TtsError::CacheIoError { .. }));
        assert_eq!(cache.entry_count().unwrap(), 0);
    }
}
