//! Speaker discovery and selection.
//!
//! The speaker directory holds reference recordings either flat
//! (`speakers/Ana.wav`, style `default`) or grouped per speaker
//! (`speakers/Ana/happy.wav`, one file per style).

use crate::request::{SpeakerSelector, DEFAULT_STYLE};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// File extensions recognised as reference recordings
pub const RECORDING_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg"];

/// One speaker and its per-style reference recordings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerEntry {
    /// Speaker name
    pub name: String,
    /// Style name to recording
    pub styles: BTreeMap<String, PathBuf>,
}

impl SpeakerEntry {
    fn new(name: String) -> Self {
        Self {
            name,
            styles: BTreeMap::new(),
        }
    }

    /// Style names, sorted
    #[must_use]
    pub fn style_names(&self) -> Vec<String> {
        self.styles.keys().cloned().collect()
    }

    /// Recording for `style`, if present
    #[must_use]
    pub fn style_file(&self, style: &str) -> Option<&Path> {
        self.styles.get(style).map(PathBuf::as_path)
    }
}

/// Result of a catalog rescan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Speakers found, sorted
    pub success: Vec<String>,
    /// Entries that could not be used, with the reason
    pub failed: BTreeMap<String, String>,
    /// Number of recordings examined
    pub total_scanned: usize,
    /// Whether a rescan actually happened
    pub refreshed: bool,
    /// Time of the last completed scan
    pub scanned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Snapshot {
    speakers: Arc<BTreeMap<String, SpeakerEntry>>,
    last_scan: Option<Instant>,
    scanned_at: Option<DateTime<Utc>>,
}

/// Catalog of available speakers, rescanned on TTL expiry or on demand
#[derive(Debug)]
pub struct SpeakerCatalog {
    root: PathBuf,
    ttl: Duration,
    state: RwLock<Snapshot>,
}

impl SpeakerCatalog {
    /// Create a catalog and perform the initial scan
    #[must_use]
    pub fn open<P: Into<PathBuf>>(root: P, ttl: Duration) -> Self {
        let catalog = Self {
            root: root.into(),
            ttl,
            state: RwLock::new(Snapshot::default()),
        };
        catalog.refresh(true);
        catalog
    }

    /// Speaker directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the TTL has expired since the last scan
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.state
            .read()
            .last_scan
            .map_or(true, |at| at.elapsed() >= self.ttl)
    }

    /// Rescan the speaker directory; without `force` only when stale
    pub fn refresh(&self, force: bool) -> RefreshReport {
        if !force && !self.is_stale() {
            let state = self.state.read();
            return RefreshReport {
                success: state.speakers.keys().cloned().collect(),
                scanned_at: state.scanned_at,
                ..RefreshReport::default()
            };
        }

        let (speakers, mut report) = scan(&self.root);
        let now = Utc::now();
        report.refreshed = true;
        report.scanned_at = Some(now);

        info!(
            "Speaker catalog refreshed: {} speakers from {} recordings ({} failed)",
            report.success.len(),
            report.total_scanned,
            report.failed.len()
        );

        let mut state = self.state.write();
        state.speakers = Arc::new(speakers);
        state.last_scan = Some(Instant::now());
        state.scanned_at = Some(now);
        report
    }

    fn snapshot(&self) -> Arc<BTreeMap<String, SpeakerEntry>> {
        if self.is_stale() {
            self.refresh(false);
        }
        Arc::clone(&self.state.read().speakers)
    }

    /// Speaker names mapped to their style names
    #[must_use]
    pub fn list(&self) -> BTreeMap<String, Vec<String>> {
        self.snapshot()
            .values()
            .map(|entry| (entry.name.clone(), entry.style_names()))
            .collect()
    }

    /// Look up a speaker by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SpeakerEntry> {
        self.snapshot().get(name).cloned()
    }

    /// Number of speakers in the last scan; never rescans
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().speakers.len()
    }

    /// Whether the last scan found no speaker; never rescans
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().speakers.is_empty()
    }

    /// First recording in catalog order
    #[must_use]
    pub fn first_recording(&self) -> Option<PathBuf> {
        self.snapshot().values().find_map(|entry| {
            entry
                .style_file(DEFAULT_STYLE)
                .or_else(|| entry.styles.values().next().map(PathBuf::as_path))
                .map(Path::to_path_buf)
        })
    }

    /// Find the recording backing `selector`.
    ///
    /// Looks for the style file in the speaker's directory, then any recording
    /// in that directory, then a flat `name.<ext>` in the root. Checks the
    /// filesystem directly so recordings added since the last scan are found.
    #[must_use]
    pub fn locate(&self, selector: &SpeakerSelector) -> Option<PathBuf> {
        if !is_safe_component(&selector.name) {
            if !selector.is_system_default() {
                warn!("Rejecting speaker name {:?}", selector.name);
            }
            return None;
        }

        let dir = self.root.join(&selector.name);
        if dir.is_dir() {
            let recordings = recordings_in(&dir);
            let styled = is_safe_component(&selector.style)
                .then(|| {
                    recordings
                        .iter()
                        .find(|path| file_stem(path).as_deref() == Some(selector.style.as_str()))
                })
                .flatten();

            if let Some(path) = styled {
                return Some(path.clone());
            }

            if !selector.is_default_style() {
                debug!(
                    "Style '{}' not found for speaker '{}', using another recording",
                    selector.style, selector.name
                );
            }

            let fallback = recordings
                .iter()
                .find(|path| file_stem(path).as_deref() == Some(DEFAULT_STYLE))
                .or_else(|| recordings.first());
            if let Some(path) = fallback {
                return Some(path.clone());
            }
        }

        RECORDING_EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{}.{ext}", selector.name)))
            .find(|path| path.is_file())
    }
}

fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0')
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

fn is_recording(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .is_some_and(|ext| RECORDING_EXTENSIONS.contains(&ext.as_str()))
}

fn glob_children(dir: &Path) -> Vec<Result<PathBuf, glob::GlobError>> {
    let pattern = format!(
        "{}/*",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    match glob::glob(&pattern) {
        Ok(paths) => paths.collect(),
        Err(e) => {
            warn!("Invalid speaker directory pattern {}: {}", pattern, e);
            Vec::new()
        }
    }
}

/// Recordings directly inside `dir`, sorted by path
fn recordings_in(dir: &Path) -> Vec<PathBuf> {
    let mut recordings: Vec<PathBuf> = glob_children(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|path| is_recording(path))
        .collect();
    recordings.sort();
    recordings
}

fn scan(root: &Path) -> (BTreeMap<String, SpeakerEntry>, RefreshReport) {
    let mut speakers: BTreeMap<String, SpeakerEntry> = BTreeMap::new();
    let mut report = RefreshReport::default();

    if !root.is_dir() {
        warn!("Speaker directory {} does not exist", root.display());
        return (speakers, report);
    }

    let mut flat = Vec::new();
    for child in glob_children(root) {
        let path = match child {
            Ok(path) => path,
            Err(e) => {
                report
                    .failed
                    .insert(e.path().display().to_string(), e.error().to_string());
                continue;
            }
        };

        if path.is_dir() {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                report
                    .failed
                    .insert(path.display().to_string(), "name is not valid UTF-8".to_string());
                continue;
            };

            let mut entry = SpeakerEntry::new(name.clone());
            for recording in recordings_in(&path) {
                report.total_scanned += 1;
                match file_stem(&recording) {
                    Some(style) => {
                        entry.styles.insert(style, recording);
                    }
                    None => {
                        report.failed.insert(
                            recording.display().to_string(),
                            "name is not valid UTF-8".to_string(),
                        );
                    }
                }
            }

            if entry.styles.is_empty() {
                report
                    .failed
                    .insert(name, "directory holds no recordings".to_string());
            } else {
                speakers.insert(entry.name.clone(), entry);
            }
        } else if is_recording(&path) {
            report.total_scanned += 1;
            flat.push(path);
        }
    }

    flat.sort();
    for recording in flat {
        match file_stem(&recording) {
            Some(name) => {
                speakers
                    .entry(name.clone())
                    .or_insert_with(|| SpeakerEntry::new(name))
                    .styles
                    .entry(DEFAULT_STYLE.to_string())
                    .or_insert(recording);
            }
            None => {
                report.failed.insert(
                    recording.display().to_string(),
                    "name is not valid UTF-8".to_string(),
                );
            }
        }
    }

    report.success = speakers.keys().cloned().collect();
    (speakers, report)
}
