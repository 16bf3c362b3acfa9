//! SSML interpretation.
//!
//! Supports `<speak>`, `<break>`, `<prosody rate>` and `<emphasis level>`.
//! Other elements are transparent: their text is spoken with the inherited
//! settings. Parsing never fails from the caller's point of view; malformed
//! markup degrades to the tag-stripped text.

use crate::error::{TtsError, TtsResult};
use crate::request::TuningParams;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::warn;

const MARKUP_TAGS: [&str; 4] = ["<speak", "<break", "<prosody", "<emphasis"];
const DEFAULT_BREAK_SECS: f32 = 0.5;
const MAX_BREAK_SECS: f32 = 10.0;
const MIN_SPEED: f32 = 0.25;
const MAX_SPEED: f32 = 4.0;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^&(?:#[0-9]+|#x[0-9a-fA-F]+|amp|lt|gt|quot|apos);").expect("valid entity regex")
});

/// Parameter overrides layered on top of the request's tuning
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProsodyOverrides {
    /// Speed multiplier override
    pub speed: Option<f32>,
    /// Repetition penalty override
    pub repetition_penalty: Option<f32>,
}

impl ProsodyOverrides {
    /// Whether no parameter is overridden
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.speed.is_none() && self.repetition_penalty.is_none()
    }

    /// Tuning for a segment: `base` with these overrides applied
    #[must_use]
    pub fn apply(&self, base: &TuningParams) -> TuningParams {
        TuningParams {
            speed: self.speed.unwrap_or(base.speed),
            repetition_penalty: self.repetition_penalty.unwrap_or(base.repetition_penalty),
            ..*base
        }
    }
}

/// One unit of an interpreted document
#[derive(Debug, Clone, PartialEq)]
pub enum SsmlSegment {
    /// Text to speak with the given overrides
    Text {
        /// Trimmed text content
        content: String,
        /// Overrides inherited from enclosing elements
        prosody: ProsodyOverrides,
    },
    /// Exact-length silence
    Break {
        /// Pause length
        duration: Duration,
    },
}

impl SsmlSegment {
    fn text<S: Into<String>>(content: S, prosody: ProsodyOverrides) -> Self {
        Self::Text {
            content: content.into(),
            prosody,
        }
    }

    /// Whether this is a break
    #[must_use]
    pub const fn is_break(&self) -> bool {
        matches!(self, Self::Break { .. })
    }
}

/// Whether `text` contains SSML markup
#[must_use]
pub fn is_markup(text: &str) -> bool {
    MARKUP_TAGS.iter().any(|tag| text.contains(tag))
}

/// Remove every `<...>` tag and collapse the remaining whitespace
#[must_use]
pub fn strip_tags(text: &str) -> String {
    TAG.replace_all(text, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Interpret `text` into segments.
///
/// Malformed markup is logged and replaced by a single text segment holding
/// the tag-stripped input. The result is never empty.
#[must_use]
pub fn parse(text: &str, defaults: &TuningParams) -> Vec<SsmlSegment> {
    match try_parse(text, defaults) {
        Ok(segments) => segments,
        Err(err) => {
            warn!("{err}; falling back to plain text");
            vec![SsmlSegment::text(strip_tags(text), ProsodyOverrides::default())]
        }
    }
}

/// Interpret `text` into segments, reporting malformed markup.
///
/// DTDs are rejected, so entity-expansion payloads fail to parse.
///
/// # Errors
///
/// Returns [`TtsError::SsmlMalformed`] if the markup is not well-formed.
pub fn try_parse(text: &str, defaults: &TuningParams) -> TtsResult<Vec<SsmlSegment>> {
    let wrapped = format!("<root>{}</root>", escape_bare_ampersands(text));
    let document =
        roxmltree::Document::parse(&wrapped).map_err(|e| TtsError::ssml_malformed(e.to_string()))?;

    let mut segments = Vec::new();
    walk(document.root_element(), ProsodyOverrides::default(), defaults, &mut segments);

    if segments.is_empty() {
        let content: String = document
            .root_element()
            .descendants()
            .filter(|node| node.is_text())
            .filter_map(|node| node.text())
            .collect();
        segments.push(SsmlSegment::text(
            content.split_whitespace().collect::<Vec<_>>().join(" "),
            ProsodyOverrides::default(),
        ));
    }

    Ok(segments)
}

fn walk(
    node: roxmltree::Node<'_, '_>,
    current: ProsodyOverrides,
    defaults: &TuningParams,
    segments: &mut Vec<SsmlSegment>,
) {
    for child in node.children() {
        if child.is_text() {
            let content = child.text().unwrap_or("").trim();
            if !content.is_empty() {
                segments.push(SsmlSegment::text(content, current));
            }
            continue;
        }

        if !child.is_element() {
            continue;
        }

        match child.tag_name().name() {
            "break" => segments.push(SsmlSegment::Break {
                duration: break_duration(child.attribute("time"), child.attribute("strength")),
            }),
            "prosody" => {
                let mut overrides = current;
                if let Some(speed) = child.attribute("rate").and_then(parse_rate) {
                    overrides.speed = Some(speed);
                }
                walk(child, overrides, defaults, segments);
            }
            "emphasis" => {
                let level = child.attribute("level").unwrap_or("moderate");
                walk(child, emphasize(current, level, defaults), defaults, segments);
            }
            _ => walk(child, current, defaults, segments),
        }
    }
}

fn break_duration(time: Option<&str>, strength: Option<&str>) -> Duration {
    let secs = match (time, strength) {
        (Some(time), _) => parse_time(time).unwrap_or(DEFAULT_BREAK_SECS),
        (None, Some(strength)) => match strength.trim() {
            "none" => 0.0,
            "x-weak" => 0.1,
            "weak" => 0.25,
            "strong" => 0.75,
            "x-strong" => 1.0,
            _ => DEFAULT_BREAK_SECS,
        },
        (None, None) => DEFAULT_BREAK_SECS,
    };
    Duration::from_secs_f32(secs.clamp(0.0, MAX_BREAK_SECS))
}

fn parse_time(time: &str) -> Option<f32> {
    let time = time.trim().to_ascii_lowercase();
    let secs = if let Some(ms) = time.strip_suffix("ms") {
        ms.trim().parse::<f32>().ok()? / 1000.0
    } else if let Some(s) = time.strip_suffix('s') {
        s.trim().parse::<f32>().ok()?
    } else {
        time.parse::<f32>().ok()?
    };
    secs.is_finite().then_some(secs)
}

fn parse_rate(rate: &str) -> Option<f32> {
    let rate = rate.trim();
    let speed = match rate {
        "x-slow" => 0.7,
        "slow" => 0.85,
        "medium" | "default" => 1.0,
        "fast" => 1.2,
        "x-fast" => 1.4,
        _ => {
            if let Some(percent) = rate.strip_suffix('%') {
                let value: f32 = percent.trim().parse().ok()?;
                // signed percentages are relative changes
                if percent.starts_with(['+', '-']) {
                    1.0 + value / 100.0
                } else {
                    value / 100.0
                }
            } else {
                rate.parse().ok()?
            }
        }
    };
    (speed.is_finite() && speed > 0.0).then(|| speed.clamp(MIN_SPEED, MAX_SPEED))
}

fn emphasize(current: ProsodyOverrides, level: &str, defaults: &TuningParams) -> ProsodyOverrides {
    let speed = current.speed.unwrap_or(defaults.speed);
    let penalty = current.repetition_penalty.unwrap_or(defaults.repetition_penalty);

    match level.trim() {
        "strong" | "moderate" => ProsodyOverrides {
            speed: Some((speed * 0.9).clamp(MIN_SPEED, MAX_SPEED)),
            repetition_penalty: Some(penalty * 1.2),
        },
        "reduced" => ProsodyOverrides {
            speed: Some((speed * 1.1).clamp(MIN_SPEED, MAX_SPEED)),
            ..current
        },
        _ => current,
    }
}

fn escape_bare_ampersands(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for (index, c) in text.char_indices() {
        if c == '&' && !ENTITY.is_match(&text[index..]) {
            escaped.push_str("&amp;");
        } else {
            escaped.push(c);
        }
    }
    escaped
}
