//! Language codes understood by the model and `"auto"` detection.

use crate::error::{TtsError, TtsResult};
use lingua::{Language, LanguageDetector, LanguageDetectorBuilder};
use once_cell::sync::Lazy;
use regex::Regex;

/// Language codes accepted by the model
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "en", "es", "fr", "de", "it", "pt", "pl", "tr", "ru", "nl", "cs", "ar", "zh-cn", "ja", "hu",
    "ko",
];

/// Code used when detection gives no answer
pub const FALLBACK_LANGUAGE: &str = "en";

static DETECTOR: Lazy<LanguageDetector> = Lazy::new(|| {
    LanguageDetectorBuilder::from_languages(&[
        Language::English,
        Language::Spanish,
        Language::French,
        Language::German,
        Language::Italian,
        Language::Portuguese,
        Language::Polish,
        Language::Turkish,
        Language::Russian,
        Language::Dutch,
        Language::Czech,
        Language::Arabic,
        Language::Chinese,
        Language::Japanese,
        Language::Hungarian,
        Language::Korean,
    ])
    .build()
});

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

#[allow(unreachable_patterns)]
fn model_code(language: Language) -> &'static str {
    match language {
        Language::English => "en",
        Language::Spanish => "es",
        Language::French => "fr",
        Language::German => "de",
        Language::Italian => "it",
        Language::Portuguese => "pt",
        Language::Polish => "pl",
        Language::Turkish => "tr",
        Language::Russian => "ru",
        Language::Dutch => "nl",
        Language::Czech => "cs",
        Language::Arabic => "ar",
        Language::Chinese => "zh-cn",
        Language::Japanese => "ja",
        Language::Hungarian => "hu",
        Language::Korean => "ko",
        _ => FALLBACK_LANGUAGE,
    }
}

/// Detect the language of `text`, ignoring any markup
#[must_use]
pub fn detect_language(text: &str) -> &'static str {
    let plain = TAG.replace_all(text, " ");
    DETECTOR
        .detect_language_of(plain.as_ref())
        .map_or(FALLBACK_LANGUAGE, model_code)
}

/// Map a requested language code to the code the model expects.
///
/// `"auto"` and the empty string trigger detection on `text`.
///
/// # Errors
///
/// Returns a validation error for codes the model does not support.
pub fn resolve_language(requested: &str, text: &str) -> TtsResult<String> {
    let code = requested.trim().to_ascii_lowercase().replace('_', "-");
    if code.is_empty() || code == "auto" {
        return Ok(detect_language(text).to_string());
    }

    let code = match code.as_str() {
        "zh" | "zh-hans" => "zh-cn".to_string(),
        _ => code,
    };

    if SUPPORTED_LANGUAGES.contains(&code.as_str()) {
        Ok(code)
    } else {
        Err(TtsError::validation(format!("Unsupported language '{requested}'")))
    }
}
