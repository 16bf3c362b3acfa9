//! Language-aware text cleanup applied before synthesis.
//!
//! [`normalize`] is pure and idempotent. Rules that can create new matches for
//! one another (a unit expansion exposing a date, for example) are applied until
//! the text stops changing.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use unicode_normalization::UnicodeNormalization;

const MAX_PASSES: usize = 8;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static NUMERIC_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})([./])(\d{1,2})[./](\d{4})\b").expect("valid regex")
});
static UNIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d)\s*(km/h|kg|km|cm|mm)\b").expect("valid regex"));
static ABBREVIATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(Dr|Prof|Mr|Mrs|vb|vs|etc)\.").expect("valid regex"));
static ORDINAL_DOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)\.(\s|$)").expect("valid regex"));

const TR_MONTHS: [&str; 12] = [
    "Ocak", "Şubat", "Mart", "Nisan", "Mayıs", "Haziran", "Temmuz", "Ağustos", "Eylül", "Ekim",
    "Kasım", "Aralık",
];
const EN_MONTHS: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rules {
    Turkish,
    English,
    Generic,
}

impl Rules {
    fn for_language(language: &str) -> Self {
        let primary = language.split(['-', '_']).next().unwrap_or("");
        match primary.to_ascii_lowercase().as_str() {
            "tr" => Self::Turkish,
            "en" => Self::English,
            _ => Self::Generic,
        }
    }
}

/// Normalize `text` for the given language code.
///
/// Collapses whitespace, canonicalizes typographic quotes, and for Turkish and
/// English expands numeric dates, unit abbreviations and common title
/// abbreviations. Turkish text also loses the period after a number followed by
/// a space or end of text, so `"2025. yılında"` is not read as an ordinal.
#[must_use]
pub fn normalize(text: &str, language: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let rules = Rules::for_language(language);
    let mut current: String = text.nfc().map(canonical_quote).collect();
    current = collapse_whitespace(&current);

    for _ in 0..MAX_PASSES {
        let next = collapse_whitespace(&apply_rules(&current, rules));
        if next == current {
            break;
        }
        current = next;
    }

    current
}

fn canonical_quote(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
        other => other,
    }
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

fn apply_rules(text: &str, rules: Rules) -> String {
    if rules == Rules::Generic {
        return text.to_string();
    }

    let text = expand_dates(text, rules);
    let text = UNIT.replace_all(&text, |caps: &Captures| {
        format!("{} {}", &caps[1], unit_name(&caps[2], rules))
    });
    let text = ABBREVIATION.replace_all(&text, |caps: &Captures| {
        abbreviation(&caps[1], rules).map_or_else(|| caps[0].to_string(), str::to_string)
    });

    match rules {
        Rules::Turkish => ORDINAL_DOT.replace_all(&text, "$1$2").into_owned(),
        _ => text.into_owned(),
    }
}

fn expand_dates(text: &str, rules: Rules) -> String {
    NUMERIC_DATE
        .replace_all(text, |caps: &Captures| {
            let first: u32 = caps[1].parse().unwrap_or(0);
            let second: u32 = caps[3].parse().unwrap_or(0);
            let year = &caps[4];
            // English slash dates are month-first
            let (day, month) = if rules == Rules::English && &caps[2] == "/" {
                (second, first)
            } else {
                (first, second)
            };

            if !(1..=31).contains(&day) || !(1..=12).contains(&month) {
                return caps[0].to_string();
            }

            let index = (month - 1) as usize;
            match rules {
                Rules::Turkish => format!("{day} {} {year}", TR_MONTHS[index]),
                Rules::English if &caps[2] == "/" => format!("{} {day}, {year}", EN_MONTHS[index]),
                _ => format!("{day} {} {year}", EN_MONTHS[index]),
            }
        })
        .into_owned()
}

fn unit_name(unit: &str, rules: Rules) -> &'static str {
    match (rules, unit) {
        (Rules::Turkish, "km/h") => "kilometre bölü saat",
        (Rules::Turkish, "kg") => "kilogram",
        (Rules::Turkish, "km") => "kilometre",
        (Rules::Turkish, "cm") => "santimetre",
        (Rules::Turkish, "mm") => "milimetre",
        (_, "km/h") => "kilometers per hour",
        (_, "kg") => "kilograms",
        (_, "km") => "kilometers",
        (_, "cm") => "centimeters",
        _ => "millimeters",
    }
}

fn abbreviation(abbr: &str, rules: Rules) -> Option<&'static str> {
    match (rules, abbr) {
        (Rules::Turkish, "Dr") => Some("Doktor"),
        (Rules::Turkish, "Prof") => Some("Profesör"),
        (Rules::Turkish, "vb") => Some("ve benzeri"),
        (Rules::Turkish, "vs") => Some("vesaire"),
        (Rules::English, "Dr") => Some("Doctor"),
        (Rules::English, "Prof") => Some("Professor"),
        (Rules::English, "Mr") => Some("Mister"),
        (Rules::English, "Mrs") => Some("Missus"),
        (Rules::English, "vs") => Some("versus"),
        (Rules::English, "etc") => Some("et cetera"),
        _ => None,
    }
}
