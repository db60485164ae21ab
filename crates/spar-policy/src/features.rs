//! Delivery metrics computed from a transcript
//!
//! Cheap, text-only features stored on the operator turn: speaking rate and
//! filler-word density. They ride along in the transcription event so a
//! client can show them immediately, before any coaching analysis lands.

use std::sync::OnceLock;

use regex::Regex;

use spar_core::TurnFeatures;

const FILLER_PATTERN: &str =
    r"(?i)\b(um+|uh+|erm|like|you know|basically|actually|sort of|kind of)\b";

fn filler_regex() -> Option<&'static Regex> {
    static FILLERS: OnceLock<Option<Regex>> = OnceLock::new();
    FILLERS
        .get_or_init(|| Regex::new(FILLER_PATTERN).ok())
        .as_ref()
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Words per minute. `None` without a usable duration; zero for a silent
/// clip that still has one.
pub fn speech_rate_wpm(text: &str, seconds: Option<f32>) -> Option<f32> {
    let seconds = seconds.unwrap_or(0.0);
    if !(seconds > 0.0) {
        return None;
    }
    let words = word_count(text);
    if words == 0 {
        return Some(0.0);
    }
    Some(words as f32 / seconds * 60.0)
}

/// Share of filler occurrences against total words. `None` for empty text.
pub fn filler_ratio(text: &str) -> Option<f32> {
    let total = word_count(text);
    if total == 0 {
        return None;
    }
    let fillers = filler_regex()
        .map(|re| re.find_iter(text).count())
        .unwrap_or(0);
    Some(fillers as f32 / total as f32)
}

/// Both features at once, as stored on the turn.
pub fn turn_features(text: &str, seconds: Option<f32>) -> TurnFeatures {
    TurnFeatures {
        speech_rate_wpm: speech_rate_wpm(text, seconds),
        filler_ratio: filler_ratio(text),
    }
}
