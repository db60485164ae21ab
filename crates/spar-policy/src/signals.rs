//! Signal extraction from operator transcripts
//!
//! A signal is a coarse label for what the operator is currently addressing.
//! The selector compares consecutive signals to decide whether the
//! conversation is moving or stuck.

use std::sync::OnceLock;

use regex::Regex;

const SIGNAL_PATTERNS: [(&str, &str); 5] = [
    (
        r"(?i)\b(safe|safety|risk|side effects?|allerg\w*|reaction|hygien\w*|steril\w*|certif\w*|licens\w*)\b",
        "safety",
    ),
    (
        r"(?i)\b(price|prices|pricing|cost|costs|expensive|budget|afford\w*|discount|deal|package|cheap\w*)\b",
        "price",
    ),
    (
        r"(?i)\b(proof|evidence|results?|before|after|reviews?|case|cases|photos?|guarantee\w*|testimonial\w*)\b",
        "proof",
    ),
    (
        r"(?i)\b(schedule|appointment|when|timing|weeks?|months?|sessions?|visits?|frequency|how often)\b",
        "schedule",
    ),
    (
        r"(?i)\b(aftercare|follow[- ]?up|maintenance|touch[- ]?up|refund|complaint|support|warranty)\b",
        "aftercare",
    ),
];

fn compiled_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SIGNAL_PATTERNS
            .iter()
            .filter_map(|(pattern, key)| Regex::new(pattern).ok().map(|re| (re, *key)))
            .collect()
    })
}

/// Map operator text to a signal signature: the sorted matching keys joined
/// with `|`, or `generic` when nothing matches.
pub fn extract_signal(text: &str) -> String {
    let mut hits: Vec<&str> = compiled_patterns()
        .iter()
        .filter(|(re, _)| re.is_match(text))
        .map(|(_, key)| *key)
        .collect();
    if hits.is_empty() {
        return "generic".to_string();
    }
    hits.sort_unstable();
    hits.join("|")
}

/// Cheap deterministic string hash (h = h * 131 + byte, wrapping u32). Used
/// wherever selection needs a reproducible index instead of an RNG.
pub fn quick_hash(input: &str) -> u32 {
    let mut h: u32 = 0;
    for byte in input.bytes() {
        h = h.wrapping_mul(131).wrapping_add(u32::from(byte));
    }
    h
}
