//! Frame-buster detection for inline scripts.
//!
//! Heuristic: a conditional keyword plus at least two distinct frame-identity
//! keywords. It can flag harmless scripts and miss obfuscated ones.

use std::sync::OnceLock;

use regex::Regex;

struct FrameBustPatterns {
    conditional: Regex,
    frame_identity: Regex,
}

impl FrameBustPatterns {
    fn new() -> Self {
        Self {
            conditional: Regex::new(r"\b(?:if|while)\b").expect("valid conditional keyword regex"),
            frame_identity: Regex::new(r"\b(top|self|parent)\b")
                .expect("valid frame identity regex"),
        }
    }
}

static PATTERNS: OnceLock<FrameBustPatterns> = OnceLock::new();

fn patterns() -> &'static FrameBustPatterns {
    PATTERNS.get_or_init(FrameBustPatterns::new)
}

/// Whether an inline script body looks like a frame-busting check.
pub(crate) fn looks_like_frame_buster(script: &str) -> bool {
    let patterns = patterns();
    if !patterns.conditional.is_match(script) {
        return false;
    }

    let mut seen = [false; 3];
    for caps in patterns.frame_identity.captures_iter(script) {
        match &caps[1] {
            "top" => seen[0] = true,
            "self" => seen[1] = true,
            _ => seen[2] = true,
        }
        if seen.iter().filter(|s| **s).count() >= 2 {
            return true;
        }
    }
    false
}
