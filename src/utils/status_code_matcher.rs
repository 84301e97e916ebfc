//! HTTP status code matching for circuit breaker outcome classification
//!
//! Patterns are either exact codes (`"404"`) or class wildcards (`"4xx"`).

/// Whether `status` counts as a success for circuit purposes: any 2xx, or a
/// code listed in `acceptable_codes`.
pub fn counts_as_success(status: u16, acceptable_codes: &[String]) -> bool {
    (200..300).contains(&status) || is_status_acceptable(status, acceptable_codes)
}

/// Check if a status code matches any of the acceptable status code patterns
pub fn is_status_acceptable(status: u16, acceptable_codes: &[String]) -> bool {
    acceptable_codes
        .iter()
        .any(|pattern| matches_pattern(status, pattern))
}

/// Whether a pattern is well formed (`"NNN"` with a known class, or `"Nxx"`)
pub fn is_valid_pattern(pattern: &str) -> bool {
    parse_pattern(pattern).is_some()
}

enum Pattern {
    Class(u16),
    Exact(u16),
}

fn parse_pattern(pattern: &str) -> Option<Pattern> {
    let pattern = pattern.trim();
    if pattern.len() != 3 {
        return None;
    }

    let lower = pattern.to_ascii_lowercase();
    if let Some(prefix) = lower.strip_suffix("xx") {
        return prefix
            .parse::<u16>()
            .ok()
            .filter(|class| (1..=5).contains(class))
            .map(Pattern::Class);
    }

    lower
        .parse::<u16>()
        .ok()
        .filter(|code| (100..600).contains(code))
        .map(Pattern::Exact)
}

fn matches_pattern(status: u16, pattern: &str) -> bool {
    match parse_pattern(pattern) {
        Some(Pattern::Class(class)) => status / 100 == class,
        Some(Pattern::Exact(code)) => status == code,
        None => false,
    }
}
