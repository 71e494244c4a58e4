// Error signature extraction and desensitisation
// Builds the canonical, PII-scrubbed string form of a failure that both
// planes feed to the embedding model
//
// Numan Thabit 2025 Nov

use crate::types::ErrorEvent;
use once_cell::sync::Lazy;
use regex::Regex;

/// Replacement order is fixed so overlapping patterns (digits inside an
/// email, hex runs inside a UUID) resolve the same way every time.
static PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
            "[EMAIL]",
        ),
        (
            Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").unwrap(),
            "[CARD]",
        ),
        (
            Regex::new(
                r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
            )
            .unwrap(),
            "[UUID]",
        ),
        (
            Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap(),
            "[IP]",
        ),
        (Regex::new(r"\b\d{11}\b").unwrap(), "[PHONE]"),
        (Regex::new(r"\b[A-Za-z0-9]{20,}\b").unwrap(), "[TOKEN]"),
        (Regex::new(r"/[A-Za-z0-9/._-]+").unwrap(), "[PATH]"),
        (Regex::new(r"\b\d+\b").unwrap(), "[NUMBER]"),
    ]
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Mask PII and volatile values with stable placeholders. Idempotent:
/// no placeholder is matched by any pattern.
pub fn desensitize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut result = text.to_string();
    for (pattern, replacement) in PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).into_owned();
    }
    result
}

/// Canonical embedding input: desensitised, lowercased, single-spaced.
pub fn canonicalize(text: &str) -> String {
    let masked = desensitize(text).to_lowercase();
    WHITESPACE.replace_all(masked.trim(), " ").into_owned()
}

/// Full failure signature: `service:S method:M path:P error:E stack:F1 F2`.
pub fn build_signature(event: &ErrorEvent) -> String {
    let mut signature = format!(
        "service:{} method:{} path:{} error:{}",
        event.service_name, event.method, event.request_path, event.error_message
    );

    if let Some(first) = event.stack_trace.first() {
        signature.push_str(" stack:");
        signature.push_str(first);
        if let Some(second) = event.stack_trace.get(1) {
            signature.push(' ');
            signature.push_str(second);
        }
    }

    desensitize(&signature)
}

pub fn build_raw_signature(
    service: &str,
    method: &str,
    path: &str,
    error: &str,
    stack: &[String],
) -> String {
    let mut signature = format!("service:{service} method:{method} path:{path} error:{error}");
    for frame in stack.iter().take(2) {
        signature.push(' ');
        signature.push_str(frame);
    }
    desensitize(&signature)
}

/// Request-level key used for admission-time correlation, before any
/// error exists: `service:S method:M path:P`.
pub fn route_signature(service: &str, method: &str, path: &str) -> String {
    desensitize(&format!("service:{service} method:{method} path:{path}"))
}
