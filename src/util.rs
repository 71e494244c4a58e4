// Shared helpers: identifiers and vector math
// This file provides id generation for events/clusters/policies and the
// cosine/normalization primitives used by the clustering path
//
// Numan Thabit 2025 Nov

use rand::RngCore;

/// Random 128-bit id rendered as 32 hex characters.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Time-prefixed cluster id, globally unique: `cluster_<unix_seconds>_<hex8>`.
pub fn generate_cluster_id() -> String {
    format!(
        "cluster_{}_{}",
        chrono::Utc::now().timestamp(),
        &generate_id()[..8]
    )
}

pub fn generate_policy_id() -> String {
    format!(
        "policy_{}_{}",
        chrono::Utc::now().timestamp(),
        &generate_id()[..8]
    )
}

/// First path segment, used as the service label. `/payment/charge` -> `payment`.
pub fn service_name(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    let segment = trimmed.split('/').next().unwrap_or("");
    if segment.is_empty() {
        "unknown"
    } else {
        segment
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for i in 0..a.len() {
        dot += a[i] as f64 * b[i] as f64;
        norm_a += a[i] as f64 * a[i] as f64;
        norm_b += b[i] as f64 * b[i] as f64;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }

    let mut sum = 0.0f64;
    for i in 0..a.len() {
        let diff = a[i] as f64 - b[i] as f64;
        sum += diff * diff;
    }
    sum.sqrt()
}

/// Scale to unit norm; zero vectors pass through unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm: f64 = vector.iter().map(|v| (*v as f64) * (*v as f64)).sum();
    let norm = norm.sqrt();
    if norm == 0.0 {
        return;
    }
    for v in vector.iter_mut() {
        *v = (*v as f64 / norm) as f32;
    }
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_len).collect();
    format!("{cut}...")
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}
