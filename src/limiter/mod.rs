// Rate limiting - admission control by error cluster
// This module provides the token bucket primitive and the policy-driven
// per-cluster rate limiter applied on every request
//
// Numan Thabit 2025 Nov

pub mod bucket;
pub mod cluster;

pub use bucket::TokenBucket;
pub use cluster::{ClusterRateLimiter, LimiterStats};
