// Core data model shared by both planes
// This file defines the error-event, cluster, policy, and breaker-state
// records that cross the bus and the policy store
//
// Numan Thabit 2025 Nov

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single sampled failure, immutable once published.
///
/// Consumers must treat delivery as at-least-once and dedupe by `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub event_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub request_path: String,
    pub method: String,
    pub service_name: String,
    pub status_code: u16,
    /// Desensitised before it ever leaves the data plane.
    pub error_message: String,
    /// First two frames of the error's source chain.
    pub stack_trace: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Filled in by the clustering engine on ingest.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
}

/// A group of error events sharing a semantic fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    /// Mean vector of member embeddings, approximately unit-norm.
    pub centroid: Vec<f32>,
    /// Member event ids, in insertion order. `members.len() == error_count`.
    pub members: Vec<String>,
    pub error_count: i64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    /// In [0, 1], derived from error rate and growth rate.
    pub severity: f64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    #[serde(rename = "RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "CIRCUIT_BREAK")]
    CircuitBreak,
    #[serde(rename = "DEGRADE")]
    Degrade,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::RateLimit => "RATE_LIMIT",
            PolicyType::CircuitBreak => "CIRCUIT_BREAK",
            PolicyType::Degrade => "DEGRADE",
        }
    }
}

/// Admission rule for one cluster, distributed through the policy store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub cluster_id: String,
    pub policy_type: PolicyType,
    pub severity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_break: Option<CircuitBreakPolicy>,
    pub create_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    pub is_active: bool,
}

impl Policy {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expire_time
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Fraction of the configured max rate to allow, in [0, 1].
    pub limit_rate: f64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakPolicy {
    pub break_duration_secs: u64,
    /// Fraction of the failure threshold that half-open successes must reach.
    pub recovery_step: f64,
}

impl CircuitBreakPolicy {
    pub fn break_duration(&self) -> Duration {
        Duration::from_secs(self.break_duration_secs)
    }
}

/// Derived per-cluster statistics; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub cluster_id: String,
    /// Errors per second over the most recent completed window.
    pub error_rate: f64,
    /// Current-window rate over previous-window rate; 1.0 when the
    /// previous window is empty.
    pub growth_rate: f64,
    pub last_update: DateTime<Utc>,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding used by the state gauge (0=closed, 1=open, 2=half-open).
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}
