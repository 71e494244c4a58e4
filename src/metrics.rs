// Metrics and observability module
// This file handles collection and reporting of admission, sampling,
// clustering, and policy metrics for Prometheus exposition
//
// Numan Thabit 2025 Nov

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};

pub static REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gateway_requests_total",
        "requests processed by the gateway",
        &["method", "status"]
    )
    .unwrap()
});

pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_request_duration_seconds",
        "request duration in seconds",
        &["method"]
    )
    .unwrap()
});

// Cluster-labelled series are bounded: they are only written for clusters
// that carry an active policy.
pub static RATE_LIMIT_HITS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gateway_rate_limit_hits_total",
        "requests denied by the cluster rate limiter",
        &["cluster_id"]
    )
    .unwrap()
});

pub static BREAKER_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "gateway_circuit_breaker_state",
        "breaker state (0=closed, 1=open, 2=half-open)",
        &["cluster_id"]
    )
    .unwrap()
});

pub static BREAKER_TRIPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gateway_circuit_breaker_trips_total",
        "breaker transitions into OPEN",
        &["cluster_id"]
    )
    .unwrap()
});

pub static ERRORS_SAMPLED: Lazy<Counter> = Lazy::new(|| {
    register_counter!("gateway_errors_sampled_total", "failing responses captured").unwrap()
});

pub static ERRORS_SKIPPED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gateway_errors_skipped_total",
        "failing responses not selected by the sampler"
    )
    .unwrap()
});

pub static ERRORS_DROPPED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gateway_errors_dropped_total",
        "sampled events dropped because the queue was full"
    )
    .unwrap()
});

pub static BUS_PUBLISH_ERRORS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gateway_bus_publish_errors_total",
        "event publishes that failed"
    )
    .unwrap()
});

pub static EVENTS_INGESTED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "controlplane_events_ingested_total",
        "error events consumed from the bus"
    )
    .unwrap()
});

pub static EVENTS_DEDUPED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "controlplane_events_deduped_total",
        "duplicate event ids skipped on ingest"
    )
    .unwrap()
});

pub static CLUSTERS_TOTAL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("controlplane_clusters_total", "active error clusters").unwrap()
});

pub static EMBED_CACHE_HITS: Lazy<Counter> = Lazy::new(|| {
    register_counter!("embedding_cache_hits_total", "embedding cache hits").unwrap()
});

pub static EMBED_CACHE_MISSES: Lazy<Counter> = Lazy::new(|| {
    register_counter!("embedding_cache_misses_total", "embedding cache misses").unwrap()
});

pub static POLICIES_GENERATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "controlplane_policies_generated_total",
        "policies written to the policy store",
        &["policy_type"]
    )
    .unwrap()
});

pub static POLICIES_EXPIRED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "controlplane_policies_expired_total",
        "policies removed by the expiry sweeper",
        &["policy_type"]
    )
    .unwrap()
});

pub static POLICIES_ACTIVE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "gateway_policies_active",
        "policies currently held by the watcher",
        &["policy_type"]
    )
    .unwrap()
});

/// Render the default registry in Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
