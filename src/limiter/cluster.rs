// Cluster rate limiter
// Per-cluster token buckets driven by distributed policies, with a
// default bucket for unclassified traffic and periodic GC of idle buckets
//
// Numan Thabit 2025 Nov

use crate::config::LimiterConfig;
use crate::limiter::TokenBucket;
use crate::metrics;
use crate::types::Policy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;
use tracing::{debug, info, warn};

struct BucketEntry {
    bucket: TokenBucket,
    last_seen: RwLock<Instant>,
}

/// Local snapshot of one cluster's limiter state. Error/growth rates are
/// tracked by the control plane; this reports only what the data plane
/// knows.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub cluster_id: String,
    pub rate: f64,
    pub capacity: i64,
    pub tokens: i64,
    pub has_policy: bool,
}

/// Admission by cluster id. Requests with no cluster correlation share
/// the default bucket. Fails open: a request is only denied when a
/// healthy bucket explicitly runs dry.
pub struct ClusterRateLimiter {
    config: LimiterConfig,
    default_bucket: TokenBucket,
    buckets: RwLock<HashMap<String, BucketEntry>>,
    policies: RwLock<HashMap<String, Policy>>,
}

impl ClusterRateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let default_bucket = TokenBucket::new(config.default_rate as i64, config.default_rate);
        Self {
            config,
            default_bucket,
            buckets: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Empty cluster id or an unknown cluster falls through to the
    /// default bucket.
    pub fn allow(&self, cluster_id: &str) -> bool {
        if !cluster_id.is_empty() {
            let buckets = match self.buckets.read() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    warn!("limiter map poisoned; failing open");
                    drop(poisoned);
                    return true;
                }
            };
            if let Some(entry) = buckets.get(cluster_id) {
                if let Ok(mut seen) = entry.last_seen.write() {
                    *seen = Instant::now();
                }
                let allowed = entry.bucket.allow();
                if !allowed {
                    metrics::RATE_LIMIT_HITS
                        .with_label_values(&[cluster_id])
                        .inc();
                }
                return allowed;
            }
        }

        self.default_bucket.allow()
    }

    /// Apply a rate-limit policy: the bucket's rate becomes
    /// `max_rate * limit_rate`, created at `max_rate` capacity if absent.
    pub fn update_policy(&self, cluster_id: &str, policy: &Policy) {
        let Some(rate_limit) = &policy.rate_limit else {
            // Not a rate-limit policy; remember it so GC keeps the bucket
            // only while some policy references the cluster.
            self.policies
                .write()
                .unwrap()
                .insert(cluster_id.to_string(), policy.clone());
            return;
        };

        let rate = self.config.max_rate * rate_limit.limit_rate.clamp(0.0, 1.0);

        {
            let mut buckets = self.buckets.write().unwrap();
            match buckets.get(cluster_id) {
                Some(entry) => entry.bucket.set_rate(rate),
                None => {
                    buckets.insert(
                        cluster_id.to_string(),
                        BucketEntry {
                            bucket: TokenBucket::new(self.config.max_rate as i64, rate),
                            last_seen: RwLock::new(Instant::now()),
                        },
                    );
                }
            }
        }

        self.policies
            .write()
            .unwrap()
            .insert(cluster_id.to_string(), policy.clone());

        info!(
            cluster_id = %cluster_id,
            rate = rate,
            limit_rate = rate_limit.limit_rate,
            "updated cluster rate limit"
        );
    }

    pub fn remove_policy(&self, cluster_id: &str) {
        self.policies.write().unwrap().remove(cluster_id);
        debug!(cluster_id = %cluster_id, "cluster rate-limit policy removed");
    }

    pub fn get_stats(&self, cluster_id: &str) -> Option<LimiterStats> {
        let buckets = self.buckets.read().unwrap();
        let entry = buckets.get(cluster_id)?;
        Some(LimiterStats {
            cluster_id: cluster_id.to_string(),
            rate: entry.bucket.rate(),
            capacity: entry.bucket.capacity(),
            tokens: entry.bucket.tokens(),
            has_policy: self.policies.read().unwrap().contains_key(cluster_id),
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().unwrap().len()
    }

    /// Drop buckets whose cluster has no policy and which have been idle
    /// longer than the cleanup interval, bounding the map. Run on a timer.
    pub fn sweep_idle(&self) {
        self.sweep_idle_at(Instant::now());
    }

    pub(crate) fn sweep_idle_at(&self, now: Instant) {
        let policies = self.policies.read().unwrap();
        let mut buckets = self.buckets.write().unwrap();
        let before = buckets.len();
        buckets.retain(|cluster_id, entry| {
            if policies.contains_key(cluster_id) {
                return true;
            }
            let idle = entry
                .last_seen
                .read()
                .map(|seen| now.saturating_duration_since(*seen))
                .unwrap_or_default();
            idle < self.config.cleanup_interval
        });

        let dropped = before - buckets.len();
        if dropped > 0 {
            debug!(dropped = dropped, remaining = buckets.len(), "swept idle limiter buckets");
        }
    }
}
