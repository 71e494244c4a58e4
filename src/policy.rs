// Policy engine (control-plane side)
// Measures per-cluster error and growth rates over a sliding window,
// synthesises admission policies, and distributes them through the
// policy store; a background sweeper expires stale records
//
// Numan Thabit 2025 Nov

use crate::clustering::ClusteringEngine;
use crate::config::{BreakerConfig, PolicyConfig};
use crate::errors::GatewayError;
use crate::metrics;
use crate::store::ConfigStore;
use crate::types::{
    CircuitBreakPolicy, Cluster, ClusterStats, Policy, PolicyType, RateLimitPolicy,
};
use crate::util;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const POLICY_PREFIX: &str = "/policies/";

/// Per-cluster window bookkeeping: error counts seen at the last two
/// ticks, turned into a current and a previous window rate.
struct WindowTracker {
    last_count: i64,
    current_rate: f64,
    previous_rate: f64,
}

pub struct PolicyEngine {
    config: PolicyConfig,
    /// Breaker defaults feed circuit-break policy parameters.
    breaker: BreakerConfig,
    clustering: Arc<ClusteringEngine>,
    store: Arc<dyn ConfigStore>,
    windows: Mutex<HashMap<String, WindowTracker>>,
}

impl PolicyEngine {
    pub fn new(
        config: PolicyConfig,
        breaker: BreakerConfig,
        clustering: Arc<ClusteringEngine>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            config,
            breaker,
            clustering,
            store,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// One evaluation tick: roll every cluster's window forward, then
    /// synthesise and publish a policy for each cluster over threshold.
    /// Clusters below threshold are left alone; their previous policy,
    /// if any, expires naturally.
    pub async fn evaluate(&self) -> Result<usize, GatewayError> {
        let clusters = self.clustering.all_clusters();
        let stats = self.roll_windows(&clusters);

        let mut generated = 0;
        for stat in &stats {
            if stat.error_rate < self.config.error_rate_threshold
                && stat.growth_rate < self.config.growth_rate_threshold
            {
                continue;
            }

            let policy = self.synthesize(&stat.cluster_id, stat.error_rate, stat.growth_rate);
            self.clustering.set_severity(&stat.cluster_id, policy.severity);

            let key = format!("{POLICY_PREFIX}{}", stat.cluster_id);
            let value = serde_json::to_string(&policy)
                .map_err(|err| GatewayError::Policy(err.to_string()))?;
            match self.store.put(&key, value).await {
                Ok(()) => {
                    metrics::POLICIES_GENERATED
                        .with_label_values(&[policy.policy_type.as_str()])
                        .inc();
                    generated += 1;
                    info!(
                        cluster_id = %stat.cluster_id,
                        policy_type = policy.policy_type.as_str(),
                        severity = policy.severity,
                        error_rate = stat.error_rate,
                        growth_rate = stat.growth_rate,
                        "published policy"
                    );
                }
                Err(err) => {
                    // transient store failure: logged, retried on the
                    // next tick, never fatal
                    warn!(error = %err, cluster_id = %stat.cluster_id, "failed to publish policy");
                }
            }
        }

        Ok(generated)
    }

    /// Severity is the dominant threshold ratio, clamped to [0, 1]:
    /// `clamp(max(error_rate/er_threshold, growth_rate/gr_threshold), 0, 1)`.
    /// Under 0.5 and under 0.8 both yield rate limits (the latter is
    /// simply tighter because severity is larger); at or above 0.8 the
    /// policy is a circuit break.
    pub fn synthesize(&self, cluster_id: &str, error_rate: f64, growth_rate: f64) -> Policy {
        let severity = util::clamp(
            f64::max(
                error_rate / self.config.error_rate_threshold,
                growth_rate / self.config.growth_rate_threshold,
            ),
            0.0,
            1.0,
        );
        self.policy_for_severity(cluster_id, severity)
    }

    pub fn policy_for_severity(&self, cluster_id: &str, severity: f64) -> Policy {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.policy_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let (policy_type, rate_limit, circuit_break) = if severity < 0.8 {
            (
                PolicyType::RateLimit,
                Some(RateLimitPolicy {
                    limit_rate: 1.0 - severity,
                    duration_secs: self.config.policy_ttl.as_secs(),
                }),
                None,
            )
        } else {
            (
                PolicyType::CircuitBreak,
                None,
                Some(CircuitBreakPolicy {
                    break_duration_secs: self.breaker.recovery_timeout.as_secs(),
                    recovery_step: self.breaker.recovery_increment,
                }),
            )
        };

        Policy {
            policy_id: util::generate_policy_id(),
            cluster_id: cluster_id.to_string(),
            policy_type,
            severity,
            rate_limit,
            circuit_break,
            create_time: now,
            expire_time: now + ttl,
            is_active: true,
        }
    }

    /// Delete policy records past their expire time. Runs on its own
    /// timer; the data-plane watcher observes the deletes.
    pub async fn sweep_expired(&self) -> Result<usize, GatewayError> {
        let records = self.store.get_prefix(POLICY_PREFIX).await?;
        let now = Utc::now();

        let mut swept = 0;
        for (key, value) in records {
            let policy: Policy = match serde_json::from_str(&value) {
                Ok(policy) => policy,
                Err(err) => {
                    warn!(error = %err, key = %key, "malformed policy record; deleting");
                    let _ = self.store.delete(&key).await;
                    continue;
                }
            };

            if policy.is_expired(now) {
                if let Err(err) = self.store.delete(&key).await {
                    warn!(error = %err, key = %key, "failed to delete expired policy");
                    continue;
                }
                metrics::POLICIES_EXPIRED
                    .with_label_values(&[policy.policy_type.as_str()])
                    .inc();
                swept += 1;
                debug!(cluster_id = %policy.cluster_id, "expired policy removed");
            }
        }

        Ok(swept)
    }

    /// Advance every cluster's window and return the derived stats.
    /// Growth is current-window rate over previous-window rate, 1.0 when
    /// the previous window saw nothing.
    fn roll_windows(&self, clusters: &[Cluster]) -> Vec<ClusterStats> {
        let window_secs = self.config.evaluation_interval.as_secs().max(1);
        let mut windows = self.windows.lock().unwrap();

        // drop trackers for clusters retired by a re-fit
        let live: std::collections::HashSet<&str> =
            clusters.iter().map(|c| c.id.as_str()).collect();
        windows.retain(|id, _| live.contains(id.as_str()));

        clusters
            .iter()
            .map(|cluster| {
                let tracker = windows.entry(cluster.id.clone()).or_insert(WindowTracker {
                    last_count: 0,
                    current_rate: 0.0,
                    previous_rate: 0.0,
                });

                let delta = (cluster.error_count - tracker.last_count).max(0);
                tracker.last_count = cluster.error_count;
                tracker.previous_rate = tracker.current_rate;
                tracker.current_rate = delta as f64 / window_secs as f64;

                let growth_rate = if tracker.previous_rate == 0.0 {
                    1.0
                } else {
                    tracker.current_rate / tracker.previous_rate
                };

                ClusterStats {
                    cluster_id: cluster.id.clone(),
                    error_rate: tracker.current_rate,
                    growth_rate,
                    last_update: cluster.update_time,
                    window_secs,
                }
            })
            .collect()
    }
}
