// Cluster circuit breaker
// Per-cluster three-state machine (CLOSED / OPEN / HALF_OPEN) with
// policy-driven thresholds and a high-severity immediate trip
//
// Numan Thabit 2025 Nov

use crate::config::BreakerConfig;
use crate::metrics;
use crate::types::{BreakerState, Policy, PolicyType};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tracing::{info, warn};

struct BreakerCell {
    state: BreakerState,
    failure_count: i64,
    success_count: i64,
    last_fail: Option<Instant>,
    next_retry: Option<Instant>,
    config: BreakerConfig,
    trips: u64,
    total_requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub cluster_id: String,
    pub state: BreakerState,
    pub failure_count: i64,
    pub success_count: i64,
    pub trips: u64,
    pub total_requests: u64,
}

/// Admission gate keyed by cluster id. Denial is an explicit policy
/// outcome; every internal fallback path answers allow.
pub struct ClusterCircuitBreaker {
    config: BreakerConfig,
    clusters: RwLock<HashMap<String, Mutex<BreakerCell>>>,
}

impl ClusterCircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    /// CLOSED and HALF_OPEN admit (half-open probes rely on the pipeline
    /// recording the outcome). OPEN admits only once `next_retry` has
    /// passed, transitioning to HALF_OPEN. Empty or unknown cluster ids
    /// bypass the breaker entirely.
    pub fn allow(&self, cluster_id: &str) -> bool {
        self.allow_at(cluster_id, Instant::now())
    }

    pub(crate) fn allow_at(&self, cluster_id: &str, now: Instant) -> bool {
        if cluster_id.is_empty() {
            return true;
        }

        let clusters = match self.clusters.read() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("breaker map poisoned; failing open");
                return true;
            }
        };
        let Some(cell) = clusters.get(cluster_id) else {
            return true;
        };
        let Ok(mut cell) = cell.lock() else {
            return true;
        };

        cell.total_requests += 1;

        match cell.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if cell.next_retry.is_some_and(|at| now >= at) {
                    cell.state = BreakerState::HalfOpen;
                    set_state_gauge(cluster_id, BreakerState::HalfOpen);
                    info!(cluster_id = %cluster_id, "circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, cluster_id: &str) {
        self.record_success_at(cluster_id, Instant::now());
    }

    pub(crate) fn record_success_at(&self, cluster_id: &str, _now: Instant) {
        if cluster_id.is_empty() {
            return;
        }
        let clusters = match self.clusters.read() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let Some(cell) = clusters.get(cluster_id) else {
            return;
        };
        let Ok(mut cell) = cell.lock() else {
            return;
        };

        cell.success_count += 1;

        if cell.state == BreakerState::HalfOpen {
            let required = recovery_threshold(&cell.config);
            if cell.success_count >= required {
                cell.state = BreakerState::Closed;
                cell.failure_count = 0;
                cell.success_count = 0;
                cell.next_retry = None;
                set_state_gauge(cluster_id, BreakerState::Closed);
                info!(cluster_id = %cluster_id, "circuit breaker recovered to closed");
            }
        }
    }

    pub fn record_failure(&self, cluster_id: &str) {
        self.record_failure_at(cluster_id, Instant::now());
    }

    pub(crate) fn record_failure_at(&self, cluster_id: &str, now: Instant) {
        if cluster_id.is_empty() {
            return;
        }
        let clusters = match self.clusters.read() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let Some(cell) = clusters.get(cluster_id) else {
            return;
        };
        let Ok(mut cell) = cell.lock() else {
            return;
        };

        cell.failure_count += 1;
        cell.last_fail = Some(now);

        match cell.state {
            BreakerState::Closed => {
                if cell.failure_count >= cell.config.failure_threshold {
                    trip(&mut cell, cluster_id, now);
                }
            }
            BreakerState::HalfOpen => {
                // any failure while probing re-opens immediately
                trip(&mut cell, cluster_id, now);
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self, cluster_id: &str) -> BreakerState {
        if cluster_id.is_empty() {
            return BreakerState::Closed;
        }
        let clusters = match self.clusters.read() {
            Ok(guard) => guard,
            Err(_) => return BreakerState::Closed,
        };
        clusters
            .get(cluster_id)
            .and_then(|cell| cell.lock().ok().map(|c| c.state))
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self, cluster_id: &str) -> Option<BreakerSnapshot> {
        let clusters = self.clusters.read().ok()?;
        let cell = clusters.get(cluster_id)?.lock().ok()?;
        Some(BreakerSnapshot {
            cluster_id: cluster_id.to_string(),
            state: cell.state,
            failure_count: cell.failure_count,
            success_count: cell.success_count,
            trips: cell.trips,
            total_requests: cell.total_requests,
        })
    }

    /// Replace the breaker's local thresholds from a circuit-break
    /// policy, creating the per-cluster cell if absent. A severity at or
    /// above 0.8 opens the breaker immediately for the policy's break
    /// duration, without waiting for observed failures.
    pub fn update_policy(&self, cluster_id: &str, policy: &Policy) {
        self.update_policy_at(cluster_id, policy, Instant::now());
    }

    pub(crate) fn update_policy_at(&self, cluster_id: &str, policy: &Policy, now: Instant) {
        if policy.policy_type != PolicyType::CircuitBreak {
            return;
        }
        let Some(circuit_break) = &policy.circuit_break else {
            warn!(cluster_id = %cluster_id, "circuit-break policy missing parameters; skipped");
            return;
        };

        let mut clusters = self.clusters.write().unwrap();
        let cell = clusters.entry(cluster_id.to_string()).or_insert_with(|| {
            Mutex::new(BreakerCell {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_fail: None,
                next_retry: None,
                config: self.config.clone(),
                trips: 0,
                total_requests: 0,
            })
        });
        let mut cell = cell.lock().unwrap();

        cell.config = BreakerConfig {
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: circuit_break.break_duration(),
            recovery_increment: circuit_break.recovery_step,
        };

        if policy.severity >= 0.8 {
            cell.state = BreakerState::Open;
            cell.next_retry = Some(now + circuit_break.break_duration());
            cell.trips += 1;
            metrics::BREAKER_TRIPS.with_label_values(&[cluster_id]).inc();
            set_state_gauge(cluster_id, BreakerState::Open);
            warn!(
                cluster_id = %cluster_id,
                severity = policy.severity,
                "circuit breaker opened immediately by high-severity policy"
            );
        }

        info!(
            cluster_id = %cluster_id,
            break_duration_secs = circuit_break.break_duration_secs,
            recovery_step = circuit_break.recovery_step,
            "updated circuit breaker policy"
        );
    }
}

fn trip(cell: &mut BreakerCell, cluster_id: &str, now: Instant) {
    cell.state = BreakerState::Open;
    cell.next_retry = Some(now + cell.config.recovery_timeout);
    cell.success_count = 0;
    cell.trips += 1;
    metrics::BREAKER_TRIPS.with_label_values(&[cluster_id]).inc();
    set_state_gauge(cluster_id, BreakerState::Open);
    info!(
        cluster_id = %cluster_id,
        failures = cell.failure_count,
        "circuit breaker opened"
    );
}

/// Half-open successes needed before closing:
/// `round(failure_threshold * recovery_increment)`, at least one.
fn recovery_threshold(config: &BreakerConfig) -> i64 {
    let raw = (config.failure_threshold as f64 * config.recovery_increment).round() as i64;
    raw.max(1)
}

fn set_state_gauge(cluster_id: &str, state: BreakerState) {
    metrics::BREAKER_STATE
        .with_label_values(&[cluster_id])
        .set(state.as_gauge() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CircuitBreakPolicy;
    use chrono::Utc;
    use std::time::Duration;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(1),
            recovery_increment: 1.0,
        }
    }

    fn break_policy(cluster_id: &str, severity: f64) -> Policy {
        Policy {
            policy_id: "policy_test".into(),
            cluster_id: cluster_id.into(),
            policy_type: PolicyType::CircuitBreak,
            severity,
            rate_limit: None,
            circuit_break: Some(CircuitBreakPolicy {
                break_duration_secs: 1,
                recovery_step: 1.0,
            }),
            create_time: Utc::now(),
            expire_time: Utc::now() + chrono::Duration::seconds(300),
            is_active: true,
        }
    }

    /// Install a cell without tripping it.
    fn seed(breaker: &ClusterCircuitBreaker, cluster_id: &str) {
        breaker.update_policy(cluster_id, &break_policy(cluster_id, 0.0));
    }

    #[test]
    fn empty_and_unknown_cluster_bypass() {
        let breaker = ClusterCircuitBreaker::new(test_config());
        assert!(breaker.allow(""));
        assert!(breaker.allow("cluster_never_seen"));
        assert_eq!(breaker.state("cluster_never_seen"), BreakerState::Closed);
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let breaker = ClusterCircuitBreaker::new(test_config());
        seed(&breaker, "k");
        let now = Instant::now();

        breaker.record_failure_at("k", now);
        breaker.record_failure_at("k", now);
        assert!(breaker.allow_at("k", now));

        breaker.record_failure_at("k", now);
        assert_eq!(breaker.state("k"), BreakerState::Open);
        assert!(!breaker.allow_at("k", now));
    }

    #[test]
    fn open_stays_denied_until_next_retry() {
        let breaker = ClusterCircuitBreaker::new(test_config());
        seed(&breaker, "k");
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at("k", now);
        }

        assert!(!breaker.allow_at("k", now + Duration::from_millis(999)));
        // recovery timeout elapsed: next call admits and moves to half-open
        assert!(breaker.allow_at("k", now + Duration::from_secs(1)));
        assert_eq!(breaker.state("k"), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_recovery_successes() {
        let breaker = ClusterCircuitBreaker::new(test_config());
        seed(&breaker, "k");
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at("k", now);
        }
        let later = now + Duration::from_secs(1);
        assert!(breaker.allow_at("k", later));

        // threshold 3 * increment 1.0 -> three successes to close
        breaker.record_success_at("k", later);
        breaker.record_success_at("k", later);
        assert_eq!(breaker.state("k"), BreakerState::HalfOpen);
        breaker.record_success_at("k", later);
        assert_eq!(breaker.state("k"), BreakerState::Closed);

        let snap = breaker.snapshot("k").unwrap();
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = ClusterCircuitBreaker::new(test_config());
        seed(&breaker, "k");
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at("k", now);
        }
        let later = now + Duration::from_secs(1);
        assert!(breaker.allow_at("k", later));
        assert_eq!(breaker.state("k"), BreakerState::HalfOpen);

        breaker.record_failure_at("k", later);
        assert_eq!(breaker.state("k"), BreakerState::Open);
        assert!(!breaker.allow_at("k", later + Duration::from_millis(500)));
        assert!(breaker.allow_at("k", later + Duration::from_secs(1)));
    }

    #[test]
    fn high_severity_policy_opens_immediately() {
        let breaker = ClusterCircuitBreaker::new(test_config());
        let now = Instant::now();
        breaker.update_policy_at("k", &break_policy("k", 0.9), now);

        assert_eq!(breaker.state("k"), BreakerState::Open);
        assert!(!breaker.allow_at("k", now));
        assert!(breaker.allow_at("k", now + Duration::from_secs(1)));
    }

    #[test]
    fn low_severity_policy_only_reconfigures() {
        let breaker = ClusterCircuitBreaker::new(test_config());
        breaker.update_policy("k", &break_policy("k", 0.5));
        assert_eq!(breaker.state("k"), BreakerState::Closed);
        assert!(breaker.allow("k"));
    }

    #[test]
    fn rate_limit_policy_is_ignored() {
        let breaker = ClusterCircuitBreaker::new(test_config());
        let mut policy = break_policy("k", 0.9);
        policy.policy_type = PolicyType::RateLimit;
        breaker.update_policy("k", &policy);
        assert!(breaker.snapshot("k").is_none());
    }

    #[test]
    fn recovery_threshold_rounds_and_floors_at_one() {
        let mut config = test_config();
        config.failure_threshold = 10;
        config.recovery_increment = 0.2;
        assert_eq!(recovery_threshold(&config), 2);

        config.recovery_increment = 0.01;
        assert_eq!(recovery_threshold(&config), 1);

        config.failure_threshold = 3;
        config.recovery_increment = 0.5;
        assert_eq!(recovery_threshold(&config), 2);
    }
}
