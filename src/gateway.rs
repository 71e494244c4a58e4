// Gateway assembly (data plane)
// Wires the limiter, breaker, sampler, vector agent, and policy watcher
// together, subscribes to policy and snapshot feeds, and owns the
// background task lifecycle
//
// Numan Thabit 2025 Nov

use crate::breaker::ClusterCircuitBreaker;
use crate::config::AppConfig;
use crate::controlplane::ClusterSnapshot;
use crate::embedding::EmbeddingService;
use crate::limiter::ClusterRateLimiter;
use crate::sampler::{self, ErrorSampler};
use crate::store::{ConfigStore, EventBus};
use crate::types::Policy;
use crate::vector_agent::VectorAgent;
use crate::watcher::{PolicyListener, PolicyWatcher};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fans watcher callbacks out to the admission components, the data
/// plane's counterpart of the control plane's policy writes.
struct PolicyFanout {
    limiter: Arc<ClusterRateLimiter>,
    breaker: Arc<ClusterCircuitBreaker>,
}

impl PolicyListener for PolicyFanout {
    fn on_policy_update(&self, cluster_id: &str, policy: &Policy) {
        info!(cluster_id = %cluster_id, policy_type = policy.policy_type.as_str(), "applying policy");
        self.limiter.update_policy(cluster_id, policy);
        self.breaker.update_policy(cluster_id, policy);
    }

    fn on_policy_delete(&self, cluster_id: &str) {
        self.limiter.remove_policy(cluster_id);
    }
}

pub struct Gateway {
    pub limiter: Arc<ClusterRateLimiter>,
    pub breaker: Arc<ClusterCircuitBreaker>,
    pub sampler: Arc<ErrorSampler>,
    pub vector_agent: Arc<VectorAgent>,
    pub watcher: Arc<PolicyWatcher>,
    cancel: CancellationToken,
    cleanup_interval: std::time::Duration,
}

impl Gateway {
    pub fn new(
        config: &AppConfig,
        embedding: Arc<EmbeddingService>,
        bus: Arc<dyn EventBus>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let limiter = Arc::new(ClusterRateLimiter::new(config.limiter.clone()));
        let breaker = Arc::new(ClusterCircuitBreaker::new(config.breaker.clone()));
        let vector_agent = Arc::new(VectorAgent::new(
            embedding,
            config.clustering.similarity_threshold,
        ));
        let watcher = Arc::new(PolicyWatcher::new(store));

        let cancel = CancellationToken::new();
        let (sampler, queue) = ErrorSampler::new(&config.sampler);
        sampler::spawn_drainer(queue, bus, config.bus.topic.clone(), cancel.clone());

        Self {
            limiter,
            breaker,
            sampler: Arc::new(sampler),
            vector_agent,
            watcher,
            cancel,
            cleanup_interval: config.limiter.cleanup_interval,
        }
    }

    /// Start the watcher and the limiter GC, and follow the control
    /// plane's snapshot feed.
    pub async fn start(
        &self,
        snapshots: broadcast::Receiver<ClusterSnapshot>,
    ) -> Result<()> {
        self.watcher.register(Arc::new(PolicyFanout {
            limiter: self.limiter.clone(),
            breaker: self.breaker.clone(),
        }));
        self.watcher
            .start(self.cancel.clone())
            .await
            .context("start policy watcher")?;

        self.spawn_limiter_gc();
        self.spawn_snapshot_follower(snapshots);

        info!("gateway started");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        info!("gateway stopping");
    }

    fn spawn_limiter_gc(&self) {
        let limiter = self.limiter.clone();
        let agent = self.vector_agent.clone();
        let cancel = self.cancel.clone();
        let interval = self.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        limiter.sweep_idle();
                        agent.purge_caches();
                    }
                }
            }
        });
    }

    fn spawn_snapshot_follower(&self, mut snapshots: broadcast::Receiver<ClusterSnapshot>) {
        let agent = self.vector_agent.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = snapshots.recv() => {
                        match received {
                            Ok(snapshot) => agent.update_clusters(snapshot),
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed = missed, "snapshot feed lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::HashEmbedder;
    use crate::policy::POLICY_PREFIX;
    use crate::store::{MemoryBus, MemoryConfigStore};
    use crate::types::{BreakerState, PolicyType, RateLimitPolicy};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Duration;

    fn gateway() -> (Gateway, Arc<MemoryConfigStore>) {
        let config = AppConfig::default();
        let embedding_config = EmbeddingConfig {
            model_path: String::new(),
            batch_size: 8,
            cache_size: 64,
            dimension: 32,
        };
        let embedding = Arc::new(EmbeddingService::new(
            &embedding_config,
            Arc::new(HashEmbedder::new(32)),
        ));
        let store = Arc::new(MemoryConfigStore::new());
        let gw = Gateway::new(
            &config,
            embedding,
            Arc::new(MemoryBus::new()),
            store.clone(),
        );
        (gw, store)
    }

    #[tokio::test]
    async fn policy_put_reconfigures_limiter_through_the_loop() {
        let (gw, store) = gateway();
        let (_tx, rx) = broadcast::channel(4);
        gw.start(rx).await.unwrap();

        let policy = Policy {
            policy_id: "policy_x".into(),
            cluster_id: "cluster_k".into(),
            policy_type: PolicyType::RateLimit,
            severity: 0.5,
            rate_limit: Some(RateLimitPolicy {
                limit_rate: 0.5,
                duration_secs: 300,
            }),
            circuit_break: None,
            create_time: Utc::now(),
            expire_time: Utc::now() + chrono::Duration::seconds(300),
            is_active: true,
        };
        store
            .put(
                &format!("{POLICY_PREFIX}cluster_k"),
                serde_json::to_string(&policy).unwrap(),
            )
            .await
            .unwrap();

        // watch -> callback -> limiter, all asynchronous
        let mut applied = false;
        for _ in 0..50 {
            if let Some(stats) = gw.limiter.get_stats("cluster_k") {
                assert_eq!(stats.rate, 5000.0); // max_rate 10000 * 0.5
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(applied, "policy never reached the limiter");
        gw.stop();
    }

    #[tokio::test]
    async fn high_severity_break_policy_opens_breaker() {
        let (gw, store) = gateway();
        let (_tx, rx) = broadcast::channel(4);
        gw.start(rx).await.unwrap();

        let policy = Policy {
            policy_id: "policy_x".into(),
            cluster_id: "cluster_k".into(),
            policy_type: PolicyType::CircuitBreak,
            severity: 0.9,
            rate_limit: None,
            circuit_break: Some(crate::types::CircuitBreakPolicy {
                break_duration_secs: 30,
                recovery_step: 0.2,
            }),
            create_time: Utc::now(),
            expire_time: Utc::now() + chrono::Duration::seconds(300),
            is_active: true,
        };
        store
            .put(
                &format!("{POLICY_PREFIX}cluster_k"),
                serde_json::to_string(&policy).unwrap(),
            )
            .await
            .unwrap();

        let mut opened = false;
        for _ in 0..50 {
            if gw.breaker.state("cluster_k") == BreakerState::Open {
                opened = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(opened, "severity override never opened the breaker");
        assert!(!gw.breaker.allow("cluster_k"));
        gw.stop();
    }

    #[tokio::test]
    async fn snapshot_feed_updates_vector_agent() {
        let (gw, _store) = gateway();
        let (tx, rx) = broadcast::channel(4);
        gw.start(rx).await.unwrap();

        let snapshot: ClusterSnapshot =
            HashMap::from([("cluster_a".to_string(), vec![1.0f32; 32])]);
        tx.send(snapshot).unwrap();

        let mut updated = false;
        for _ in 0..50 {
            if gw.vector_agent.cluster_count() == 1 {
                updated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(updated, "snapshot never reached the vector agent");
        gw.stop();
    }
}
