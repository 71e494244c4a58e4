// Control-plane assembly and ingest
// Consumes the error-event stream from the bus, feeds the clustering
// engine, runs the re-cluster / policy-evaluation / expiry timers, and
// broadcasts centroid snapshots back to the data plane
//
// Numan Thabit 2025 Nov

use crate::cache::TtlCache;
use crate::clustering::ClusteringEngine;
use crate::config::AppConfig;
use crate::metrics;
use crate::policy::PolicyEngine;
use crate::store::EventBus;
use crate::types::ErrorEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEDUPE_CACHE_SIZE: usize = 100_000;
const DEDUPE_TTL: Duration = Duration::from_secs(3600);
const SNAPSHOT_PUSH_INTERVAL: Duration = Duration::from_secs(15);

/// One immutable `{cluster_id -> centroid}` view per push.
pub type ClusterSnapshot = HashMap<String, Vec<f32>>;

pub struct ControlPlane {
    clustering: Arc<ClusteringEngine>,
    policy: Arc<PolicyEngine>,
    bus: Arc<dyn EventBus>,
    topic: String,
    reclustering_interval: Duration,
    evaluation_interval: Duration,
    /// At-least-once bus delivery: seen event ids are remembered so a
    /// redelivery cannot double-count a cluster member.
    dedupe: TtlCache<()>,
    snapshots: broadcast::Sender<ClusterSnapshot>,
    cancel: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        config: &AppConfig,
        clustering: Arc<ClusteringEngine>,
        policy: Arc<PolicyEngine>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let (snapshots, _) = broadcast::channel(16);
        Self {
            clustering,
            policy,
            bus,
            topic: config.bus.topic.clone(),
            reclustering_interval: config.clustering.reclustering_interval,
            evaluation_interval: config.policy.evaluation_interval,
            dedupe: TtlCache::new(DEDUPE_CACHE_SIZE),
            snapshots,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribers receive a fresh centroid snapshot whenever the cluster
    /// table has changed since the last push.
    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<ClusterSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn clustering(&self) -> &Arc<ClusteringEngine> {
        &self.clustering
    }

    /// Spawn the ingest loop and the three timers. Each task exits on the
    /// shared stop signal.
    pub fn start(self: &Arc<Self>) {
        let ingest = Arc::clone(self);
        let mut events = self.bus.subscribe(&self.topic);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ingest.cancel.cancelled() => {
                        info!("control-plane ingest stopped");
                        return;
                    }
                    received = events.recv() => {
                        match received {
                            Some(payload) => ingest.handle_payload(&payload).await,
                            None => {
                                warn!("error-event stream closed");
                                return;
                            }
                        }
                    }
                }
            }
        });

        let recluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recluster.reclustering_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    _ = recluster.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = recluster.clustering.recluster().await {
                            warn!(error = %err, "re-clustering failed");
                        }
                    }
                }
            }
        });

        let evaluate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(evaluate.evaluation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = evaluate.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = evaluate.policy.evaluate().await {
                            warn!(error = %err, "policy evaluation failed");
                        }
                        if let Err(err) = evaluate.policy.sweep_expired().await {
                            warn!(error = %err, "policy expiry sweep failed");
                        }
                    }
                }
            }
        });

        let push = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_PUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            let mut pushed_generation = 0u64;
            loop {
                tokio::select! {
                    _ = push.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let generation = push.clustering.generation();
                        if generation != pushed_generation {
                            pushed_generation = generation;
                            let _ = push.snapshots.send(push.clustering.centroids());
                        }
                    }
                }
            }
        });

        info!(topic = %self.topic, "control plane started");
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        info!("control plane stopping");
    }

    async fn handle_payload(&self, payload: &[u8]) {
        let mut event: ErrorEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "malformed error event; skipped");
                return;
            }
        };

        if self.dedupe.contains(&event.event_id) {
            metrics::EVENTS_DEDUPED.inc();
            debug!(event_id = %event.event_id, "duplicate event skipped");
            return;
        }
        self.dedupe
            .insert(event.event_id.clone(), (), Some(DEDUPE_TTL));

        metrics::EVENTS_INGESTED.inc();
        if let Err(err) = self.clustering.process_event(&mut event).await {
            warn!(error = %err, event_id = %event.event_id, "failed to cluster event");
        }
    }
}
