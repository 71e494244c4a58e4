// Policy watcher (data-plane side)
// Loads the /policies/ prefix at startup, consumes the ordered watch
// stream, and fans policy changes out to the limiter and breaker
//
// Numan Thabit 2025 Nov

use crate::errors::GatewayError;
use crate::metrics;
use crate::policy::POLICY_PREFIX;
use crate::store::{ConfigStore, KvEvent, KvEventKind};
use crate::types::Policy;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives policy changes. Implementations must be cheap; dispatch is
/// spawned off the watch loop so a slow or failing listener never blocks
/// subsequent events.
pub trait PolicyListener: Send + Sync {
    fn on_policy_update(&self, cluster_id: &str, policy: &Policy);
    fn on_policy_delete(&self, cluster_id: &str);
}

/// Owner of the data-plane policy cache.
pub struct PolicyWatcher {
    store: Arc<dyn ConfigStore>,
    policies: RwLock<HashMap<String, Policy>>,
    listeners: RwLock<Vec<Arc<dyn PolicyListener>>>,
}

impl PolicyWatcher {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            policies: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, listener: Arc<dyn PolicyListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    /// An expired policy is never served, even if the sweeper has not
    /// deleted the record yet.
    pub fn get_policy(&self, cluster_id: &str) -> Option<Policy> {
        let policies = self.policies.read().ok()?;
        let policy = policies.get(cluster_id)?;
        if policy.is_expired(Utc::now()) {
            return None;
        }
        Some(policy.clone())
    }

    pub fn policy_count(&self) -> usize {
        self.policies.read().map(|p| p.len()).unwrap_or(0)
    }

    /// Load current policies, then follow the watch stream until
    /// cancelled. The subscription is opened before the initial load so
    /// no event between load and watch is lost.
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, GatewayError> {
        let mut events = self.store.watch();

        let existing = self.store.get_prefix(POLICY_PREFIX).await?;
        let loaded = existing.len();
        for (key, value) in existing {
            self.apply_put(&key, &value);
        }
        info!(policies = loaded, "loaded existing policies");

        let watcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("policy watcher stopped");
                        return;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event) => watcher.handle_event(event),
                            Err(RecvError::Lagged(missed)) => {
                                warn!(missed = missed, "policy watch lagged; events skipped");
                            }
                            Err(RecvError::Closed) => {
                                warn!("policy watch stream closed");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    fn handle_event(&self, event: KvEvent) {
        if !event.key.starts_with(POLICY_PREFIX) {
            return;
        }

        match event.kind {
            KvEventKind::Put => self.apply_put(&event.key, &event.value),
            KvEventKind::Delete => self.apply_delete(&event.key),
        }
    }

    fn apply_put(&self, key: &str, value: &str) {
        let cluster_id = key.trim_start_matches(POLICY_PREFIX).to_string();

        // malformed record: logged, skipped, stream continues
        let policy: Policy = match serde_json::from_str(value) {
            Ok(policy) => policy,
            Err(err) => {
                warn!(error = %err, cluster_id = %cluster_id, "malformed policy record; skipped");
                return;
            }
        };

        {
            let mut policies = self.policies.write().unwrap();
            policies.insert(cluster_id.clone(), policy.clone());
        }
        self.refresh_gauges();
        debug!(cluster_id = %cluster_id, policy_type = policy.policy_type.as_str(), "policy updated");

        self.notify(move |listener| listener.on_policy_update(&cluster_id, &policy));
    }

    fn apply_delete(&self, key: &str) {
        let cluster_id = key.trim_start_matches(POLICY_PREFIX).to_string();
        let removed = self.policies.write().unwrap().remove(&cluster_id);
        if removed.is_none() {
            return;
        }
        self.refresh_gauges();
        debug!(cluster_id = %cluster_id, "policy deleted");

        self.notify(move |listener| listener.on_policy_delete(&cluster_id));
    }

    fn notify<F>(&self, invoke: F)
    where
        F: Fn(&dyn PolicyListener) + Send + 'static,
    {
        let listeners: Vec<Arc<dyn PolicyListener>> =
            self.listeners.read().unwrap().iter().cloned().collect();
        tokio::spawn(async move {
            for listener in listeners {
                invoke(listener.as_ref());
            }
        });
    }

    fn refresh_gauges(&self) {
        let policies = self.policies.read().unwrap();
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for policy in policies.values() {
            *counts.entry(policy.policy_type.as_str()).or_default() += 1;
        }
        for policy_type in ["RATE_LIMIT", "CIRCUIT_BREAK", "DEGRADE"] {
            metrics::POLICIES_ACTIVE
                .with_label_values(&[policy_type])
                .set(*counts.get(policy_type).unwrap_or(&0) as f64);
        }
    }
}
