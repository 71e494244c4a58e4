// Clustering engine
// Authoritative cluster table: online assignment of incoming error
// events, incremental centroid maintenance, and the periodic re-fit
//
// Numan Thabit 2025 Nov

use crate::clustering::kmeans;
use crate::config::ClusteringConfig;
use crate::embedding::EmbeddingService;
use crate::errors::GatewayError;
use crate::metrics;
use crate::signature;
use crate::store::VectorStore;
use crate::types::{Cluster, ErrorEvent};
use crate::util;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

struct EngineState {
    clusters: HashMap<String, Cluster>,
    /// Reverse index: member event id -> cluster id.
    member_index: HashMap<String, String>,
}

/// Single-writer owner of the cluster table. Event ingest is serialised
/// through the write lock by design: events arrive at sample rate, not
/// request rate, and centroid correctness matters more than throughput
/// here. No lock is held across collaborator I/O.
pub struct ClusteringEngine {
    config: ClusteringConfig,
    embedding: Arc<EmbeddingService>,
    vectors: Arc<dyn VectorStore>,
    state: RwLock<EngineState>,
    /// Bumped on every mutation; lets the snapshot pusher skip idle ticks.
    generation: AtomicU64,
}

impl ClusteringEngine {
    pub fn new(
        config: ClusteringConfig,
        embedding: Arc<EmbeddingService>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            config,
            embedding,
            vectors,
            state: RwLock::new(EngineState {
                clusters: HashMap::new(),
                member_index: HashMap::new(),
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Assign an event to the nearest cluster, creating one when nothing
    /// is close enough. Returns the cluster id and writes it back onto
    /// the event.
    pub async fn process_event(&self, event: &mut ErrorEvent) -> Result<String, GatewayError> {
        let sig = signature::build_signature(event);
        let vector = self.embedding.embed(&sig).await?;

        let cluster_id = {
            let mut state = self
                .state
                .write()
                .map_err(|_| GatewayError::Clustering("cluster table poisoned".into()))?;

            let nearest = nearest_cluster(&state.clusters, &vector);
            match nearest {
                Some((id, similarity)) if similarity >= self.config.similarity_threshold => {
                    add_member(&mut state, &id, event, &vector);
                    debug!(
                        event_id = %event.event_id,
                        cluster_id = %id,
                        similarity = similarity,
                        "added event to existing cluster"
                    );
                    id
                }
                nearest => {
                    if state.clusters.len() >= self.config.max_clusters {
                        if let Some((id, similarity)) = nearest {
                            // Degraded mode: at the cluster cap, fold the
                            // event into the nearest cluster regardless of
                            // the threshold.
                            warn!(
                                event_id = %event.event_id,
                                cluster_id = %id,
                                similarity = similarity,
                                max_clusters = self.config.max_clusters,
                                "cluster cap reached; merging below threshold"
                            );
                            add_member(&mut state, &id, event, &vector);
                            id
                        } else {
                            return Err(GatewayError::Clustering(
                                "cluster cap reached with no candidate cluster".into(),
                            ));
                        }
                    } else {
                        let id = create_cluster(&mut state, event, &vector);
                        info!(
                            event_id = %event.event_id,
                            cluster_id = %id,
                            clusters = state.clusters.len(),
                            "created new cluster"
                        );
                        id
                    }
                }
            }
        };

        self.generation.fetch_add(1, Ordering::Relaxed);
        metrics::CLUSTERS_TOTAL.set(self.cluster_count() as f64);

        // Persist the member vector after the table mutation; a store
        // failure loses re-fit input for this event but not the event.
        if let Err(err) = self.vectors.add(&event.event_id, vector).await {
            warn!(error = %err, event_id = %event.event_id, "failed to store member vector");
        }

        event.cluster_id = cluster_id.clone();
        Ok(cluster_id)
    }

    /// Periodic re-fit: read all member vectors back, run k-means with
    /// k = current cluster count, and replace the table under new ids.
    /// Cluster identity is NOT preserved across this pass.
    pub async fn recluster(&self) -> Result<usize, GatewayError> {
        let (member_ids, k) = {
            let state = self
                .state
                .read()
                .map_err(|_| GatewayError::Clustering("cluster table poisoned".into()))?;
            let mut ids = Vec::new();
            for cluster in state.clusters.values() {
                ids.extend(cluster.members.iter().cloned());
            }
            (ids, state.clusters.len())
        };

        if k == 0 {
            return Ok(0);
        }

        let mut vectors = Vec::with_capacity(member_ids.len());
        let mut event_ids = Vec::with_capacity(member_ids.len());
        for member_id in &member_ids {
            match self.vectors.get(member_id).await {
                Ok(Some(vector)) => {
                    vectors.push(vector);
                    event_ids.push(member_id.clone());
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, member_id = %member_id, "failed to load member vector");
                }
            }
        }

        if vectors.len() < self.config.min_cluster_size {
            debug!(
                vectors = vectors.len(),
                min_cluster_size = self.config.min_cluster_size,
                "not enough vectors; skipping re-cluster"
            );
            return Ok(k);
        }

        let result = kmeans::fit(&vectors, k, 10);

        let now = Utc::now();
        let mut new_clusters: HashMap<String, Cluster> = HashMap::new();
        for (slot, centroid) in result.centroids.iter().enumerate() {
            let members: Vec<String> = result
                .assignments
                .iter()
                .zip(&event_ids)
                .filter(|(assigned, _)| **assigned == slot)
                .map(|(_, id)| id.clone())
                .collect();
            if members.is_empty() {
                continue;
            }

            let id = util::generate_cluster_id();
            new_clusters.insert(
                id.clone(),
                Cluster {
                    id,
                    centroid: centroid.clone(),
                    error_count: members.len() as i64,
                    members,
                    create_time: now,
                    update_time: now,
                    severity: 0.0,
                    description: String::new(),
                },
            );
        }

        let count = new_clusters.len();
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| GatewayError::Clustering("cluster table poisoned".into()))?;
            state.member_index = new_clusters
                .values()
                .flat_map(|c| c.members.iter().map(|m| (m.clone(), c.id.clone())))
                .collect();
            state.clusters = new_clusters;
        }

        self.generation.fetch_add(1, Ordering::Relaxed);
        metrics::CLUSTERS_TOTAL.set(count as f64);
        info!(clusters = count, vectors = vectors.len(), "re-clustering completed");
        Ok(count)
    }

    pub fn get_cluster(&self, cluster_id: &str) -> Option<Cluster> {
        self.state
            .read()
            .ok()?
            .clusters
            .get(cluster_id)
            .cloned()
    }

    pub fn all_clusters(&self) -> Vec<Cluster> {
        self.state
            .read()
            .map(|state| state.clusters.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Read-only `{cluster_id -> centroid}` view pushed to the data plane.
    pub fn centroids(&self) -> HashMap<String, Vec<f32>> {
        self.state
            .read()
            .map(|state| {
                state
                    .clusters
                    .iter()
                    .map(|(id, c)| (id.clone(), c.centroid.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cluster_count(&self) -> usize {
        self.state.read().map(|s| s.clusters.len()).unwrap_or(0)
    }

    pub fn cluster_of_member(&self, event_id: &str) -> Option<String> {
        self.state
            .read()
            .ok()?
            .member_index
            .get(event_id)
            .cloned()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn set_severity(&self, cluster_id: &str, severity: f64) {
        if let Ok(mut state) = self.state.write() {
            if let Some(cluster) = state.clusters.get_mut(cluster_id) {
                cluster.severity = util::clamp(severity, 0.0, 1.0);
            }
        }
    }
}

/// Highest cosine similarity; equal similarity resolves to the
/// lexicographically smallest cluster id so assignment is deterministic.
fn nearest_cluster(
    clusters: &HashMap<String, Cluster>,
    vector: &[f32],
) -> Option<(String, f64)> {
    let mut best: Option<(&str, f64)> = None;
    for (id, cluster) in clusters {
        if cluster.centroid.is_empty() {
            continue;
        }
        let similarity = util::cosine_similarity(vector, &cluster.centroid);
        best = match best {
            None => Some((id, similarity)),
            Some((best_id, best_similarity)) => {
                if similarity > best_similarity
                    || (similarity == best_similarity && id.as_str() < best_id)
                {
                    Some((id, similarity))
                } else {
                    Some((best_id, best_similarity))
                }
            }
        };
    }
    best.map(|(id, similarity)| (id.to_string(), similarity))
}

fn add_member(state: &mut EngineState, cluster_id: &str, event: &ErrorEvent, vector: &[f32]) {
    let Some(cluster) = state.clusters.get_mut(cluster_id) else {
        return;
    };

    cluster.members.push(event.event_id.clone());
    cluster.error_count += 1;
    cluster.update_time = Utc::now();

    // incremental mean: c := c + (v - c) / n
    let n = cluster.members.len() as f32;
    if cluster.centroid.len() == vector.len() {
        for (c, v) in cluster.centroid.iter_mut().zip(vector) {
            *c += (*v - *c) / n;
        }
    }

    state
        .member_index
        .insert(event.event_id.clone(), cluster_id.to_string());
}

fn create_cluster(state: &mut EngineState, event: &ErrorEvent, vector: &[f32]) -> String {
    let id = util::generate_cluster_id();
    let now = Utc::now();
    state.clusters.insert(
        id.clone(),
        Cluster {
            id: id.clone(),
            centroid: vector.to_vec(),
            members: vec![event.event_id.clone()],
            error_count: 1,
            create_time: now,
            update_time: now,
            severity: 0.0,
            description: describe(event),
        },
    );
    state.member_index.insert(event.event_id.clone(), id.clone());
    id
}

fn describe(event: &ErrorEvent) -> String {
    format!(
        "Service: {}, Method: {}, Error: {}",
        event.service_name,
        event.method,
        util::truncate(&event.error_message, 100)
    )
}
