// Vector agent (data-plane side)
// Maps error signatures to cluster ids against a read-only snapshot of
// cluster centroids, with short-TTL caches so admission never waits on
// the embedding collaborator
//
// Numan Thabit 2025 Nov

use crate::cache::TtlCache;
use crate::embedding::EmbeddingService;
use crate::util;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const SIGNATURE_CACHE_TTL: Duration = Duration::from_secs(300);
const ROUTE_CACHE_TTL: Duration = Duration::from_secs(300);
const SIGNATURE_CACHE_SIZE: usize = 10_000;

/// Data-plane classifier. Holds an immutable `{cluster_id -> centroid}`
/// snapshot replaced atomically on update, a signature -> cluster cache,
/// and a route-key correlation cache that lets admission charge the
/// right cluster without a classification round trip.
pub struct VectorAgent {
    embedding: Arc<EmbeddingService>,
    snapshot: RwLock<Arc<HashMap<String, Vec<f32>>>>,
    signature_cache: TtlCache<String>,
    route_cache: TtlCache<String>,
    similarity_threshold: f64,
}

impl VectorAgent {
    pub fn new(embedding: Arc<EmbeddingService>, similarity_threshold: f64) -> Self {
        Self {
            embedding,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            signature_cache: TtlCache::new(SIGNATURE_CACHE_SIZE),
            route_cache: TtlCache::new(SIGNATURE_CACHE_SIZE),
            similarity_threshold,
        }
    }

    /// Cluster id previously correlated with this route key, if any.
    /// Pure cache lookup; safe on the admission path.
    pub fn correlate_route(&self, route_key: &str) -> Option<String> {
        self.route_cache.get(route_key)
    }

    /// Resolve the cluster a signature belongs to. Empty result means
    /// "unknown cluster, use defaults". Every failure path returns empty
    /// rather than an error: classification must never deny traffic.
    pub async fn identify_cluster(&self, signature: &str) -> String {
        if signature.is_empty() {
            return String::new();
        }

        if let Some(cluster_id) = self.signature_cache.get(signature) {
            return cluster_id;
        }

        let vector = match self.embedding.embed(signature).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(error = %err, "signature embedding failed; treating as unknown cluster");
                return String::new();
            }
        };

        let cluster_id = self.nearest_cluster(&vector);
        if !cluster_id.is_empty() {
            self.signature_cache.insert(
                signature.to_string(),
                cluster_id.clone(),
                Some(SIGNATURE_CACHE_TTL),
            );
        }
        cluster_id
    }

    /// Classify a failure's full signature and remember the route-key
    /// correlation for subsequent admissions. Runs off the hot path.
    pub async fn classify_failure(&self, route_key: &str, signature: &str) -> String {
        let cluster_id = self.identify_cluster(signature).await;
        if !cluster_id.is_empty() {
            self.route_cache.insert(
                route_key.to_string(),
                cluster_id.clone(),
                Some(ROUTE_CACHE_TTL),
            );
            debug!(cluster_id = %cluster_id, route = %route_key, "correlated route with cluster");
        }
        cluster_id
    }

    /// Replace the centroid snapshot atomically and clear both caches:
    /// stale mappings to retired cluster ids are worse than recomputing.
    pub fn update_clusters(&self, centroids: HashMap<String, Vec<f32>>) {
        let count = centroids.len();
        {
            let mut snapshot = self.snapshot.write().unwrap();
            *snapshot = Arc::new(centroids);
        }
        self.signature_cache.clear();
        self.route_cache.clear();
        info!(clusters = count, "updated cluster snapshot in vector agent");
    }

    pub fn cluster_count(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    /// Drop expired cache entries so idle routes do not pin memory
    /// between LRU evictions. Called from the gateway's GC tick.
    pub fn purge_caches(&self) {
        self.signature_cache.purge_expired();
        self.route_cache.purge_expired();
    }

    /// Argmax cosine similarity over the snapshot, subject to the
    /// admission threshold. Ties break to the lexicographically smallest
    /// cluster id.
    fn nearest_cluster(&self, vector: &[f32]) -> String {
        let snapshot = match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(_) => {
                warn!("vector agent snapshot poisoned; treating as unknown cluster");
                return String::new();
            }
        };

        let mut best_id = "";
        let mut best_similarity = f64::NEG_INFINITY;
        for (cluster_id, centroid) in snapshot.iter() {
            if centroid.is_empty() {
                continue;
            }
            let similarity = util::cosine_similarity(vector, centroid);
            if similarity > best_similarity
                || (similarity == best_similarity && cluster_id.as_str() < best_id)
            {
                best_similarity = similarity;
                best_id = cluster_id;
            }
        }

        if best_similarity >= self.similarity_threshold {
            best_id.to_string()
        } else {
            String::new()
        }
    }
}
