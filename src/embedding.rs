// Embedding service
// Canonicalises signature text and turns it into unit-norm vectors via an
// opaque encoder; ships a deterministic hash-keyed stand-in model
//
// Numan Thabit 2025 Nov

use crate::cache::TtlCache;
use crate::config::EmbeddingConfig;
use crate::errors::GatewayError;
use crate::metrics;
use crate::signature;
use crate::util;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const EMBED_CACHE_TTL: Duration = Duration::from_secs(300);

/// Opaque text encoder: `encode(text) -> unit-norm vector of dimension D`.
/// The production model is a real text embedder plugged in behind this
/// trait; tests and the shipped binary use [`HashEmbedder`].
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    async fn encode(&self, text: &str) -> Result<Vec<f32>, GatewayError>;
}

/// Deterministic pseudo-random stand-in keyed by text hash. Identical
/// input always yields the identical unit-norm vector, which is what the
/// clustering tests rely on.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        if text.is_empty() {
            return Err(GatewayError::Embedding("empty text".into()));
        }

        let mut hash: i64 = 0;
        for ch in text.chars() {
            hash = hash.wrapping_mul(31).wrapping_add(ch as i64);
        }

        let mut vector = vec![0.0f32; self.dimension];
        for (i, slot) in vector.iter_mut().enumerate() {
            let value = (hash.wrapping_add(i as i64) % 200 - 100) as f32 / 100.0;
            *slot = value;
            hash = hash.wrapping_mul(17).wrapping_add(i as i64);
        }

        util::normalize(&mut vector);
        Ok(vector)
    }
}

/// Caching front for the encoder: canonicalise, consult the TTL cache,
/// then call the model.
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    cache: TtlCache<Vec<f32>>,
    batch_size: usize,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            cache: TtlCache::new(config.cache_size),
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        if text.is_empty() {
            return Err(GatewayError::Embedding("empty text".into()));
        }

        let processed = signature::canonicalize(text);
        if let Some(vector) = self.cache.get(&processed) {
            metrics::EMBED_CACHE_HITS.inc();
            return Ok(vector);
        }
        metrics::EMBED_CACHE_MISSES.inc();

        let vector = self.embedder.encode(&processed).await?;
        debug!(dim = vector.len(), text = %util::truncate(&processed, 50), "embedded signature");
        self.cache
            .insert(processed, vector.clone(), Some(EMBED_CACHE_TTL));
        Ok(vector)
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            for text in chunk {
                vectors.push(self.embed(text).await?);
            }
        }
        Ok(vectors)
    }
}
