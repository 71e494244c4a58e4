// Vector store seam
// Append/fetch/delete/count for member vectors, keyed by event id; the
// persistent backing store plugs in behind this trait
//
// Numan Thabit 2025 Nov

use crate::errors::GatewayError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, id: &str, vector: Vec<f32>) -> Result<(), GatewayError>;
    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>, GatewayError>;
    async fn remove(&self, id: &str) -> Result<(), GatewayError>;
    async fn count(&self) -> Result<usize, GatewayError>;
}

pub struct MemoryVectorStore {
    vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn add(&self, id: &str, vector: Vec<f32>) -> Result<(), GatewayError> {
        self.vectors
            .write()
            .map_err(|_| GatewayError::Store("vector map poisoned".into()))?
            .insert(id.to_string(), vector);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>, GatewayError> {
        Ok(self
            .vectors
            .read()
            .map_err(|_| GatewayError::Store("vector map poisoned".into()))?
            .get(id)
            .cloned())
    }

    async fn remove(&self, id: &str) -> Result<(), GatewayError> {
        self.vectors
            .write()
            .map_err(|_| GatewayError::Store("vector map poisoned".into()))?
            .remove(id);
        Ok(())
    }

    async fn count(&self) -> Result<usize, GatewayError> {
        Ok(self
            .vectors
            .read()
            .map_err(|_| GatewayError::Store("vector map poisoned".into()))?
            .len())
    }
}
