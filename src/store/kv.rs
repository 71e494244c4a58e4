// Watched key-value store seam
// put/get/delete/watch-by-prefix with ordered events per key; the etcd
// binding plugs in behind this trait, the in-memory store backs tests
// and the single-binary deployment
//
// Numan Thabit 2025 Nov

use crate::errors::GatewayError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    pub value: String,
}

/// Events for a given key are delivered in commit order; no order is
/// guaranteed between keys.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<(), GatewayError>;
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;
    async fn delete(&self, key: &str) -> Result<(), GatewayError>;
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, GatewayError>;
    /// Subscribers receive every subsequent event; filter by prefix on
    /// the receiving side.
    fn watch(&self) -> broadcast::Receiver<KvEvent>;
}

pub struct MemoryConfigStore {
    entries: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<KvEvent>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
        }
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn put(&self, key: &str, value: String) -> Result<(), GatewayError> {
        self.entries
            .write()
            .map_err(|_| GatewayError::Store("kv map poisoned".into()))?
            .insert(key.to_string(), value.clone());
        let _ = self.events.send(KvEvent {
            kind: KvEventKind::Put,
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| GatewayError::Store("kv map poisoned".into()))?
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        let removed = self
            .entries
            .write()
            .map_err(|_| GatewayError::Store("kv map poisoned".into()))?
            .remove(key);
        if removed.is_some() {
            let _ = self.events.send(KvEvent {
                kind: KvEventKind::Delete,
                key: key.to_string(),
                value: String::new(),
            });
        }
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, GatewayError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| GatewayError::Store("kv map poisoned".into()))?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<KvEvent> {
        self.events.subscribe()
    }
}
