// Message bus seam
// Ships sampled error events from the data plane to the control plane.
// FIFO per topic, at-least-once from the consumer's point of view; the
// Kafka binding plugs in behind this trait
//
// Numan Thabit 2025 Nov

use crate::errors::GatewayError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), GatewayError>;
    /// Register a consumer for `topic`; every payload published after
    /// this call is delivered in publish order.
    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Vec<u8>>;
}

pub struct MemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, _key: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| GatewayError::Bus("subscriber map poisoned".into()))?;
        if let Some(senders) = subscribers.get_mut(topic) {
            senders.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("error-events");

        bus.publish("error-events", "k1", b"one".to_vec()).await.unwrap();
        bus.publish("error-events", "k2", b"two".to_vec()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"one");
        assert_eq!(rx.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = MemoryBus::new();
        let mut errors = bus.subscribe("error-events");
        let mut other = bus.subscribe("other");

        bus.publish("other", "k", b"x".to_vec()).await.unwrap();
        assert_eq!(other.recv().await.unwrap(), b"x");
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = MemoryBus::new();
        assert!(bus.publish("nowhere", "k", b"x".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("error-events");
        drop(rx);
        bus.publish("error-events", "k", b"x".to_vec()).await.unwrap();
        assert!(bus.subscribers.lock().unwrap()["error-events"].is_empty());
    }
}
