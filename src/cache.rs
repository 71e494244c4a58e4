// Bounded TTL cache
// LRU with per-entry expiry, used by the sampler dedup path, the vector
// agent lookup caches, and the embedding cache
//
// Numan Thabit 2025 Nov

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

/// Thread-safe bounded LRU where each entry may carry its own TTL.
/// Expired entries are dropped lazily on access and by `purge_expired`.
pub struct TtlCache<V> {
    inner: Mutex<LruCache<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(key) {
            Some(entry) => match entry.expires_at {
                Some(at) if Instant::now() >= at => {}
                _ => return Some(entry.value.clone()),
            },
            None => return None,
        }
        inner.pop(key);
        None
    }

    /// `ttl = None` means the entry never expires (still subject to LRU
    /// eviction).
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.inner.lock().unwrap().put(key.into(), entry);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().unwrap().pop(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose TTL has passed. Called from a periodic
    /// sweep so idle entries do not pin memory until evicted.
    pub fn purge_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| now >= at))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.pop(&key);
        }
    }
}
