//! In-memory cache with optional per-entry TTL. Not persistent.

use std::hash::Hash;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Cache, CacheError};

/// DashMap-backed cache; expired entries are dropped lazily on `get`.
pub struct InMemoryCache<K, V>
where
    K: Eq + Hash,
{
    data: DashMap<K, (V, Option<Instant>)>,
}

impl<K, V> InMemoryCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<K, V> Default for InMemoryCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for InMemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Option<V> {
        let expired = match self.data.get(key) {
            Some(entry) => match entry.1 {
                Some(deadline) => Instant::now() > deadline,
                None => return Some(entry.0.clone()),
            },
            None => return None,
        };
        if expired {
            self.data.remove(key);
            None
        } else {
            self.data.get(key).map(|entry| entry.0.clone())
        }
    }

    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let deadline = ttl.map(|d| Instant::now() + d);
        self.data.insert(key, (value, deadline));
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<(), CacheError> {
        self.data.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.data.clear();
        Ok(())
    }
}
