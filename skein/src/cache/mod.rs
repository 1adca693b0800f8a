//! Cache for embeddings and other expensive model calls.
//!
//! [`Cache`] is a key-value trait with optional TTL; [`InMemoryCache`] backs tests and
//! short-lived processes, [`FileCache`] persists entries as JSON files with LRU
//! eviction under entry-count and byte-size caps. [`CachedEmbedder`] wraps any
//! [`Embedder`](crate::memory::Embedder) with a cache keyed by (model id, text).

mod embedder;
mod error;
mod file;
mod in_memory;

pub use embedder::CachedEmbedder;
pub use error::CacheError;
pub use file::FileCache;
pub use in_memory::InMemoryCache;

use async_trait::async_trait;
use std::time::Duration;

/// Key-value cache with optional TTL.
#[async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Clone + Send + Sync,
{
    /// Returns `None` if the key is not found or has expired.
    async fn get(&self, key: &K) -> Option<V>;

    /// Stores a value; `ttl = None` means the value never expires.
    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &K) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_trait_object() {
        let cache: Box<dyn Cache<String, String>> = Box::new(InMemoryCache::new());
        cache
            .set("key".to_string(), "value".to_string(), None)
            .await
            .unwrap();
        assert_eq!(
            cache.get(&"key".to_string()).await,
            Some("value".to_string())
        );
    }
}
