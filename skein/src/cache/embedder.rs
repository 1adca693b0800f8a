//! Embedder wrapper that caches vectors keyed by (model id, text).

use std::sync::Arc;

use async_trait::async_trait;

use super::Cache;
use crate::memory::{Embedder, StoreError};

/// Wraps an [`Embedder`] with a pluggable cache. Cache failures are logged and the
/// inner embedder is used; embedding results are written back best-effort.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<dyn Cache<String, Vec<f32>>>,
    model_id: String,
}

impl CachedEmbedder {
    /// `model_id` distinguishes entries from different embedding models sharing a cache.
    pub fn new(
        inner: Arc<dyn Embedder>,
        cache: Arc<dyn Cache<String, Vec<f32>>>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            cache,
            model_id: model_id.into(),
        }
    }

    fn cache_key(&self, text: &str) -> String {
        format!("{}\u{1f}{}", self.model_id, text)
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StoreError> {
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<usize> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(&self.cache_key(text)).await {
                Some(vector) => results.push(Some(vector)),
                None => {
                    results.push(None);
                    misses.push(i);
                }
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<&str> = misses.iter().map(|&i| texts[i]).collect();
            let vectors = self.inner.embed(&miss_texts).await?;
            if vectors.len() != miss_texts.len() {
                return Err(StoreError::Embedding(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    miss_texts.len()
                )));
            }
            for (&i, vector) in misses.iter().zip(vectors) {
                if let Err(e) = self
                    .cache
                    .set(self.cache_key(texts[i]), vector.clone(), None)
                    .await
                {
                    tracing::warn!(error = %e, "embedding cache write failed");
                }
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StoreError> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn second_call_hits_the_cache() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(InMemoryCache::new());
        let cached = CachedEmbedder::new(inner.clone(), cache, "test-model");

        let first = cached.embed(&["hello"]).await.unwrap();
        let second = cached.embed(&["hello"]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mixed_hit_miss_preserves_order() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(InMemoryCache::new());
        let cached = CachedEmbedder::new(inner.clone(), cache, "test-model");

        cached.embed(&["aa"]).await.unwrap();
        let out = cached.embed(&["aa", "bbbb"]).await.unwrap();
        assert_eq!(out, vec![vec![2.0], vec![4.0]]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
