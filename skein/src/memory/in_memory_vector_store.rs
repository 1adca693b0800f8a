//! In-memory vector store for semantic search over memory records.
//!
//! Uses embeddings for cosine-similarity search. Not persistent.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::embedder::Embedder;
use super::record::RecordPayload;
use super::store::{SearchHit, SearchQuery, StoreError, StoredVector, VectorStore};

/// Pure in-memory vector store keyed by record id.
///
/// Text queries are embedded through the owned [`Embedder`]; vector queries skip it.
/// All data is lost when the store is dropped.
pub struct InMemoryVectorStore {
    data: DashMap<String, Entry>,
    embedder: Arc<dyn Embedder>,
}

#[derive(Clone)]
struct Entry {
    vector: Vec<f32>,
    payload: RecordPayload,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            data: DashMap::new(),
            embedder,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cosine similarity; 0.0 when either vector has zero magnitude.
    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }

    async fn query_vector(&self, query: SearchQuery) -> Result<Vec<f32>, StoreError> {
        match query {
            SearchQuery::Vector(v) => Ok(v),
            SearchQuery::Text(text) => {
                let vectors = self.embedder.embed(&[&text]).await?;
                vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| StoreError::Embedding("no vector returned".into()))
            }
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, entries: Vec<StoredVector>) -> Result<(), StoreError> {
        for entry in entries {
            self.data.insert(
                entry.id,
                Entry {
                    vector: entry.vector,
                    payload: entry.payload,
                },
            );
        }
        Ok(())
    }

    async fn update(
        &self,
        id: &str,
        vector: Vec<f32>,
        payload: RecordPayload,
    ) -> Result<(), StoreError> {
        match self.data.get_mut(id) {
            Some(mut entry) => {
                entry.vector = vector;
                entry.payload = payload;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.data.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SearchHit>, StoreError> {
        Ok(self.data.get(id).map(|entry| SearchHit {
            id: id.to_string(),
            score: 0.0,
            payload: entry.payload.clone(),
            embedding: Some(entry.vector.clone()),
        }))
    }

    async fn search(&self, query: SearchQuery, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let query_vec = self.query_vector(query).await?;

        let mut hits: Vec<SearchHit> = self
            .data
            .iter()
            .map(|entry| SearchHit {
                id: entry.key().clone(),
                score: Self::cosine_similarity(&query_vec, &entry.vector),
                payload: entry.payload.clone(),
                embedding: Some(entry.vector.clone()),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        self.data.clear();
        Ok(())
    }
}
