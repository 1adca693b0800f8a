//! Vector store gateway: insert/update/delete/search embeddings with attached payloads.

use async_trait::async_trait;
use thiserror::Error;

use super::record::RecordPayload;

/// Errors from vector stores and embedders.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

/// One entry to insert: id, embedding vector, payload.
#[derive(Clone, Debug)]
pub struct StoredVector {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: RecordPayload,
}

/// One search or get result.
#[derive(Clone, Debug)]
pub struct SearchHit {
    pub id: String,
    /// Similarity score; 0.0 for direct `get`.
    pub score: f32,
    pub payload: RecordPayload,
    pub embedding: Option<Vec<f32>>,
}

/// Search input: raw text (the store embeds it) or a precomputed vector.
#[derive(Clone, Debug)]
pub enum SearchQuery {
    Text(String),
    Vector(Vec<f32>),
}

/// Store for memory-record embeddings, keyed by opaque id.
///
/// Search results come back in descending similarity; callers needing the memory
/// ordering re-sort by `payload.last_modified_at`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert(&self, entries: Vec<StoredVector>) -> Result<(), StoreError>;

    /// Replaces vector and payload for an existing id.
    async fn update(
        &self,
        id: &str,
        vector: Vec<f32>,
        payload: RecordPayload,
    ) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<SearchHit>, StoreError>;

    async fn search(&self, query: SearchQuery, limit: usize) -> Result<Vec<SearchHit>, StoreError>;

    /// Removes every entry.
    async fn reset(&self) -> Result<(), StoreError>;
}
