//! Embedder trait. Used to produce vectors from text for insert and search.
//!
//! Implementations can wrap OpenAI-compatible APIs or mock embedders for tests.

use async_trait::async_trait;

use super::store::StoreError;

/// Produces fixed-size float vectors from text. Vector stores embed value text on
/// insert and query text on search through this trait.
///
/// Implementations must be `Send + Sync` for use with async store methods.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds each text into a vector of dimension [`Embedder::dimension`].
    /// Returns one vector per input text in the same order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StoreError>;

    /// Vector dimension returned by [`Embedder::embed`].
    fn dimension(&self) -> usize;
}
