//! Cache-related errors.

use thiserror::Error;

/// Errors that can occur when working with caches.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache error: {0}")]
    Other(String),
}
