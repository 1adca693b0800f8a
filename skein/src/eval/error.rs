//! Evaluation-related errors.

use thiserror::Error;

/// Errors surfaced by the evaluation driver, metrics, and storage.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Bad construction input (empty benchmark, zero repeats or workers). Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("eval io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("eval serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("metric error: {0}")]
    Metric(String),
    #[error("solution error: {0}")]
    Solution(String),
}
