//! RPC error taxonomy.
//!
//! Transport failures are probed against `is_alive` first: a dead server surfaces
//! [`RpcError::ServerNotAlive`], anything else [`RpcError::CallFailed`] with the
//! original cause.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("server at {host}:{port} is not alive: {message}")]
    ServerNotAlive {
        host: String,
        port: u16,
        message: String,
    },
    #[error("failed to create object on {host}:{port}: {message}")]
    CreationFailed {
        host: String,
        port: u16,
        message: String,
    },
    #[error("call to {host}:{port} failed: {message}")]
    CallFailed {
        host: String,
        port: u16,
        message: String,
    },
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("class {0} is already registered")]
    DuplicateClass(String),
    #[error("class {0} not found in the registry")]
    UnknownClass(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("rpc io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout exceeded: {0}")]
    TimeoutExceeded(String),
    #[error("service error: {0}")]
    Service(String),
}
