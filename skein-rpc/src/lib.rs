//! # skein-rpc
//!
//! Distributed RPC object layer: run any registered class in a separate server
//! process while callers use a local handle.
//!
//! - [`registry`]: process-wide [`ClassSpec`] registry; classes declare per-method
//!   async/sync behavior and a factory from an init-args blob.
//! - [`server`]: [`RpcServer`] hosting live instances keyed by oid, with a bounded
//!   task-result pool and streamed file download.
//! - [`client`]: [`RpcClient`] with one method per RPC and the is_alive probe.
//! - [`handle`]: [`RemoteHandle`] proxies and [`to_remote`] conversion.
//! - [`async_result`]: [`AsyncResult`] futures that cache their value once fetched.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use skein_rpc::{
//!     register_class, to_remote, ClassSpec, MethodKind, MethodSpec, RpcError, RpcService,
//!     ToRemoteOptions,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl RpcService for Echo {
//!     async fn dispatch(&mut self, method: &str, args: Value) -> Result<Value, RpcError> {
//!         match method {
//!             "greet" => {
//!                 let name = args["name"].as_str().unwrap_or("world");
//!                 Ok(json!(format!("hi {}", name)))
//!             }
//!             other => Err(RpcError::UnsupportedMethod(other.to_string())),
//!         }
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), RpcError> {
//! register_class(ClassSpec {
//!     name: "Echo",
//!     methods: &[MethodSpec { name: "greet", kind: MethodKind::Async }],
//!     factory: |_args| Ok(Box::new(Echo)),
//! })?;
//! let handle = to_remote("Echo", Value::Null, ToRemoteOptions::default()).await?;
//! let mut result = handle.call_async("greet", json!({"name": "x"}))?;
//! assert_eq!(result.result().await?, json!("hi x"));
//! # Ok(())
//! # }
//! ```

pub mod async_result;
pub mod client;
pub mod error;
pub mod handle;
pub mod protocol;
pub mod registry;
pub mod server;

pub use async_result::{is_web_url, AsyncResult, AsyncResultWire};
pub use client::{CallReply, RpcClient};
pub use error::RpcError;
pub use handle::{to_remote, RemoteHandle, ToRemoteOptions};
pub use protocol::{MethodEntry, ObjectSummary, RpcRequest, RpcResponse, ServerInfoData};
pub use registry::{
    lookup_class, method_entries, model_configs, register_class, set_model_configs, ClassSpec,
    MethodKind, MethodSpec, RpcService,
};
pub use server::{RpcServer, ServerConfig, FILE_CHUNK_SIZE};
