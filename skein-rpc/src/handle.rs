//! Remote handles and `to_remote`: transparent proxies to objects hosted by an RPC
//! server.
//!
//! A [`RemoteHandle`] carries (host, port, oid, class name) plus the cached method
//! metadata from the registry, which is sufficient to place calls: sync methods
//! block for the value, async methods return an [`AsyncResult`]. Conversion to a
//! handle is always an explicit caller decision via [`to_remote`].

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use skein::message::short_id;
use skein::retry::RetryPolicy;

use crate::async_result::AsyncResult;
use crate::client::{CallReply, RpcClient};
use crate::error::RpcError;
use crate::protocol::MethodEntry;
use crate::registry::{self, MethodKind};
use crate::server::{RpcServer, ServerConfig};

/// Handle to one object on an RPC server. Serializable; a deserialized handle is
/// immediately usable for calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub host: String,
    pub port: u16,
    pub oid: String,
    pub class_name: String,
    /// Cached callable-method metadata from the class registry.
    pub methods: Vec<MethodEntry>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RemoteHandle {
    fn client(&self) -> RpcClient {
        RpcClient::new(self.host.clone(), self.port)
    }

    pub fn method_kind(&self, method: &str) -> Option<MethodKind> {
        self.methods
            .iter()
            .find(|m| m.name == method)
            .map(|m| m.kind)
    }

    /// Calls a method and returns its decoded value. Sync methods block on the
    /// single RPC; async methods go through an [`AsyncResult`] internally, so the
    /// handle behaves like the local object at the method-call boundary.
    pub async fn call(&self, method: &str, args: JsonValue) -> Result<JsonValue, RpcError> {
        match self.method_kind(method) {
            None => Err(RpcError::UnsupportedMethod(method.to_string())),
            Some(MethodKind::Sync) => match self
                .client()
                .call_method(&self.oid, method, args, None)
                .await?
            {
                CallReply::Value(value) => Ok(value),
                CallReply::TaskId(task_id) => {
                    // Server disagrees with the cached metadata; fetch the value.
                    let mut result =
                        AsyncResult::assigned(self.host.clone(), self.port, task_id, self.retry.clone());
                    result.result().await
                }
            },
            Some(MethodKind::Async) => {
                let mut result = self.call_async(method, args)?;
                result.result().await
            }
        }
    }

    /// Starts an async method call, returning a result-caching future immediately.
    /// The RPC itself runs on a background task; the returned [`AsyncResult`] first
    /// awaits the task-id assignment, then fetches via `update_placeholder`.
    pub fn call_async(&self, method: &str, args: JsonValue) -> Result<AsyncResult, RpcError> {
        if self.method_kind(method).is_none() {
            return Err(RpcError::UnsupportedMethod(method.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        let client = self.client();
        let oid = self.oid.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            let outcome = match client.call_method(&oid, &method, args, None).await {
                Ok(CallReply::TaskId(task_id)) => Ok(task_id),
                Ok(CallReply::Value(_)) => Err(RpcError::CallFailed {
                    host: client.host().to_string(),
                    port: client.port(),
                    message: format!("method {} returned a value instead of a task id", method),
                }),
                Err(e) => Err(e),
            };
            let _ = tx.send(outcome);
        });
        Ok(AsyncResult::pending(
            self.host.clone(),
            self.port,
            rx,
            self.retry.clone(),
        ))
    }

    /// Deletes the remote object this handle points at.
    pub async fn delete(&self) -> Result<(), RpcError> {
        self.client().delete_object(&self.oid).await
    }
}

/// Options for [`to_remote`].
#[derive(Clone, Debug)]
pub struct ToRemoteOptions {
    pub host: String,
    /// `None` starts (or reuses) a process-local server.
    pub port: Option<u16>,
    /// Bind to an existing object instead of creating one.
    pub existing_oid: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for ToRemoteOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            existing_oid: None,
            retry: RetryPolicy::default(),
        }
    }
}

static LOCAL_SERVER: once_cell::sync::Lazy<tokio::sync::Mutex<Option<std::sync::Arc<RpcServer>>>> =
    once_cell::sync::Lazy::new(|| tokio::sync::Mutex::new(None));

/// Starts the process-local server on an ephemeral port, or reuses the running one.
async fn local_server_port() -> Result<u16, RpcError> {
    let mut guard = LOCAL_SERVER.lock().await;
    if let Some(server) = guard.as_ref() {
        return Ok(server.port());
    }
    let server = RpcServer::start(ServerConfig::default()).await?;
    let port = server.port();
    *guard = Some(std::sync::Arc::new(server));
    Ok(port)
}

/// Converts a registered class into a remote handle.
///
/// With no port, a local server is started (or reused) and a fresh instance is
/// registered on it. With a port, the existing server is used: either a new object
/// is created from `init_args`, or — with `existing_oid` — the handle binds to an
/// object that already lives there.
pub async fn to_remote(
    class_name: &str,
    init_args: JsonValue,
    options: ToRemoteOptions,
) -> Result<RemoteHandle, RpcError> {
    let methods = registry::method_entries(class_name)
        .ok_or_else(|| RpcError::UnknownClass(class_name.to_string()))?;

    let (host, port) = match options.port {
        Some(port) => (options.host.clone(), port),
        None => ("127.0.0.1".to_string(), local_server_port().await?),
    };

    let oid = match options.existing_oid {
        Some(oid) => oid,
        None => {
            let oid = short_id();
            RpcClient::new(host.clone(), port)
                .create_object(class_name, &oid, init_args)
                .await?;
            oid
        }
    };

    Ok(RemoteHandle {
        host,
        port,
        oid,
        class_name: class_name.to_string(),
        methods,
        retry: options.retry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trips_through_json() {
        let handle = RemoteHandle {
            host: "127.0.0.1".into(),
            port: 4321,
            oid: "abc".into(),
            class_name: "Echo".into(),
            methods: vec![MethodEntry {
                name: "greet".into(),
                kind: MethodKind::Async,
            }],
            retry: RetryPolicy::default(),
        };
        let json = serde_json::to_string(&handle).unwrap();
        let back: RemoteHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.oid, "abc");
        assert_eq!(back.method_kind("greet"), Some(MethodKind::Async));
        assert_eq!(back.method_kind("missing"), None);
    }

    #[tokio::test]
    async fn unknown_class_is_rejected() {
        let err = to_remote(
            "handle-test-unregistered",
            JsonValue::Null,
            ToRemoteOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::UnknownClass(_)));
    }
}
