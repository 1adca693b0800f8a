//! RPC client: one WebSocket connection per call, with the is_alive probe that
//! classifies transport failures as server-not-alive or call-failed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::RpcError;
use crate::protocol::{ObjectSummary, RpcRequest, RpcResponse, ServerInfoData};

const ALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply to `call_method`: a value (sync method) or a task id (async method).
#[derive(Clone, Debug)]
pub enum CallReply {
    Value(JsonValue),
    TaskId(u64),
}

/// Client for one RPC server address.
#[derive(Clone, Debug)]
pub struct RpcClient {
    host: String,
    port: u16,
}

impl RpcClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }

    fn call_failed(&self, message: impl Into<String>) -> RpcError {
        RpcError::CallFailed {
            host: self.host.clone(),
            port: self.port,
            message: message.into(),
        }
    }

    /// Sends one request and reads one text response on a fresh connection.
    async fn roundtrip(&self, req: &RpcRequest) -> Result<RpcResponse, RpcError> {
        let (mut ws, _) = connect_async(self.url())
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        ws.send(WsMessage::Text(serde_json::to_string(req)?))
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        while let Some(incoming) = ws.next().await {
            let msg = incoming.map_err(|e| RpcError::Transport(e.to_string()))?;
            if let WsMessage::Text(text) = msg {
                return Ok(serde_json::from_str(&text)?);
            }
        }
        Err(RpcError::Transport("connection closed before response".into()))
    }

    /// Roundtrip with transport-failure classification: dead server surfaces
    /// `ServerNotAlive`, a live one `CallFailed` with the original cause.
    async fn request(&self, req: RpcRequest) -> Result<RpcResponse, RpcError> {
        match self.roundtrip(&req).await {
            Ok(resp) => Ok(resp),
            Err(RpcError::Transport(message)) => {
                if self.is_alive().await {
                    Err(self.call_failed(message))
                } else {
                    Err(RpcError::ServerNotAlive {
                        host: self.host.clone(),
                        port: self.port,
                        message,
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Idempotent liveness probe with a short timeout.
    pub async fn is_alive(&self) -> bool {
        matches!(
            tokio::time::timeout(ALIVE_PROBE_TIMEOUT, self.roundtrip(&RpcRequest::IsAlive)).await,
            Ok(Ok(RpcResponse::Alive { ok: true }))
        )
    }

    pub async fn create_object(
        &self,
        class_name: &str,
        oid: &str,
        init_args: JsonValue,
    ) -> Result<(), RpcError> {
        let req = RpcRequest::CreateObject {
            class_name: class_name.to_string(),
            oid: oid.to_string(),
            init_args,
        };
        match self.roundtrip(&req).await {
            Ok(RpcResponse::Ok) => Ok(()),
            Ok(RpcResponse::Error { message }) => Err(RpcError::CreationFailed {
                host: self.host.clone(),
                port: self.port,
                message,
            }),
            Ok(other) => Err(self.call_failed(format!("unexpected response: {:?}", other))),
            Err(RpcError::Transport(message)) => {
                if self.is_alive().await {
                    Err(RpcError::CreationFailed {
                        host: self.host.clone(),
                        port: self.port,
                        message,
                    })
                } else {
                    Err(RpcError::ServerNotAlive {
                        host: self.host.clone(),
                        port: self.port,
                        message,
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn call_method(
        &self,
        oid: &str,
        method: &str,
        args: JsonValue,
        timeout_ms: Option<u64>,
    ) -> Result<CallReply, RpcError> {
        let req = RpcRequest::CallMethod {
            oid: oid.to_string(),
            method: method.to_string(),
            args,
            timeout_ms,
        };
        match self.request(req).await? {
            RpcResponse::Value { value } => Ok(CallReply::Value(value)),
            RpcResponse::TaskId { task_id } => Ok(CallReply::TaskId(task_id)),
            RpcResponse::Error { message } => {
                if message.starts_with("unsupported method") {
                    Err(RpcError::UnsupportedMethod(message))
                } else {
                    Err(self.call_failed(message))
                }
            }
            other => Err(self.call_failed(format!("unexpected response: {:?}", other))),
        }
    }

    /// Fetches the value of an async call; the server blocks until it is ready.
    pub async fn update_placeholder(&self, task_id: u64) -> Result<JsonValue, RpcError> {
        match self.request(RpcRequest::UpdatePlaceholder { task_id }).await? {
            RpcResponse::Value { value } => Ok(value),
            RpcResponse::Error { message } => Err(self.call_failed(message)),
            other => Err(self.call_failed(format!("unexpected response: {:?}", other))),
        }
    }

    pub async fn delete_object(&self, oid: &str) -> Result<(), RpcError> {
        self.expect_ok(RpcRequest::DeleteObject {
            oid: oid.to_string(),
        })
        .await
    }

    pub async fn delete_all(&self) -> Result<(), RpcError> {
        self.expect_ok(RpcRequest::DeleteAll).await
    }

    /// Requests server shutdown; in-flight calls complete best-effort.
    pub async fn stop(&self) -> Result<(), RpcError> {
        self.expect_ok(RpcRequest::Stop).await
    }

    pub async fn set_model_configs(&self, configs: JsonValue) -> Result<(), RpcError> {
        self.expect_ok(RpcRequest::SetModelConfigs { configs }).await
    }

    async fn expect_ok(&self, req: RpcRequest) -> Result<(), RpcError> {
        match self.request(req).await? {
            RpcResponse::Ok => Ok(()),
            RpcResponse::Error { message } => Err(self.call_failed(message)),
            other => Err(self.call_failed(format!("unexpected response: {:?}", other))),
        }
    }

    pub async fn list_objects(&self) -> Result<Vec<ObjectSummary>, RpcError> {
        match self.request(RpcRequest::ListObjects).await? {
            RpcResponse::Objects { objects } => Ok(objects),
            RpcResponse::Error { message } => Err(self.call_failed(message)),
            other => Err(self.call_failed(format!("unexpected response: {:?}", other))),
        }
    }

    pub async fn server_info(&self) -> Result<ServerInfoData, RpcError> {
        match self.request(RpcRequest::ServerInfo).await? {
            RpcResponse::ServerInfo { info } => Ok(info),
            RpcResponse::Error { message } => Err(self.call_failed(message)),
            other => Err(self.call_failed(format!("unexpected response: {:?}", other))),
        }
    }

    pub async fn get_object_memory(&self, oid: &str) -> Result<JsonValue, RpcError> {
        match self
            .request(RpcRequest::GetObjectMemory {
                oid: oid.to_string(),
            })
            .await?
        {
            RpcResponse::Value { value } => Ok(value),
            RpcResponse::Error { message } => Err(self.call_failed(message)),
            other => Err(self.call_failed(format!("unexpected response: {:?}", other))),
        }
    }

    /// Downloads a file from the server into `local_dir`, returning the local path.
    /// The local name is a stable hash prefix plus the remote base name.
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_dir: &Path,
    ) -> Result<PathBuf, RpcError> {
        std::fs::create_dir_all(local_dir)?;
        let base_name = Path::new(remote_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let mut hasher = DefaultHasher::new();
        remote_path.hash(&mut hasher);
        let local_path = local_dir.join(format!("{:05x}_{}", hasher.finish() & 0xfffff, base_name));

        let (mut ws, _) = connect_async(self.url())
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let req = RpcRequest::DownloadFile {
            path: remote_path.to_string(),
        };
        ws.send(WsMessage::Text(serde_json::to_string(&req)?))
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let mut bytes: Vec<u8> = Vec::new();
        loop {
            let Some(incoming) = ws.next().await else {
                return Err(RpcError::Transport(
                    "connection closed mid file transfer".into(),
                ));
            };
            match incoming.map_err(|e| RpcError::Transport(e.to_string()))? {
                WsMessage::Binary(chunk) => bytes.extend_from_slice(&chunk),
                WsMessage::Text(text) => match serde_json::from_str::<RpcResponse>(&text)? {
                    RpcResponse::FileEnd { size } => {
                        if size != bytes.len() as u64 {
                            return Err(self.call_failed(format!(
                                "file transfer size mismatch: expected {}, got {}",
                                size,
                                bytes.len()
                            )));
                        }
                        break;
                    }
                    RpcResponse::Error { message } => return Err(self.call_failed(message)),
                    other => {
                        return Err(self.call_failed(format!("unexpected response: {:?}", other)))
                    }
                },
                _ => continue,
            }
        }
        std::fs::write(&local_path, bytes)?;
        Ok(local_path)
    }
}
