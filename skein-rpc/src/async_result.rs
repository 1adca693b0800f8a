//! Result-caching future for async remote calls.
//!
//! An [`AsyncResult`] starts as a pending stub (awaiting task-id assignment from the
//! in-flight `call_method`), becomes assigned, and finally ready. `result()` fetches
//! the value via retry-wrapped `update_placeholder`, downloads any non-web file URLs
//! in a returned message to local storage, and caches the value: once filled,
//! subsequent reads never contact the server again.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use skein::message::{ContentBlock, MediaSource, Message};
use skein::retry::RetryPolicy;

use crate::client::RpcClient;
use crate::error::RpcError;

/// True for URLs reachable over the web (left untouched by file localization).
pub fn is_web_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("skein-rpc-files")
}

enum TaskState {
    /// `call_method` is still in flight; the sender delivers the task id.
    Pending(oneshot::Receiver<Result<u64, RpcError>>),
    Assigned(u64),
    Ready { task_id: u64, value: JsonValue },
    Failed(String),
}

/// Future-like handle to a value computed on a remote server.
pub struct AsyncResult {
    host: String,
    port: u16,
    retry: RetryPolicy,
    download_dir: PathBuf,
    state: TaskState,
}

impl AsyncResult {
    pub(crate) fn pending(
        host: impl Into<String>,
        port: u16,
        rx: oneshot::Receiver<Result<u64, RpcError>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            retry,
            download_dir: default_download_dir(),
            state: TaskState::Pending(rx),
        }
    }

    /// Handle for a task id that is already assigned (e.g. received over the wire).
    pub fn assigned(host: impl Into<String>, port: u16, task_id: u64, retry: RetryPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            retry,
            download_dir: default_download_dir(),
            state: TaskState::Assigned(task_id),
        }
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// The assigned task id, `None` while the stub is still pending.
    pub fn task_id(&self) -> Option<u64> {
        match &self.state {
            TaskState::Assigned(id) | TaskState::Ready { task_id: id, .. } => Some(*id),
            TaskState::Pending(_) | TaskState::Failed(_) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, TaskState::Ready { .. })
    }

    async fn ensure_task_id(&mut self) -> Result<u64, RpcError> {
        match &self.state {
            TaskState::Assigned(id) | TaskState::Ready { task_id: id, .. } => return Ok(*id),
            TaskState::Failed(message) => {
                return Err(RpcError::CallFailed {
                    host: self.host.clone(),
                    port: self.port,
                    message: message.clone(),
                })
            }
            TaskState::Pending(_) => {}
        }
        let state = std::mem::replace(
            &mut self.state,
            TaskState::Failed("task id receiver taken".to_string()),
        );
        let TaskState::Pending(rx) = state else {
            unreachable!("non-pending states returned above");
        };
        match rx.await {
            Ok(Ok(task_id)) => {
                self.state = TaskState::Assigned(task_id);
                Ok(task_id)
            }
            Ok(Err(e)) => {
                self.state = TaskState::Failed(e.to_string());
                Err(e)
            }
            Err(_) => {
                let message = "task id sender dropped before assignment".to_string();
                self.state = TaskState::Failed(message.clone());
                Err(RpcError::CallFailed {
                    host: self.host.clone(),
                    port: self.port,
                    message,
                })
            }
        }
    }

    /// Fetches (or returns the cached) value. The first successful call performs at
    /// most one `update_placeholder` round per retry attempt; after success the
    /// value is owned locally and reads are pure.
    pub async fn result(&mut self) -> Result<JsonValue, RpcError> {
        if let TaskState::Ready { value, .. } = &self.state {
            return Ok(value.clone());
        }
        let task_id = self.ensure_task_id().await?;
        let client = RpcClient::new(self.host.clone(), self.port);
        let value = self
            .retry
            .retry("update_placeholder", || client.update_placeholder(task_id))
            .await
            .map_err(|e| RpcError::TimeoutExceeded(e.to_string()))?;
        let value = self.localize_files(&client, value).await?;
        self.state = TaskState::Ready {
            task_id,
            value: value.clone(),
        };
        Ok(value)
    }

    /// If the value is a message, downloads every media URL that is not
    /// web-reachable into local storage and rewrites the URL to the local path.
    async fn localize_files(
        &self,
        client: &RpcClient,
        value: JsonValue,
    ) -> Result<JsonValue, RpcError> {
        let Ok(mut msg) = serde_json::from_value::<Message>(value.clone()) else {
            return Ok(value);
        };
        let mut changed = false;
        if let Some(blocks) = msg.content.as_blocks_mut() {
            for block in blocks.iter_mut() {
                let source = match block {
                    ContentBlock::Image { source }
                    | ContentBlock::Audio { source }
                    | ContentBlock::Video { source } => source,
                    _ => continue,
                };
                if let MediaSource::Url { url } = source {
                    if !is_web_url(url) {
                        let local = client.download_file(url, &self.download_dir).await?;
                        *url = local.to_string_lossy().into_owned();
                        changed = true;
                    }
                }
            }
        }
        if changed {
            Ok(serde_json::to_value(msg)?)
        } else {
            Ok(value)
        }
    }

    /// Wire form for shipping this handle to another process. A completed handle
    /// carries its value so the receiver never contacts the server; call only after
    /// the task id is assigned.
    pub fn to_wire(&self) -> Result<AsyncResultWire, RpcError> {
        match &self.state {
            TaskState::Ready { task_id, value } => Ok(AsyncResultWire {
                host: self.host.clone(),
                port: self.port,
                task_id: *task_id,
                value: Some(value.clone()),
                retry: self.retry.clone(),
            }),
            TaskState::Assigned(task_id) => Ok(AsyncResultWire {
                host: self.host.clone(),
                port: self.port,
                task_id: *task_id,
                value: None,
                retry: self.retry.clone(),
            }),
            TaskState::Pending(_) => Err(RpcError::CallFailed {
                host: self.host.clone(),
                port: self.port,
                message: "cannot serialize before task id assignment".to_string(),
            }),
            TaskState::Failed(message) => Err(RpcError::CallFailed {
                host: self.host.clone(),
                port: self.port,
                message: message.clone(),
            }),
        }
    }
}

/// Serialized [`AsyncResult`]: the task id, plus the value when already fetched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AsyncResultWire {
    pub host: String,
    pub port: u16,
    pub task_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl From<AsyncResultWire> for AsyncResult {
    fn from(wire: AsyncResultWire) -> Self {
        let state = match wire.value {
            Some(value) => TaskState::Ready {
                task_id: wire.task_id,
                value,
            },
            None => TaskState::Assigned(wire.task_id),
        };
        Self {
            host: wire.host,
            port: wire.port,
            retry: wire.retry,
            download_dir: default_download_dir(),
            state,
        }
    }
}
