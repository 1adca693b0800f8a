//! Wire protocol: JSON tagged request/response frames over WebSocket.
//!
//! Each frame is one JSON object with `"type": "<variant_name>"`. Method arguments
//! and return values are opaque JSON blobs; the transport never interprets them.
//! `download_file` responses interleave binary frames (file chunks) before the
//! terminating [`RpcResponse::FileEnd`] text frame.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::registry::MethodKind;

/// Client-to-server request envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    CreateObject {
        class_name: String,
        oid: String,
        init_args: JsonValue,
    },
    CallMethod {
        oid: String,
        method: String,
        args: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Fetch the result of an async call by task id; blocks until ready.
    UpdatePlaceholder { task_id: u64 },
    DeleteObject { oid: String },
    DeleteAll,
    IsAlive,
    Stop,
    ListObjects,
    ServerInfo,
    SetModelConfigs { configs: JsonValue },
    GetObjectMemory { oid: String },
    DownloadFile { path: String },
}

/// One hosted object, as reported by `list_objects`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub oid: String,
    pub class_name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Server resource usage, as reported by `server_info`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerInfoData {
    pub id: String,
    pub object_count: usize,
    pub pending_tasks: usize,
    pub uptime_secs: u64,
}

/// One method of a remote class: name plus async/sync declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodEntry {
    pub name: String,
    pub kind: MethodKind,
}

/// Server-to-client response envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    Ok,
    Value { value: JsonValue },
    /// Async call accepted; fetch the result later via `update_placeholder`.
    TaskId { task_id: u64 },
    Alive { ok: bool },
    Objects { objects: Vec<ObjectSummary> },
    ServerInfo { info: ServerInfoData },
    /// Terminates a `download_file` chunk stream.
    FileEnd { size: u64 },
    Error { message: String },
}
