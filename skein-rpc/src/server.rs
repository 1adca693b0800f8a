//! RPC server: hosts live object instances keyed by oid over a WebSocket endpoint.
//!
//! Calls to the same object are serialized through a per-object async mutex;
//! distinct objects run concurrently. Async method results live in a bounded task
//! pool with per-entry expiry; overflow evicts the oldest entry. `stop` finishes
//! in-flight connections best-effort and then terminates the listener.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::Value as JsonValue;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, Notify};

use crate::error::RpcError;
use crate::protocol::{ObjectSummary, RpcRequest, RpcResponse, ServerInfoData};
use crate::registry::{self, MethodKind, RpcService};

/// Size of each binary frame in a `download_file` stream.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Server tuning knobs.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    /// Capacity of the async task-result pool; overflow evicts oldest.
    pub max_pool_size: usize,
    /// Task results older than this are dropped.
    pub task_expire: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_pool_size: 8192,
            task_expire: Duration::from_secs(7200),
        }
    }
}

#[derive(Clone)]
struct HostedEntry {
    class_name: String,
    created_at: chrono::DateTime<chrono::Utc>,
    instance: Arc<tokio::sync::Mutex<Box<dyn RpcService>>>,
}

struct TaskEntry {
    created: Instant,
    result: Option<Result<JsonValue, String>>,
    notify: Arc<Notify>,
}

/// Bounded pool of async-call results keyed by task id.
struct TaskPool {
    entries: HashMap<u64, TaskEntry>,
    order: VecDeque<u64>,
    capacity: usize,
    expire: Duration,
}

impl TaskPool {
    fn new(capacity: usize, expire: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            expire,
        }
    }

    fn purge_expired(&mut self) {
        let expire = self.expire;
        let entries = &mut self.entries;
        self.order.retain(|id| {
            let keep = entries
                .get(id)
                .map(|e| e.created.elapsed() < expire)
                .unwrap_or(false);
            if !keep {
                entries.remove(id);
            }
            keep
        });
    }

    fn allocate(&mut self, task_id: u64) -> Arc<Notify> {
        self.purge_expired();
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        let notify = Arc::new(Notify::new());
        self.entries.insert(
            task_id,
            TaskEntry {
                created: Instant::now(),
                result: None,
                notify: notify.clone(),
            },
        );
        self.order.push_back(task_id);
        notify
    }

    fn complete(&mut self, task_id: u64, result: Result<JsonValue, String>) {
        if let Some(entry) = self.entries.get_mut(&task_id) {
            entry.result = Some(result);
            entry.notify.notify_one();
        }
    }

    /// `(result-if-ready, notify)` for a known task, `None` for an unknown id.
    fn status(&mut self, task_id: u64) -> Option<(Option<Result<JsonValue, String>>, Arc<Notify>)> {
        self.purge_expired();
        self.entries
            .get(&task_id)
            .map(|e| (e.result.clone(), e.notify.clone()))
    }

    fn pending(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.result.is_none())
            .count()
    }
}

struct ServerState {
    server_id: String,
    objects: dashmap::DashMap<String, HostedEntry>,
    tasks: Mutex<TaskPool>,
    next_task_id: AtomicU64,
    started_at: Instant,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ServerState {
    fn trigger_shutdown(&self) {
        let tx = self.shutdown_tx.lock().ok().and_then(|mut g| g.take());
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, TaskPool> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A running RPC server bound to a local address.
pub struct RpcServer {
    state: Arc<ServerState>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl RpcServer {
    /// Binds the listener and starts serving in a background task.
    pub async fn start(config: ServerConfig) -> Result<Self, RpcError> {
        let listener =
            tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = Arc::new(ServerState {
            server_id: uuid::Uuid::new_v4().simple().to_string(),
            objects: dashmap::DashMap::new(),
            tasks: Mutex::new(TaskPool::new(config.max_pool_size, config.task_expire)),
            next_task_id: AtomicU64::new(0),
            started_at: Instant::now(),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        });

        let router = Router::new()
            .route("/", get(ws_handler))
            .with_state(state.clone());
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "rpc server terminated abnormally");
            }
        });

        tracing::info!(%addr, "rpc server started");
        Ok(Self {
            state,
            addr,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Requests shutdown; in-flight connections complete best-effort.
    pub fn stop(&self) {
        self.state.trigger_shutdown();
    }

    /// Waits until the server task has terminated.
    pub async fn stopped(self) {
        let _ = self.handle.await;
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    while let Some(incoming) = socket.recv().await {
        let msg = match incoming {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "read error (client closed?)");
                break;
            }
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let req: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                let resp = RpcResponse::Error {
                    message: format!("parse error: {}", e),
                };
                if send_response(&mut socket, &resp).await.is_err() {
                    break;
                }
                continue;
            }
        };
        let stop_after = matches!(req, RpcRequest::Stop);
        if let Err(e) = handle_request(&state, req, &mut socket).await {
            tracing::warn!(error = %e, "handle_request error");
            break;
        }
        if stop_after {
            state.trigger_shutdown();
            break;
        }
    }
}

async fn send_response(socket: &mut WebSocket, resp: &RpcResponse) -> Result<(), RpcError> {
    let text = serde_json::to_string(resp)?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))
}

async fn handle_request(
    state: &Arc<ServerState>,
    req: RpcRequest,
    socket: &mut WebSocket,
) -> Result<(), RpcError> {
    let resp = match req {
        RpcRequest::IsAlive => RpcResponse::Alive { ok: true },
        RpcRequest::Stop => RpcResponse::Ok,
        RpcRequest::CreateObject {
            class_name,
            oid,
            init_args,
        } => handle_create_object(state, &class_name, &oid, init_args),
        RpcRequest::CallMethod {
            oid,
            method,
            args,
            timeout_ms,
        } => handle_call_method(state, &oid, &method, args, timeout_ms).await,
        RpcRequest::UpdatePlaceholder { task_id } => {
            handle_update_placeholder(state, task_id).await
        }
        RpcRequest::DeleteObject { oid } => match state.objects.remove(&oid) {
            Some(_) => RpcResponse::Ok,
            None => RpcResponse::Error {
                message: format!("object {} not found", oid),
            },
        },
        RpcRequest::DeleteAll => {
            state.objects.clear();
            RpcResponse::Ok
        }
        RpcRequest::ListObjects => {
            let objects = state
                .objects
                .iter()
                .map(|entry| ObjectSummary {
                    oid: entry.key().clone(),
                    class_name: entry.class_name.clone(),
                    created_at: entry.created_at,
                })
                .collect();
            RpcResponse::Objects { objects }
        }
        RpcRequest::ServerInfo => RpcResponse::ServerInfo {
            info: ServerInfoData {
                id: state.server_id.clone(),
                object_count: state.objects.len(),
                pending_tasks: state.lock_tasks().pending(),
                uptime_secs: state.started_at.elapsed().as_secs(),
            },
        },
        RpcRequest::SetModelConfigs { configs } => {
            registry::set_model_configs(configs);
            RpcResponse::Ok
        }
        RpcRequest::GetObjectMemory { oid } => match state.objects.get(&oid) {
            Some(entry) => {
                let instance = entry.instance.clone();
                drop(entry);
                let memory = instance.lock().await.memory();
                RpcResponse::Value { value: memory }
            }
            None => RpcResponse::Error {
                message: format!("object {} not found", oid),
            },
        },
        RpcRequest::DownloadFile { path } => {
            return stream_file(socket, &path).await;
        }
    };
    send_response(socket, &resp).await
}

fn handle_create_object(
    state: &Arc<ServerState>,
    class_name: &str,
    oid: &str,
    init_args: JsonValue,
) -> RpcResponse {
    if state.objects.contains_key(oid) {
        return RpcResponse::Error {
            message: format!("object {} already exists", oid),
        };
    }
    let Some(spec) = registry::lookup_class(class_name) else {
        return RpcResponse::Error {
            message: format!("class {} not found", class_name),
        };
    };
    match (spec.factory)(init_args) {
        Ok(instance) => {
            state.objects.insert(
                oid.to_string(),
                HostedEntry {
                    class_name: class_name.to_string(),
                    created_at: chrono::Utc::now(),
                    instance: Arc::new(tokio::sync::Mutex::new(instance)),
                },
            );
            tracing::info!(class_name, oid, "object created");
            RpcResponse::Ok
        }
        Err(e) => RpcResponse::Error {
            message: format!("failed to construct {}: {}", class_name, e),
        },
    }
}

async fn handle_call_method(
    state: &Arc<ServerState>,
    oid: &str,
    method: &str,
    args: JsonValue,
    timeout_ms: Option<u64>,
) -> RpcResponse {
    let Some(entry) = state.objects.get(oid).map(|e| e.value().clone()) else {
        return RpcResponse::Error {
            message: format!("object {} not found", oid),
        };
    };
    let Some(spec) = registry::lookup_class(&entry.class_name) else {
        return RpcResponse::Error {
            message: format!("class {} not found", entry.class_name),
        };
    };
    let Some(method_spec) = spec.methods.iter().find(|m| m.name == method) else {
        return RpcResponse::Error {
            message: format!("unsupported method: {}", method),
        };
    };

    match method_spec.kind {
        MethodKind::Sync => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CALL_TIMEOUT);
            let method = method.to_string();
            let call = async {
                let mut guard = entry.instance.lock().await;
                guard.dispatch(&method, args).await
            };
            match tokio::time::timeout(timeout, call).await {
                Err(_) => RpcResponse::Error {
                    message: format!("call to {} timed out", method),
                },
                Ok(Err(e)) => RpcResponse::Error {
                    message: e.to_string(),
                },
                Ok(Ok(value)) => RpcResponse::Value { value },
            }
        }
        MethodKind::Async => {
            let task_id = state.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
            state.lock_tasks().allocate(task_id);
            let method = method.to_string();
            let instance = entry.instance.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let result = {
                    let mut guard = instance.lock().await;
                    guard.dispatch(&method, args).await
                };
                state
                    .lock_tasks()
                    .complete(task_id, result.map_err(|e| e.to_string()));
            });
            RpcResponse::TaskId { task_id }
        }
    }
}

async fn handle_update_placeholder(state: &Arc<ServerState>, task_id: u64) -> RpcResponse {
    let deadline = Instant::now() + DEFAULT_CALL_TIMEOUT;
    loop {
        let status = state.lock_tasks().status(task_id);
        let notify = match status {
            None => {
                return RpcResponse::Error {
                    message: format!("unknown task id {}", task_id),
                }
            }
            Some((Some(Ok(value)), _)) => return RpcResponse::Value { value },
            Some((Some(Err(message)), _)) => return RpcResponse::Error { message },
            Some((None, notify)) => notify,
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return RpcResponse::Error {
                message: format!("timed out waiting for task {}", task_id),
            };
        }
        let _ = tokio::time::timeout(remaining, notify.notified()).await;
    }
}

/// Streams file contents as fixed-size binary frames, then a `file_end` text frame.
async fn stream_file(socket: &mut WebSocket, path: &str) -> Result<(), RpcError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            return send_response(
                socket,
                &RpcResponse::Error {
                    message: format!("cannot open {}: {}", path, e),
                },
            )
            .await;
        }
    };
    let mut total: u64 = 0;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        total += read as u64;
        socket
            .send(Message::Binary(buf[..read].to_vec()))
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
    }
    send_response(socket, &RpcResponse::FileEnd { size: total }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_pool_evicts_oldest_on_overflow() {
        let mut pool = TaskPool::new(2, Duration::from_secs(60));
        pool.allocate(1);
        pool.allocate(2);
        pool.allocate(3);
        assert!(pool.status(1).is_none());
        assert!(pool.status(2).is_some());
        assert!(pool.status(3).is_some());
    }

    #[test]
    fn task_pool_completion_is_kept_until_expiry() {
        let mut pool = TaskPool::new(8, Duration::from_secs(60));
        pool.allocate(1);
        pool.complete(1, Ok(serde_json::json!("done")));
        let (result, _) = pool.status(1).unwrap();
        assert_eq!(result, Some(Ok(serde_json::json!("done"))));
        // Repeated fetches still see the result.
        let (result, _) = pool.status(1).unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn task_pool_purges_expired_entries() {
        let mut pool = TaskPool::new(8, Duration::from_millis(0));
        pool.allocate(1);
        std::thread::sleep(Duration::from_millis(2));
        assert!(pool.status(1).is_none());
    }

    #[test]
    fn task_pool_pending_counts_unfinished() {
        let mut pool = TaskPool::new(8, Duration::from_secs(60));
        pool.allocate(1);
        pool.allocate(2);
        pool.complete(1, Ok(JsonValue::Null));
        assert_eq!(pool.pending(), 1);
    }
}
