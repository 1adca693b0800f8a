//! End-to-end RPC tests: remote echo objects, async results, failure modes,
//! object lifecycle, and streamed file download.

use std::sync::Once;

use async_trait::async_trait;
use serde_json::{json, Value};

use skein::retry::RetryPolicy;
use skein_rpc::{
    register_class, to_remote, ClassSpec, MethodKind, MethodSpec, RpcClient, RpcError,
    RpcServer, RpcService, ServerConfig, ToRemoteOptions,
};

use ctor::ctor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[ctor]
fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_filter(filter),
        )
        .try_init();
}

struct Echo {
    greeted: u64,
}

#[async_trait]
impl RpcService for Echo {
    async fn dispatch(&mut self, method: &str, args: Value) -> Result<Value, RpcError> {
        match method {
            "greet" => {
                self.greeted += 1;
                let name = args["name"].as_str().unwrap_or("world");
                Ok(json!(format!("hi {}", name)))
            }
            "ping" => Ok(json!("pong")),
            other => Err(RpcError::UnsupportedMethod(other.to_string())),
        }
    }

    fn memory(&self) -> Value {
        json!({"greeted": self.greeted})
    }
}

fn echo_factory(_args: Value) -> Result<Box<dyn RpcService>, RpcError> {
    Ok(Box::new(Echo { greeted: 0 }))
}

const ECHO_SPEC: ClassSpec = ClassSpec {
    name: "Echo",
    methods: &[
        MethodSpec {
            name: "greet",
            kind: MethodKind::Async,
        },
        MethodSpec {
            name: "ping",
            kind: MethodKind::Sync,
        },
    ],
    factory: echo_factory,
};

static REGISTER: Once = Once::new();

fn ensure_registered() {
    REGISTER.call_once(|| {
        register_class(ECHO_SPEC).expect("register Echo");
    });
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::Fixed {
        max_retries,
        delay: 0.01,
    }
}

async fn start_server() -> RpcServer {
    RpcServer::start(ServerConfig::default()).await.unwrap()
}

async fn remote_echo(server: &RpcServer) -> skein_rpc::RemoteHandle {
    ensure_registered();
    to_remote(
        "Echo",
        Value::Null,
        ToRemoteOptions {
            port: Some(server.port()),
            retry: fast_retry(2),
            ..ToRemoteOptions::default()
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn async_greet_returns_through_async_result() {
    let server = start_server().await;
    let handle = remote_echo(&server).await;

    let mut result = handle.call_async("greet", json!({"name": "x"})).unwrap();
    assert_eq!(result.result().await.unwrap(), json!("hi x"));
    assert!(result.task_id().is_some());
}

#[tokio::test]
async fn async_result_is_idempotent_after_first_fetch() {
    let server = start_server().await;
    let handle = remote_echo(&server).await;

    let mut result = handle.call_async("greet", json!({"name": "twice"})).unwrap();
    let first = result.result().await.unwrap();
    // Killing the server proves the second read never goes back on the wire.
    server.stop();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let second = result.result().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, json!("hi twice"));
}

#[tokio::test]
async fn sync_call_blocks_for_the_value() {
    let server = start_server().await;
    let handle = remote_echo(&server).await;
    assert_eq!(handle.call("ping", Value::Null).await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn unknown_method_is_rejected_locally() {
    let server = start_server().await;
    let handle = remote_echo(&server).await;
    let err = handle.call("does_not_exist", Value::Null).await.unwrap_err();
    assert!(matches!(err, RpcError::UnsupportedMethod(_)));
    assert!(handle.call_async("also_missing", Value::Null).is_err());
}

#[tokio::test]
async fn killed_server_exhausts_retries_into_timeout_exceeded() {
    let server = start_server().await;
    let handle = remote_echo(&server).await;

    let mut result = handle.call_async("greet", json!({"name": "x"})).unwrap();
    // Let the call_method roundtrip assign a task id before the server dies.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    server.stop();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let err = result.result().await.unwrap_err();
    match err {
        RpcError::TimeoutExceeded(message) => {
            assert!(message.contains("not alive"), "got: {}", message);
        }
        other => panic!("expected TimeoutExceeded, got {:?}", other.to_string()),
    }
}

#[tokio::test]
async fn creation_against_a_dead_server_is_server_not_alive() {
    ensure_registered();
    let server = start_server().await;
    let port = server.port();
    server.stop();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let err = to_remote(
        "Echo",
        Value::Null,
        ToRemoteOptions {
            port: Some(port),
            retry: fast_retry(0),
            ..ToRemoteOptions::default()
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::ServerNotAlive { .. }));
}

#[tokio::test]
async fn to_remote_without_port_starts_a_local_server() {
    ensure_registered();
    let handle = to_remote(
        "Echo",
        Value::Null,
        ToRemoteOptions {
            retry: fast_retry(2),
            ..ToRemoteOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(handle.host, "127.0.0.1");
    assert_eq!(handle.call("ping", Value::Null).await.unwrap(), json!("pong"));

    // A second conversion reuses the same local server.
    let second = to_remote(
        "Echo",
        Value::Null,
        ToRemoteOptions {
            retry: fast_retry(2),
            ..ToRemoteOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(second.port, handle.port);
    assert_ne!(second.oid, handle.oid);
}

#[tokio::test]
async fn object_lifecycle_list_info_memory_delete() {
    let server = start_server().await;
    let handle = remote_echo(&server).await;
    let client = RpcClient::new("127.0.0.1", server.port());

    let objects = client.list_objects().await.unwrap();
    assert!(objects.iter().any(|o| o.oid == handle.oid));
    assert_eq!(objects[0].class_name, "Echo");

    let info = client.server_info().await.unwrap();
    assert!(info.object_count >= 1);
    assert!(!info.id.is_empty());

    handle.call("greet", json!({"name": "a"})).await.unwrap();
    let memory = client.get_object_memory(&handle.oid).await.unwrap();
    assert_eq!(memory["greeted"], 1);

    handle.delete().await.unwrap();
    let err = handle.call("ping", Value::Null).await.unwrap_err();
    assert!(matches!(err, RpcError::CallFailed { .. }));
}

#[tokio::test]
async fn binding_an_existing_oid_shares_state() {
    let server = start_server().await;
    let first = remote_echo(&server).await;
    first.call("greet", json!({"name": "a"})).await.unwrap();

    ensure_registered();
    let second = to_remote(
        "Echo",
        Value::Null,
        ToRemoteOptions {
            port: Some(server.port()),
            existing_oid: Some(first.oid.clone()),
            retry: fast_retry(2),
            ..ToRemoteOptions::default()
        },
    )
    .await
    .unwrap();
    second.call("greet", json!({"name": "b"})).await.unwrap();

    let client = RpcClient::new("127.0.0.1", server.port());
    let memory = client.get_object_memory(&first.oid).await.unwrap();
    assert_eq!(memory["greeted"], 2);
}

#[tokio::test]
async fn delete_all_clears_every_object() {
    let server = start_server().await;
    let _a = remote_echo(&server).await;
    let _b = remote_echo(&server).await;
    let client = RpcClient::new("127.0.0.1", server.port());
    assert_eq!(client.list_objects().await.unwrap().len(), 2);

    client.delete_all().await.unwrap();
    assert!(client.list_objects().await.unwrap().is_empty());
}

#[tokio::test]
async fn download_file_streams_chunked_content() {
    let server = start_server().await;
    let client = RpcClient::new("127.0.0.1", server.port());

    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let remote_path = src_dir.path().join("payload.bin");
    // Larger than one chunk so the stream spans several binary frames.
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&remote_path, &content).unwrap();

    let local = client
        .download_file(&remote_path.to_string_lossy(), dst_dir.path())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&local).unwrap(), content);
    assert!(local
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with("payload.bin"));
}

#[tokio::test]
async fn download_missing_file_is_call_failed() {
    let server = start_server().await;
    let client = RpcClient::new("127.0.0.1", server.port());
    let dst_dir = tempfile::tempdir().unwrap();
    let err = client
        .download_file("/definitely/not/here.bin", dst_dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::CallFailed { .. }));
}

#[tokio::test]
async fn stop_rpc_shuts_the_server_down() {
    let server = start_server().await;
    let client = RpcClient::new("127.0.0.1", server.port());
    assert!(client.is_alive().await);
    client.stop().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!client.is_alive().await);
}
