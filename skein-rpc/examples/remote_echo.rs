//! Host an object on a local RPC server and call it through a remote handle.
//!
//! ```bash
//! cargo run -p skein-rpc --example remote_echo
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};

use skein_rpc::{
    register_class, to_remote, ClassSpec, MethodKind, MethodSpec, RpcError, RpcService,
    ToRemoteOptions,
};

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
            other => Err(RpcError::UnsupportedMethod(other.to_string())),
        }
    }

    fn memory(&self) -> Value {
        json!({"greeted": self.greeted})
    }
}

#[tokio::main]
async fn main() -> Result<(), RpcError> {
    register_class(ClassSpec {
        name: "Echo",
        methods: &[MethodSpec {
            name: "greet",
            kind: MethodKind::Async,
        }],
        factory: |_args| Ok(Box::new(Echo { greeted: 0 })),
    })?;

    // No port given: a local server is started (or reused) for this process.
    let handle = to_remote("Echo", Value::Null, ToRemoteOptions::default()).await?;
    println!("hosting {} as {} on port {}", handle.class_name, handle.oid, handle.port);

    let mut result = handle.call_async("greet", json!({"name": "skein"}))?;
    println!("greet -> {}", result.result().await?);
    // The value is cached; this read never touches the server.
    println!("again -> {}", result.result().await?);
    Ok(())
}
