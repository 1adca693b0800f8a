//! Process-wide registry of RPC-exposable classes.
//!
//! A class is described as method-set metadata at registration time: each method is
//! declared async (returns a task id, result fetched via `update_placeholder`) or
//! sync (blocks until the result is on the wire). Proxies are generated from this
//! metadata; no attribute interception. Registering the same name twice is an error.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;
use std::sync::RwLock;

use crate::error::RpcError;
use crate::protocol::MethodEntry;

/// Whether a method call returns a task id immediately or blocks for the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    Sync,
    Async,
}

/// One method declaration in a [`ClassSpec`].
#[derive(Clone, Copy, Debug)]
pub struct MethodSpec {
    pub name: &'static str,
    pub kind: MethodKind,
}

/// A live object instance hosted by the server. `dispatch` receives the method name
/// and an opaque JSON argument blob; calls to one instance are serialized by the
/// server, so `&mut self` state is safe.
#[async_trait]
pub trait RpcService: Send {
    async fn dispatch(&mut self, method: &str, args: JsonValue) -> Result<JsonValue, RpcError>;

    /// Snapshot of the object's memory for `get_object_memory`.
    fn memory(&self) -> JsonValue {
        JsonValue::Null
    }
}

/// Registration record: class name, method metadata, and a factory building an
/// instance from an init-args blob.
#[derive(Clone, Copy)]
pub struct ClassSpec {
    pub name: &'static str,
    pub methods: &'static [MethodSpec],
    pub factory: fn(JsonValue) -> Result<Box<dyn RpcService>, RpcError>,
}

fn read_registry() -> std::sync::RwLockReadGuard<'static, HashMap<&'static str, ClassSpec>> {
    match REGISTRY.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

static REGISTRY: Lazy<RwLock<HashMap<&'static str, ClassSpec>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a class for hosting and proxying. Duplicate names are an error.
pub fn register_class(spec: ClassSpec) -> Result<(), RpcError> {
    let mut registry = match REGISTRY.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if registry.contains_key(spec.name) {
        return Err(RpcError::DuplicateClass(spec.name.to_string()));
    }
    registry.insert(spec.name, spec);
    Ok(())
}

/// Looks up a registered class by name.
pub fn lookup_class(name: &str) -> Option<ClassSpec> {
    read_registry().get(name).copied()
}

/// Method metadata for a registered class, in wire form.
pub fn method_entries(class_name: &str) -> Option<Vec<MethodEntry>> {
    lookup_class(class_name).map(|spec| {
        spec.methods
            .iter()
            .map(|m| MethodEntry {
                name: m.name.to_string(),
                kind: m.kind,
            })
            .collect()
    })
}

static MODEL_CONFIGS: Lazy<RwLock<JsonValue>> = Lazy::new(|| RwLock::new(JsonValue::Null));

/// Stores server-wide model configuration (from the `set_model_configs` RPC) for
/// factories and hosted objects to read.
pub fn set_model_configs(configs: JsonValue) {
    let mut guard = match MODEL_CONFIGS.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = configs;
}

/// The last model configuration set on this process, `Null` if none.
pub fn model_configs() -> JsonValue {
    match MODEL_CONFIGS.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl RpcService for Noop {
        async fn dispatch(&mut self, method: &str, _args: JsonValue) -> Result<JsonValue, RpcError> {
            Err(RpcError::UnsupportedMethod(method.to_string()))
        }
    }

    fn noop_factory(_args: JsonValue) -> Result<Box<dyn RpcService>, RpcError> {
        Ok(Box::new(Noop))
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        const SPEC: ClassSpec = ClassSpec {
            name: "registry-test-noop",
            methods: &[MethodSpec {
                name: "ping",
                kind: MethodKind::Sync,
            }],
            factory: noop_factory,
        };
        register_class(SPEC).unwrap();
        assert!(matches!(
            register_class(SPEC),
            Err(RpcError::DuplicateClass(_))
        ));
        let entries = method_entries("registry-test-noop").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, MethodKind::Sync);
    }

    #[test]
    fn unknown_class_lookup_is_none() {
        assert!(lookup_class("registry-test-missing").is_none());
        assert!(method_entries("registry-test-missing").is_none());
    }

    #[test]
    fn model_configs_round_trip() {
        set_model_configs(serde_json::json!({"model": "gpt-4o-mini"}));
        assert_eq!(model_configs()["model"], "gpt-4o-mini");
    }
}
