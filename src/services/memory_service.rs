//! Namespaced key/value memory store.
//!
//! Used by the memory provider and exposed read-only to sandbox
//! expressions. Writes are visible to the writer immediately; persistence
//! to the optional backing file is best-effort and never blocks
//! correctness.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::config::MemoryConfig;

pub const DEFAULT_NAMESPACE: &str = "default";

static GLOBAL_STORE: OnceLock<Arc<MemoryStore>> = OnceLock::new();

type Namespaces = BTreeMap<String, BTreeMap<String, Value>>;

/// Shared memory store. Cheap to clone via `Arc`.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Namespaces>,
    default_namespace: String,
    persist_file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(config: &MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(BTreeMap::new()),
            default_namespace: config
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            persist_file: config.persist_file.clone().map(PathBuf::from),
        })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::new(&MemoryConfig::default())
    }

    /// Initialize the process-wide singleton. The first caller wins; later
    /// calls return the existing instance.
    pub fn initialize(config: &MemoryConfig) -> Arc<Self> {
        GLOBAL_STORE.get_or_init(|| Self::new(config)).clone()
    }

    /// The process-wide singleton, if initialized.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_STORE.get().cloned()
    }

    fn namespace_or_default(&self, namespace: Option<&str>) -> String {
        namespace.unwrap_or(&self.default_namespace).to_string()
    }

    pub async fn get(&self, namespace: Option<&str>, key: &str) -> Option<Value> {
        let ns = self.namespace_or_default(namespace);
        self.inner.read().await.get(&ns).and_then(|m| m.get(key)).cloned()
    }

    pub async fn has(&self, namespace: Option<&str>, key: &str) -> bool {
        self.get(namespace, key).await.is_some()
    }

    pub async fn set(&self, namespace: Option<&str>, key: &str, value: Value) {
        let ns = self.namespace_or_default(namespace);
        {
            let mut inner = self.inner.write().await;
            inner.entry(ns).or_default().insert(key.to_string(), value);
        }
        self.persist().await;
    }

    /// Append to an ordered sequence, coercing a missing key to an empty
    /// array. A non-array existing value becomes the first element.
    pub async fn append(&self, namespace: Option<&str>, key: &str, value: Value) -> Value {
        let ns = self.namespace_or_default(namespace);
        let result = {
            let mut inner = self.inner.write().await;
            let slot = inner
                .entry(ns)
                .or_default()
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(vec![slot.take()]);
            }
            if let Value::Array(items) = slot {
                items.push(value);
            }
            slot.clone()
        };
        self.persist().await;
        result
    }

    /// Numeric increment. Fails unless both the stored value (default 0 for
    /// a missing key) and the amount are numeric.
    pub async fn increment(
        &self,
        namespace: Option<&str>,
        key: &str,
        amount: &Value,
    ) -> EngineResult<Value> {
        let delta = amount.as_f64().ok_or_else(|| {
            EngineError::Internal(format!("increment amount is not numeric: {amount}"))
        })?;
        let ns = self.namespace_or_default(namespace);
        let result = {
            let mut inner = self.inner.write().await;
            let slot = inner
                .entry(ns)
                .or_default()
                .entry(key.to_string())
                .or_insert_with(|| Value::from(0));
            let current = slot.as_f64().ok_or_else(|| {
                EngineError::Internal(format!("memory key '{key}' is not numeric: {slot}"))
            })?;
            let next = current + delta;
            // Keep integers integral so `get` round-trips primitives.
            *slot = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
                Value::from(next as i64)
            } else {
                Value::from(next)
            };
            slot.clone()
        };
        self.persist().await;
        Ok(result)
    }

    pub async fn delete(&self, namespace: Option<&str>, key: &str) -> bool {
        let ns = self.namespace_or_default(namespace);
        let removed = {
            let mut inner = self.inner.write().await;
            inner.get_mut(&ns).and_then(|m| m.remove(key)).is_some()
        };
        self.persist().await;
        removed
    }

    pub async fn clear(&self, namespace: Option<&str>) {
        let ns = self.namespace_or_default(namespace);
        {
            let mut inner = self.inner.write().await;
            inner.remove(&ns);
        }
        self.persist().await;
    }

    pub async fn list(&self, namespace: Option<&str>) -> Vec<String> {
        let ns = self.namespace_or_default(namespace);
        self.inner
            .read()
            .await
            .get(&ns)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Read-only snapshot of a namespace for sandbox contexts.
    pub async fn snapshot(&self, namespace: Option<&str>) -> Value {
        let ns = self.namespace_or_default(namespace);
        let inner = self.inner.read().await;
        let map: Map<String, Value> = inner
            .get(&ns)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Value::Object(map)
    }

    async fn persist(&self) {
        let Some(path) = &self.persist_file else { return };
        let payload = {
            let inner = self.inner.read().await;
            match serde_json::to_vec_pretty(&*inner) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, "memory store serialization failed");
                    return;
                }
            }
        };
        if let Err(err) = tokio::fs::write(path, payload).await {
            warn!(path = %path.display(), error = %err, "memory store persist failed");
        }
    }

    /// Load persisted contents, replacing the current state.
    pub async fn load(&self) -> EngineResult<()> {
        let Some(path) = &self.persist_file else { return Ok(()) };
        if !path.exists() {
            return Ok(());
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::Internal(format!("memory load: {e}")))?;
        let namespaces: Namespaces = serde_json::from_slice(&bytes)?;
        *self.inner.write().await = namespaces;
        Ok(())
    }
}
