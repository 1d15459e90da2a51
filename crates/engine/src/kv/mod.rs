//! State KV: namespaced key-value storage with TTL.
//!
//! Namespacing is implemented by prefixing the flat key the
//! [`crate::store::Store`] trait already exposes (`kv_get`/`kv_set`/...):
//! `global`, `workflow:<id>`, `run:<id>` become literal key prefixes, so any
//! `Store` backend gets namespacing for free without widening its trait.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::model::RunId;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum KvError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A namespace the KV is partitioned into: global, per-workflow, or
/// per-run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    Global,
    Workflow(String),
    Run(RunId),
}

impl Namespace {
    fn prefix(&self) -> String {
        match self {
            Namespace::Global => "global".to_string(),
            Namespace::Workflow(id) => format!("workflow:{id}"),
            Namespace::Run(id) => format!("run:{id}"),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}::{key}", self.prefix())
    }
}

/// Namespaced key-value surface, backed by a [`Store`]. `incr` is
/// linearizable per key because the underlying `Store::kv_incr` is
/// defined to be.
#[derive(Clone)]
pub struct StateKv {
    store: Arc<dyn Store>,
}

impl StateKv {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, default))]
    pub async fn get(&self, ns: &Namespace, key: &str, default: Option<Value>) -> Result<Value, KvError> {
        let stored = self.store.kv_get(&ns.full_key(key)).await?;
        Ok(stored.or(default).unwrap_or(Value::Null))
    }

    #[instrument(skip(self, value))]
    pub async fn set(&self, ns: &Namespace, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        self.store.kv_set(&ns.full_key(key), value, ttl).await?;
        Ok(())
    }

    pub async fn incr(&self, ns: &Namespace, key: &str, delta: i64) -> Result<i64, KvError> {
        Ok(self.store.kv_incr(&ns.full_key(key), delta).await?)
    }

    pub async fn delete(&self, ns: &Namespace, key: &str) -> Result<(), KvError> {
        self.store.kv_delete(&ns.full_key(key)).await?;
        Ok(())
    }

    /// Purge expired entries across every namespace. Called lazily on
    /// access inside the `Store` implementations and periodically here by
    /// whichever background task the `Engine` spawns for it.
    pub async fn cleanup_expired(&self) -> Result<u64, KvError> {
        Ok(self.store.kv_cleanup_expired(chrono::Utc::now()).await?)
    }

    /// A handle pre-bound to `run:<run_id>`, handed to step handlers via
    /// [`crate::context::Context::state`].
    pub fn scoped_to_run(&self, run_id: RunId) -> RunScopedKv {
        RunScopedKv {
            kv: self.clone(),
            ns: Namespace::Run(run_id),
        }
    }

    pub fn scoped_to_workflow(&self, workflow_id: impl Into<String>) -> WorkflowScopedKv {
        WorkflowScopedKv {
            kv: self.clone(),
            ns: Namespace::Workflow(workflow_id.into()),
        }
    }
}

/// Thin, pre-namespaced view over [`StateKv`], scoped to one run. Cheap to
/// clone; handed out freely to step contexts.
#[derive(Clone)]
pub struct RunScopedKv {
    kv: StateKv,
    ns: Namespace,
}

impl RunScopedKv {
    pub async fn get(&self, key: &str, default: Option<Value>) -> Result<Value, KvError> {
        self.kv.get(&self.ns, key, default).await
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        self.kv.set(&self.ns, key, value, ttl).await
    }

    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        self.kv.incr(&self.ns, key, delta).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.kv.delete(&self.ns, key).await
    }
}

#[derive(Clone)]
pub struct WorkflowScopedKv {
    kv: StateKv,
    ns: Namespace,
}

impl WorkflowScopedKv {
    pub async fn get(&self, key: &str, default: Option<Value>) -> Result<Value, KvError> {
        self.kv.get(&self.ns, key, default).await
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        self.kv.set(&self.ns, key, value, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let kv = StateKv::new(Arc::new(MemoryStore::new()));
        kv.set(&Namespace::Global, "k", json!(1), None).await.unwrap();
        kv.set(&Namespace::Workflow("wf".into()), "k", json!(2), None)
            .await
            .unwrap();
        assert_eq!(kv.get(&Namespace::Global, "k", None).await.unwrap(), json!(1));
        assert_eq!(
            kv.get(&Namespace::Workflow("wf".into()), "k", None).await.unwrap(),
            json!(2)
        );
    }

    #[tokio::test]
    async fn get_falls_back_to_default_when_missing() {
        let kv = StateKv::new(Arc::new(MemoryStore::new()));
        let got = kv.get(&Namespace::Global, "missing", Some(json!("fallback"))).await.unwrap();
        assert_eq!(got, json!("fallback"));
    }

    #[tokio::test]
    async fn run_scoped_handle_stays_within_its_run() {
        let kv = StateKv::new(Arc::new(MemoryStore::new()));
        let run_a = uuid::Uuid::now_v7();
        let run_b = uuid::Uuid::now_v7();
        let a = kv.scoped_to_run(run_a);
        let b = kv.scoped_to_run(run_b);
        a.set("count", json!(5), None).await.unwrap();
        assert_eq!(b.get("count", Some(json!(0))).await.unwrap(), json!(0));
        assert_eq!(a.get("count", None).await.unwrap(), json!(5));
    }
}
