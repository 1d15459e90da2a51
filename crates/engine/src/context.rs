//! `Context`: the per-step snapshot handed to a handler.
//!
//! Carries an input payload, a cancellation handle, and a way to observe
//! prior step outputs (`steps`/`last`) — one step invocation's view into
//! the run it belongs to, not just the invocation's own input.

use std::collections::HashMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::kv::RunScopedKv;
use crate::model::RunId;

/// Read-only snapshot of a run handed to a step/action handler.
///
/// Mutations to `ctx.state` are routed through the State KV rather than
/// through this struct directly — `state` is itself a thin,
/// already-namespaced handle, not a local map.
#[derive(Clone)]
pub struct Context {
    pub run_id: RunId,
    pub workflow_id: String,
    pub step_name: String,
    /// The run's original trigger payload.
    pub payload: Value,
    /// `ctx.steps[name]` — every prior step's recorded output, by step name.
    pub steps: HashMap<String, Value>,
    /// `ctx.last` — the immediately preceding step's output, if any.
    pub last: Option<Value>,
    /// Opaque service names threaded through from the workflow registration.
    /// This crate never interprets the values; service *objects* are
    /// supplied and owned by the embedding application.
    pub services: Vec<String>,
    /// Normalized trigger headers (webhook requests only; empty otherwise).
    pub trigger_headers: HashMap<String, String>,
    /// Namespaced key-value handle scoped to `run:<run_id>`.
    pub state: RunScopedKv,
    /// Cooperative cancellation signal, observed at every suspension point.
    pub cancel: CancellationToken,
    /// Set only when the envelope is invoking the `on_error` fallback
    /// handler after retries are exhausted.
    pub error: Option<String>,
}

impl Context {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Build the fallback-invocation variant of this context: identical,
    /// but carrying the error that exhausted retries.
    pub fn with_error(&self, error: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.error = Some(error.into());
        ctx
    }

    /// Build the per-iteration context for a `ForEach`/`Batch` body: a
    /// clone with `item` bound as both `ctx.last` and `ctx.steps["item"]`
    /// so the body's handlers can read it either way.
    pub fn with_item(&self, item: Value) -> Self {
        let mut ctx = self.clone();
        ctx.steps.insert("item".to_string(), item.clone());
        ctx.last = Some(item);
        ctx
    }

    /// Build the variant of this context carrying a successful background
    /// action's output as `ctx.last`, handed to that action's step hook.
    pub fn with_last(&self, output: Value) -> Self {
        let mut ctx = self.clone();
        ctx.last = Some(output);
        ctx
    }
}
