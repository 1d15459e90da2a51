//! Handler registry: the opaque, name-keyed callable table step/action
//! bodies resolve against.
//!
//! Combines a type-erased trait-object wrapper (so handlers of differing
//! closure types share one table) with a name-keyed closure table. The
//! `Store` persists only the handler *name* on a `Step`; this registry is
//! rebuilt in-memory at process start-up from whatever the embedding
//! application registers, rather than persisting closures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::context::Context;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for '{0}'")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::NotFound(name) => write!(f, "no handler registered for '{name}'"),
            HandlerError::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An opaque, callable step/action body: `fn(context) -> result-or-error`.
/// User handler code itself lives outside this crate; this is only the
/// invocation seam.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<Value, HandlerError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<Value, HandlerError>> {
        Box::pin(self(ctx))
    }
}

/// In-memory `name -> Arc<dyn Handler>` table. Cheaply cloneable.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: impl Handler) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).map(|h| h.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub async fn invoke(&self, name: &str, ctx: Context) -> Result<Value, HandlerError> {
        let handler = self.get(name).ok_or_else(|| HandlerError::NotFound(name.to_string()))?;
        handler.call(ctx).await
    }
}
