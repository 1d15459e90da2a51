//! # Workflow Orchestration Engine
//!
//! An embeddable, durable workflow orchestration engine: a run/job state
//! machine, a control-flow interpreter (if/elseIf/else, parallel, race,
//! while, forEach, batch, pause/human-in-the-loop), and a
//! retry/circuit-breaker/timeout execution envelope wrapped around every
//! step.
//!
//! ## Features
//!
//! - **Durable runs**: every run's status transitions and step records are
//!   persisted through the [`store::Store`] trait (in-memory or SQLite).
//! - **Automatic retries**: configurable retry policies with exponential
//!   backoff and jitter (`reliability::RetryPolicy`).
//! - **Circuit breakers**: protect handler invocations from cascading
//!   failures (`reliability::CircuitBreaker`).
//! - **Control-flow interpreter**: branching, fan-out, loops, pauses and
//!   event waits over a flat, resumable step program.
//! - **Scheduling**: cron/interval-triggered runs via `croner`.
//! - **Webhook ingest**: an optional `axum::Router` surface for
//!   HTTP-triggered runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Trigger Ingest                          │
//! │   (manual / webhook / schedule / event -> normalized Trigger) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Run Coordinator                        │
//! │     (admission control, run lifecycle, lifecycle hooks)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Control-Flow Interpreter                    │
//! │   (branch stack, parallel/race fan-out, loops, pause/HITL)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Job Dispatcher                          │
//! │  (priority queue, dependency gating, bounded worker pool)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Execution Envelope                       │
//! │   (circuit breaker -> retry/backoff -> per-attempt timeout)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every handler invocation the interpreter asks for — a blocking action,
//! one branch of a `Parallel`/`Race`, a background action — is submitted to
//! the Job Dispatcher by the Run Coordinator and awaited there; the
//! dispatcher's worker pool is what actually drives the Execution
//! Envelope around the handler call.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use workflow_engine::prelude::*;
//!
//! # async fn run() -> Result<(), EngineError> {
//! let store = Arc::new(MemoryStore::new());
//! let engine = Engine::new(store);
//! engine.register_handler("charge_card", |ctx: Context| async move { Ok(ctx.payload) });
//!
//! engine
//!     .define(
//!         Workflow::new("checkout", "Checkout")
//!             .with_steps(vec![Step::action("charge", "charge_card")])
//!             .with_trigger(TriggerSpec::Manual),
//!     )
//!     .await?;
//!
//! engine.start(StartOptions::default()).await?;
//! let run_id = engine.trigger("checkout", serde_json::json!({"amount": 100})).await?;
//! let _ = engine.inspect(run_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod duration;
pub mod engine;
pub mod events;
pub mod handler;
pub mod interpreter;
pub mod kv;
pub mod model;
pub mod pause;
pub mod reliability;
pub mod scheduler;
pub mod store;
pub mod trigger;
pub mod worker;

/// Common imports for embedding applications.
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::engine::{Engine, EngineError, StartOptions};
    pub use crate::handler::{Handler, HandlerError, HandlerRegistry};
    pub use crate::model::{
        CacheOptions, Job, JobId, JobPriority, JobState, PauseInfo, PauseStatus, RetryOn,
        RetryOptions, Run, RunId, RunStatus, ScheduleEntry, Step, StepKind, StepOptions,
        StepRecord, TriggerSpec, Workflow, WorkflowError,
    };
    pub use crate::reliability::{
        BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, Envelope, RetryPolicy,
    };
    pub use crate::store::{MemoryStore, SqliteStore, Store, StoreError};
    pub use crate::trigger::{Trigger, TriggerIngest, WebhookRoute};
}

// Re-export the top-level facade at the crate root.
pub use engine::{Engine, EngineError, StartOptions};
