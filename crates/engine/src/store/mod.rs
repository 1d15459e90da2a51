//! The `Store` trait: durable persistence for runs, step records, pauses,
//! schedules, and the key-value namespace.
//!
//! One trait, `Send + Sync + 'static`, `async_trait` methods, optimistic
//! concurrency on event append, a single `thiserror` error enum for every
//! backend to return.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{PauseInfo, Run, RunId, ScheduleEntry, StepRecord, Workflow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not registered: {0}")]
    WorkflowNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("pause token not found: {0}")]
    PauseNotFound(String),

    #[error("concurrency conflict on run {run_id}: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict {
        run_id: RunId,
        expected: i64,
        actual: i64,
    },

    #[error("run {run_id} cannot transition from {from:?} to {to:?}")]
    IllegalTransition {
        run_id: RunId,
        from: crate::model::RunStatus,
        to: crate::model::RunStatus,
    },

    #[error("workflow '{0}' is already registered with a different definition")]
    WorkflowConflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A single appended fact in a run's history, used by the Coordinator to
/// reconstruct `steps_output`/`last_step_name` without re-deriving them
/// from `StepRecord`s alone.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub sequence: i64,
    pub recorded_at: DateTime<Utc>,
    pub payload: RunEventPayload,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RunEventPayload {
    StepStarted { step_name: String },
    StepCompleted { step_name: String, output: serde_json::Value },
    StepFailed { step_name: String, error: String },
    RunPaused { token: String },
    RunResumed { token: String },
    RunCompleted,
    RunFailed { error: String },
    RunCancelled,
}

/// Durable persistence surface for the engine. Implementations must be
/// thread-safe and support concurrent access from the Dispatcher,
/// Coordinator, Scheduler and Pause Registry simultaneously.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ---------------------------------------------------------------
    // Workflow registration
    // ---------------------------------------------------------------

    async fn register_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    // ---------------------------------------------------------------
    // Run lifecycle
    // ---------------------------------------------------------------

    async fn create_run(&self, run: Run) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError>;

    /// Replace the stored run, subject to the monotonicity invariant
    /// (`RunStatus::can_transition_to`) — callers are expected to have
    /// already validated the transition; this only persists it.
    async fn update_run(&self, run: Run) -> Result<(), StoreError>;

    async fn append_run_event(
        &self,
        run_id: RunId,
        payload: RunEventPayload,
    ) -> Result<i64, StoreError>;

    async fn load_run_events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError>;

    async fn append_step_record(&self, record: StepRecord) -> Result<(), StoreError>;

    async fn list_step_records(&self, run_id: RunId) -> Result<Vec<StepRecord>, StoreError>;

    // ---------------------------------------------------------------
    // Pause / human-in-the-loop
    // ---------------------------------------------------------------

    async fn store_pause(&self, pause: PauseInfo) -> Result<(), StoreError>;

    async fn load_pause(&self, token: &str) -> Result<PauseInfo, StoreError>;

    async fn delete_pause(&self, token: &str) -> Result<(), StoreError>;

    async fn list_pauses(&self) -> Result<Vec<PauseInfo>, StoreError>;

    // ---------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------

    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<(), StoreError>;

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError>;

    async fn advance_schedule(
        &self,
        workflow_id: &str,
        fired_at: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ---------------------------------------------------------------
    // State KV namespace
    // ---------------------------------------------------------------

    async fn kv_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn kv_set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), StoreError>;

    async fn kv_incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    async fn kv_delete(&self, key: &str) -> Result<(), StoreError>;

    async fn kv_cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
