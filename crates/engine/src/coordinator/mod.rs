//! Run Coordinator: orchestrates a single run from trigger to termination,
//! and is the [`StepExecutor`] the Interpreter calls into for every
//! handler invocation.
//!
//! Follows an append-then-replay persistence shape with a per-workflow
//! `ConcurrencyManager`, scoped to "per workflow *id*" rather than "per
//! workflow *type*" since this engine has one interpreter serving every
//! workflow rather than one compiled struct per type.

mod concurrency;

pub use concurrency::ConcurrencyManager;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::context::Context;
use crate::dispatcher::{DispatcherConfig, JobDispatcher, JobRunner};
use crate::events::EventBus;
use crate::handler::HandlerRegistry;
use crate::interpreter::{Interpreter, InterpreterError, StepExecutor};
use crate::kv::StateKv;
use crate::model::{Job, JobId, Run, RunId, RunStatus, StepOptions, StepRecord, StepRecordStatus, Workflow, WorkflowError};
use crate::pause::PauseRegistry;
use crate::reliability::{CircuitBreakerRegistry, Envelope, ExecutionResult};
use crate::store::{RunEventPayload, Store, StoreError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("workflow not registered: {0}")]
    WorkflowNotFound(String),
    #[error(transparent)]
    Configuration(#[from] WorkflowError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The trigger payload that starts a run, plus the originating headers
/// (populated for webhook triggers, empty otherwise).
pub struct RunRequest {
    pub workflow_id: String,
    pub payload: Value,
    pub headers: std::collections::HashMap<String, String>,
}

/// The context/handler/options a submitted [`Job`] stands in for. A `Job`
/// is the dispatcher's serializable queue entry; it cannot carry a live
/// `Context` (its cancellation token, state handle, etc. aren't
/// serializable), so the Coordinator keeps the real invocation here, keyed
/// by the job's id, and the [`CoordinatorJobRunner`] looks it up when a
/// worker actually claims the job.
struct PendingInvocation {
    ctx: Context,
    handler: String,
    options: StepOptions,
}

/// The [`JobRunner`] the Coordinator's dispatcher is started with. Kept
/// separate from `RunCoordinator` itself (rather than implemented on it
/// directly) so it can be constructed before `RunCoordinator::new` has an
/// `Arc<Self>` to hand out — it only needs the cheaply-cloneable pieces of
/// the Coordinator that actually run a handler.
struct CoordinatorJobRunner {
    handlers: HandlerRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
    pending: Arc<DashMap<JobId, PendingInvocation>>,
}

impl JobRunner for CoordinatorJobRunner {
    fn run(&self, job: Job) -> Pin<Box<dyn Future<Output = ExecutionResult<Value>> + Send>> {
        let handlers = self.handlers.clone();
        let breakers = self.breakers.clone();
        let pending = self.pending.clone();
        Box::pin(async move {
            let Some((_, invocation)) = pending.remove(&job.id) else {
                return ExecutionResult::err(format!("no pending invocation registered for job {}", job.id));
            };

            let mut envelope = Envelope::new();
            if let Some(retry) = &invocation.options.retry {
                envelope = envelope.with_retry(retry.clone());
            }
            if let Some(timeout) = invocation.options.timeout {
                envelope = envelope.with_timeout(timeout);
            }
            if let Some(breaker_config) = &invocation.options.circuit_breaker {
                envelope = envelope.with_circuit_breaker(breakers.get_or_create(breaker_config.clone()));
            }

            let handler_name = invocation.handler.clone();
            envelope
                .execute(|| {
                    let handlers = handlers.clone();
                    let ctx = invocation.ctx.clone();
                    let name = handler_name.clone();
                    async move { handlers.invoke(&name, ctx).await.map_err(|e| e.to_string()) }
                })
                .await
        })
    }
}

/// Orchestrates runs across every registered workflow: admission control
/// (per-workflow concurrency), run creation, driving the interpreter, and
/// firing lifecycle hooks. Also implements [`StepExecutor`]: every handler
/// invocation the interpreter asks for is submitted to the Job Dispatcher
/// as a `Job` and awaited, rather than called directly, so dispatch
/// priority, dependency gating and backpressure apply uniformly to
/// blocking actions as well as `Parallel`/`Race` fan-out.
pub struct RunCoordinator {
    store: Arc<dyn Store>,
    handlers: HandlerRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
    event_bus: Arc<EventBus>,
    pause_registry: Arc<PauseRegistry>,
    state_kv: StateKv,
    concurrency: Arc<dashmap::DashMap<String, Arc<ConcurrencyManager>>>,
    dispatcher: Arc<JobDispatcher>,
    pending: Arc<DashMap<JobId, PendingInvocation>>,
    /// Per-run cancellation handle, installed while a run is in flight so
    /// `cancel_run` can reach a live interpreter task's suspension points.
    run_tokens: Arc<DashMap<RunId, CancellationToken>>,
}

impl RunCoordinator {
    pub fn new(store: Arc<dyn Store>, handlers: HandlerRegistry, event_bus: Arc<EventBus>, pause_registry: Arc<PauseRegistry>) -> Self {
        let state_kv = StateKv::new(store.clone());
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let pending = Arc::new(DashMap::new());

        let dispatcher_config = DispatcherConfig::default();
        let worker_count = dispatcher_config.max_concurrency;
        let dispatcher = Arc::new(JobDispatcher::new(dispatcher_config));
        let runner = Arc::new(CoordinatorJobRunner {
            handlers: handlers.clone(),
            breakers: breakers.clone(),
            pending: pending.clone(),
        });
        dispatcher.start(worker_count, runner);

        Self {
            store,
            handlers,
            breakers,
            event_bus,
            pause_registry,
            state_kv,
            concurrency: Arc::new(dashmap::DashMap::new()),
            dispatcher,
            pending,
            run_tokens: Arc::new(DashMap::new()),
        }
    }

    fn concurrency_manager(&self, workflow: &Workflow) -> Arc<ConcurrencyManager> {
        self.concurrency
            .entry(workflow.id.clone())
            .or_insert_with(|| Arc::new(ConcurrencyManager::new(workflow.concurrency)))
            .clone()
    }

    /// Validate the workflow exists, admit under its concurrency cap
    /// (queueing if saturated), create the run, and spawn the interpreter
    /// run in the background. Returns as soon as the run is durably
    /// created, even if the run later fails.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn trigger(self: &Arc<Self>, request: RunRequest) -> Result<RunId, CoordinatorError> {
        let workflow = self
            .store
            .get_workflow(&request.workflow_id)
            .await
            .map_err(|_| CoordinatorError::WorkflowNotFound(request.workflow_id.clone()))?;

        let manager = self.concurrency_manager(&workflow);
        let permit = manager.acquire().await;

        let run = Run::new(workflow.id.clone(), request.payload.clone());
        let run_id = run.id;
        self.store.create_run(run).await?;

        let coordinator = self.clone();
        let headers = request.headers;
        tokio::spawn(async move {
            coordinator.drive(workflow, run_id, headers, permit).await;
        });

        Ok(run_id)
    }

    async fn drive(
        self: Arc<Self>,
        workflow: Workflow,
        run_id: RunId,
        headers: std::collections::HashMap<String, String>,
        permit: concurrency::ConcurrencyPermit,
    ) {
        if let Err(err) = self.mark_running(run_id).await {
            warn!(%run_id, error = %err, "failed to mark run running");
        }

        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(err) => {
                error!(%run_id, error = %err, "run disappeared before execution");
                return;
            }
        };

        let mut ctx = Context {
            run_id,
            workflow_id: workflow.id.clone(),
            step_name: String::new(),
            payload: run.payload.clone(),
            steps: std::collections::HashMap::new(),
            last: None,
            services: workflow.services.clone(),
            trigger_headers: headers,
            state: self.state_kv.scoped_to_run(run_id),
            cancel: CancellationToken::new(),
            error: None,
        };

        self.run_tokens.insert(run_id, ctx.cancel.clone());

        let interpreter = Interpreter::new(self.clone(), self.event_bus.clone(), self.pause_registry.clone());
        let outcome = interpreter.run(&workflow, &mut ctx).await;
        self.run_tokens.remove(&run_id);

        match outcome {
            Ok(()) => {
                self.finish(run_id, &workflow, RunStatus::Completed, None, &ctx).await;
            }
            Err(InterpreterError::Cancelled) => {
                self.finish(run_id, &workflow, RunStatus::Cancelled, None, &ctx).await;
            }
            Err(err) => {
                self.finish(run_id, &workflow, RunStatus::Failed, Some(err.to_string()), &ctx).await;
            }
        }

        drop(permit);
    }

    async fn mark_running(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut run = self.store.get_run(run_id).await?;
        run.status = RunStatus::Running;
        self.store.update_run(run).await
    }

    /// Persist the terminal status plus the accumulated step outputs and
    /// last step name from `ctx`, fire the matching lifecycle hook (errors
    /// from the hook are logged, never promoted to the run's outcome), and
    /// admit the next waitlisted trigger.
    async fn finish(&self, run_id: RunId, workflow: &Workflow, status: RunStatus, error: Option<String>, ctx: &Context) {
        let hook = match status {
            RunStatus::Completed => workflow.on_success.clone(),
            _ => workflow.on_failure.clone(),
        };

        if let Ok(mut run) = self.store.get_run(run_id).await {
            run.status = status;
            run.completed_at = Some(Utc::now());
            run.error = error.clone().map(WorkflowError::new);
            run.steps_output = ctx.steps.clone();
            if !ctx.step_name.is_empty() {
                run.last_step_name = Some(ctx.step_name.clone());
            }
            if let Err(err) = self.store.update_run(run).await {
                warn!(%run_id, error = %err, "failed to persist terminal run status");
            }
        }

        let payload = match status {
            RunStatus::Completed => RunEventPayload::RunCompleted,
            RunStatus::Cancelled => RunEventPayload::RunCancelled,
            _ => RunEventPayload::RunFailed { error: error.clone().unwrap_or_default() },
        };
        if let Err(err) = self.store.append_run_event(run_id, payload).await {
            warn!(%run_id, error = %err, "failed to append terminal run event");
        }

        if let Some(hook) = hook {
            let ctx = Context {
                run_id,
                workflow_id: workflow.id.clone(),
                step_name: String::new(),
                payload: Value::Null,
                steps: std::collections::HashMap::new(),
                last: error.clone().map(Value::String),
                services: workflow.services.clone(),
                trigger_headers: std::collections::HashMap::new(),
                state: self.state_kv.scoped_to_run(run_id),
                cancel: CancellationToken::new(),
                error,
            };
            if let Err(err) = self.handlers.invoke(&hook, ctx).await {
                warn!(%run_id, %hook, error = %err, "lifecycle hook failed");
            }
        }
    }

    pub async fn inspect(&self, run_id: RunId) -> Result<Run, StoreError> {
        self.store.get_run(run_id).await
    }

    /// Flip the run terminal, signal cooperative cancellation into its
    /// live `Context` (if it's still in flight in this process), drop any
    /// of its jobs still queued in the dispatcher, and resolve any pause
    /// it's currently suspended on as cancelled rather than left waiting.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        run.status = RunStatus::Cancelled;
        self.store.update_run(run).await?;

        if let Some(token) = self.run_tokens.get(&run_id) {
            token.cancel();
        }
        self.dispatcher.cancel_run(run_id).await;
        if let Err(err) = self.pause_registry.cancel_run(run_id).await {
            warn!(%run_id, error = %err, "failed to cancel pending pauses for cancelled run");
        }

        Ok(())
    }
}

#[async_trait]
impl StepExecutor for RunCoordinator {
    async fn execute(&self, ctx: &Context, handler_name: &str, options: &crate::model::StepOptions) -> Result<Value, String> {
        if !self.handlers.contains(handler_name) {
            return Err(format!("no handler registered for '{handler_name}'"));
        }

        let job = Job::new(ctx.run_id, ctx.workflow_id.clone(), ctx.step_name.clone(), ctx.payload.clone())
            .with_timeout(options.timeout.unwrap_or(std::time::Duration::from_secs(30)));
        let job_id = job.id;
        self.pending.insert(
            job_id,
            PendingInvocation {
                ctx: ctx.clone(),
                handler: handler_name.to_string(),
                options: options.clone(),
            },
        );

        let started_at = Utc::now();
        let (_, rx) = self.dispatcher.submit(job).await.map_err(|e| e.to_string())?;
        let result = self.dispatcher.wait_for(rx).await.map_err(|e| e.to_string())?;

        let record = StepRecord {
            run_id: ctx.run_id,
            step_name: ctx.step_name.clone(),
            status: if result.success { StepRecordStatus::Success } else { StepRecordStatus::Failure },
            started_at,
            completed_at: Some(Utc::now()),
            attempts: result.attempts,
            retry_delays: result.retry_delays.clone(),
            output: result.output.clone(),
            error: result.error.clone(),
            duration_ms: result.total_duration.as_millis() as u64,
        };
        if let Err(err) = self.store.append_step_record(record).await {
            warn!(run_id = %ctx.run_id, step = %ctx.step_name, error = %err, "failed to append step record");
        }

        if result.success {
            return Ok(result.output.unwrap_or(Value::Null));
        }

        if let Some(fallback_name) = &options.on_error {
            let fallback_ctx = ctx.with_error(result.error.clone().unwrap_or_default());
            return self
                .handlers
                .invoke(fallback_name, fallback_ctx)
                .await
                .map_err(|e| e.to_string());
        }

        Err(result.error.unwrap_or_else(|| "handler failed with no error detail".to_string()))
    }
}
