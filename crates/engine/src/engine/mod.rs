//! The top-level `Engine` facade.
//!
//! The single owned assembly point for an embedding application: it owns
//! the [`crate::store::Store`], the [`crate::handler::HandlerRegistry`],
//! the [`crate::coordinator::RunCoordinator`], the
//! [`crate::scheduler::Scheduler`], the [`crate::events::EventBus`], the
//! [`crate::pause::PauseRegistry`], the [`crate::kv::StateKv`] and the
//! [`crate::trigger::TriggerIngest`], and exposes the external surface:
//! `define`, `start`, `stop`, `trigger`, `inspect`, `cancel_run`,
//! `publish_event`, `resume`, `list_paused_workflows`, plus State KV
//! passthroughs.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::coordinator::{CoordinatorError, RunCoordinator, RunRequest};
use crate::events::EventBus;
use crate::handler::Handler;
use crate::handler::HandlerRegistry;
use crate::kv::{KvError, Namespace, RunScopedKv, StateKv, WorkflowScopedKv};
use crate::model::{PauseInfo, Run, RunId, TriggerSpec, Workflow, WorkflowError};
use crate::pause::{PauseError, PauseRegistry};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{Store, StoreError};
use crate::trigger::webhook::{self, RunTriggerer};
use crate::trigger::{Trigger, TriggerIngest, WebhookRoute};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Pause(#[from] PauseError),
    #[error("engine already stopped")]
    Stopped,
    #[error("webhook listener failed: {0}")]
    Webhook(String),
}

/// Options accepted by [`Engine::start`]. `webhook_addr`, when set, binds
/// a background `axum` listener fed by [`TriggerIngest`]'s registered
/// routes.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub webhook_addr: Option<SocketAddr>,
}

/// Background tasks owned by a running engine, torn down on `stop()`.
struct RunningState {
    cancel: CancellationToken,
    scheduler_handle: JoinHandle<()>,
    webhook_handle: Option<JoinHandle<()>>,
}

/// The single owned value an embedding application constructs: wires the
/// Store, Handler Registry, Run Coordinator, Scheduler, Event Bus, Pause
/// Registry, State KV and Trigger Ingest together behind one public API.
///
/// `Engine::start`/`Engine::stop` are idempotent: a [`OnceCell`]-guarded
/// state transition means a second concurrent `start()` call observes the
/// first call's result instead of
/// racing it).
pub struct Engine {
    store: Arc<dyn Store>,
    handlers: HandlerRegistry,
    event_bus: Arc<EventBus>,
    pause_registry: Arc<PauseRegistry>,
    coordinator: Arc<RunCoordinator>,
    scheduler: Arc<Scheduler>,
    trigger_ingest: Arc<TriggerIngest>,
    state_kv: StateKv,
    accepting_triggers: AtomicBool,
    start_cell: OnceCell<Result<(), String>>,
    running: Mutex<Option<RunningState>>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        let event_bus = Arc::new(EventBus::new());
        let pause_registry = Arc::new(PauseRegistry::new(store.clone()));
        let handlers = HandlerRegistry::new();
        let coordinator = Arc::new(RunCoordinator::new(
            store.clone(),
            handlers.clone(),
            event_bus.clone(),
            pause_registry.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(store.clone()));
        let state_kv = StateKv::new(store.clone());

        Arc::new(Self {
            store,
            handlers,
            event_bus,
            pause_registry,
            coordinator,
            scheduler,
            trigger_ingest: Arc::new(TriggerIngest::new()),
            state_kv,
            accepting_triggers: AtomicBool::new(true),
            start_cell: OnceCell::new(),
            running: Mutex::new(None),
        })
    }

    /// Register a named handler, invoked by `Action`/`Pause`/hook steps
    /// naming it.
    pub fn register_handler(&self, name: impl Into<String>, handler: impl Handler) {
        self.handlers.register(name, handler);
    }

    /// Validate and register a workflow: any `Webhook` trigger is wired
    /// into the Trigger Ingest router, any `Cron`/`Interval` trigger is
    /// registered with the Scheduler, and the definition is persisted to
    /// the Store. Registration happens immediately rather than waiting
    /// for `start()` — `Store::register_workflow` is idempotent
    /// (`Workflow::semantically_equal`), so there is no benefit to
    /// deferring it, and callers can `trigger` manually before `start()`
    /// without a surprising ordering dependency (see DESIGN.md).
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    pub async fn define(&self, workflow: Workflow) -> Result<(), EngineError> {
        workflow.validate()?;

        for trigger in &workflow.triggers {
            match trigger {
                TriggerSpec::Webhook { path, method } => {
                    self.trigger_ingest
                        .register_webhook(WebhookRoute::new(workflow.id.clone(), method.clone(), path.clone()));
                }
                TriggerSpec::Cron { expression } => {
                    self.scheduler.register_cron(&workflow.id, expression).await?;
                }
                TriggerSpec::Interval { every } => {
                    self.scheduler.register_interval(&workflow.id, every).await?;
                }
                TriggerSpec::Manual | TriggerSpec::Event { .. } => {}
            }
        }

        self.store.register_workflow(workflow).await?;
        Ok(())
    }

    /// Begin the Scheduler's tick loop and, if `webhook_addr` is set, bind
    /// an `axum` listener over the Trigger Ingest routes.
    /// Idempotent: a second call while already started (or starting
    /// concurrently) observes the first call's outcome rather than
    /// starting a second scheduler loop.
    pub async fn start(self: &Arc<Self>, options: StartOptions) -> Result<(), EngineError> {
        let engine = self.clone();
        let result = self
            .start_cell
            .get_or_init(|| async move { engine.start_inner(options).await.map_err(|e| e.to_string()) })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(message) => Err(EngineError::Webhook(message.clone())),
        }
    }

    async fn start_inner(self: &Arc<Self>, options: StartOptions) -> Result<(), EngineError> {
        self.accepting_triggers.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let scheduler = self.scheduler.clone();
        let engine = self.clone();
        let scheduler_cancel = cancel.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler
                .run(scheduler_cancel, |entry| {
                    let engine = engine.clone();
                    async move {
                        let trigger = TriggerIngest::schedule(&entry.workflow_id, &entry.cron_expression, entry.next_fire);
                        if let Err(err) = engine.trigger_raw(trigger).await {
                            warn!(workflow_id = %entry.workflow_id, error = %err, "scheduled trigger failed");
                        }
                    }
                })
                .await;
        });

        let webhook_handle = match options.webhook_addr {
            Some(addr) => Some(self.spawn_webhook_listener(addr, cancel.clone())?),
            None => None,
        };

        *self.running.lock().await = Some(RunningState { cancel, scheduler_handle, webhook_handle });
        info!("engine started");
        Ok(())
    }

    fn spawn_webhook_listener(
        self: &Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, EngineError> {
        let router = webhook::router(self.trigger_ingest.clone(), self.clone());
        Ok(tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(%addr, error = %err, "failed to bind webhook listener");
                    return;
                }
            };
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                cancel.cancelled().await;
            });
            if let Err(err) = serve.await {
                error!(error = %err, "webhook listener exited with error");
            }
        }))
    }

    /// Stop the scheduler and webhook listener and refuse new triggers;
    /// runs already in flight continue to drain in the background.
    /// Idempotent: stopping an engine that was never started, or
    /// stopping twice, is a no-op.
    pub async fn stop(&self) {
        self.accepting_triggers.store(false, Ordering::SeqCst);
        let state = self.running.lock().await.take();
        if let Some(state) = state {
            state.cancel.cancel();
            if let Err(err) = state.scheduler_handle.await {
                warn!(error = %err, "scheduler task panicked during shutdown");
            }
            if let Some(handle) = state.webhook_handle {
                if let Err(err) = handle.await {
                    warn!(error = %err, "webhook listener task panicked during shutdown");
                }
            }
        }
        info!("engine stopped");
    }

    /// Manually trigger a run.
    pub async fn trigger(self: &Arc<Self>, workflow_id: impl Into<String>, payload: Value) -> Result<RunId, EngineError> {
        self.trigger_raw(TriggerIngest::manual(workflow_id, payload)).await
    }

    /// Publish a named event onto the Event Bus, resolving any runs
    /// suspended on a matching `WaitForEvent` step.
    pub fn publish_event(&self, name: impl Into<String>, payload: Value) {
        self.event_bus.publish(name, payload);
    }

    /// Resume a run paused on a `Pause`/`HumanInTheLoop` step.
    pub async fn resume(&self, token: &str, payload: Value) -> Result<(), EngineError> {
        self.pause_registry.resume(token, payload).await.map_err(Into::into)
    }

    /// List every currently-waiting pause across all runs.
    pub async fn list_paused_workflows(&self) -> Result<Vec<PauseInfo>, EngineError> {
        self.pause_registry.list_paused().await.map_err(Into::into)
    }

    /// The full persisted [`Run`], carrying status, timestamps, the last
    /// step name, any error, and its payload/step outputs.
    pub async fn inspect(&self, run_id: RunId) -> Result<Run, EngineError> {
        self.coordinator.inspect(run_id).await.map_err(Into::into)
    }

    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), EngineError> {
        self.coordinator.cancel_run(run_id).await.map_err(Into::into)
    }

    // -----------------------------------------------------------------
    // State KV passthroughs
    // -----------------------------------------------------------------

    pub async fn kv_get(&self, key: &str) -> Result<Value, EngineError> {
        self.state_kv.get(&Namespace::Global, key, None).await.map_err(Into::into)
    }

    pub async fn kv_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), EngineError> {
        self.state_kv.set(&Namespace::Global, key, value, ttl).await.map_err(Into::into)
    }

    pub async fn kv_incr(&self, key: &str, delta: i64) -> Result<i64, EngineError> {
        self.state_kv.incr(&Namespace::Global, key, delta).await.map_err(Into::into)
    }

    pub async fn kv_delete(&self, key: &str) -> Result<(), EngineError> {
        self.state_kv.delete(&Namespace::Global, key).await.map_err(Into::into)
    }

    pub fn kv_scoped_to_run(&self, run_id: RunId) -> RunScopedKv {
        self.state_kv.scoped_to_run(run_id)
    }

    pub fn kv_scoped_to_workflow(&self, workflow_id: impl Into<String>) -> WorkflowScopedKv {
        self.state_kv.scoped_to_workflow(workflow_id)
    }

    /// Shared by [`Engine::trigger`] and the Scheduler's `on_due` callback:
    /// admits the trigger only while the engine is accepting new work,
    /// then hands it to the Run Coordinator.
    async fn trigger_raw(self: &Arc<Self>, trigger: Trigger) -> Result<RunId, EngineError> {
        if !self.accepting_triggers.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        let run_id = self
            .coordinator
            .trigger(RunRequest {
                workflow_id: trigger.workflow_id,
                payload: trigger.payload,
                headers: trigger.headers,
            })
            .await?;
        Ok(run_id)
    }
}

impl RunTriggerer for Engine {
    fn trigger_webhook(&self, trigger: Trigger) -> BoxFuture<'_, Result<RunId, String>> {
        Box::pin(async move {
            if !self.accepting_triggers.load(Ordering::SeqCst) {
                return Err("engine is stopped".to_string());
            }
            self.coordinator
                .trigger(RunRequest {
                    workflow_id: trigger.workflow_id,
                    payload: trigger.payload,
                    headers: trigger.headers,
                })
                .await
                .map_err(|e| e.to_string())
        })
    }
}
