//! Control-Flow Interpreter: walks a workflow's linear `steps` program with
//! a program counter and a branch stack.
//!
//! A one-Rust-state-machine-per-workflow-type model is tempting but wrong
//! here: this crate needs one generic interpreter walking a declarative,
//! serializable `Vec<Step>` with opaque handler names, so a run can resume
//! after a crash from persisted state alone. The program-counter-plus-
//! branch-stack design follows directly from that requirement. Resumption
//! replays `RunEvent`s into a fresh `Context` before the interpreter
//! continues, and handler lookup goes through the name-keyed registry in
//! `crate::handler`.

pub mod predicate;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::context::Context;
use crate::events::{EventBus, EventBusError};
use crate::model::{Step, StepKind, StepOptions, Workflow};
use crate::pause::{PauseError, PauseRegistry, ResumeOutcome};

const MAX_LOOP_ITERATIONS: u32 = 1000;

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("step '{step}' failed: {error}")]
    StepFailed { step: String, error: String },
    #[error("predicate error in '{step}': {error}")]
    PredicateError { step: String, error: String },
    #[error("while loop '{0}' exceeded 1000 iterations")]
    LoopOverflow(String),
    #[error("items expression '{expr}' did not resolve to an array")]
    NotAnArray { expr: String },
    #[error(transparent)]
    EventBus(#[from] EventBusError),
    #[error(transparent)]
    Pause(#[from] PauseError),
    #[error("run was cancelled")]
    Cancelled,
}

/// What the interpreter asks for one handler invocation, whether that's a
/// blocking `Action`, one member of a `Parallel`/`Race` fan-out, or one
/// iteration of a `ForEach`/`Batch` body. Implemented by the Run
/// Coordinator, which is free to route the call through the Execution
/// Envelope, the named circuit breaker, and the Job Dispatcher as it sees
/// fit — the interpreter itself has no notion of any of those, only of
/// "invoke this handler and give me an output or an error".
#[async_trait]
pub trait StepExecutor: Send + Sync + 'static {
    async fn execute(&self, ctx: &Context, handler: &str, options: &StepOptions) -> Result<Value, String>;
}

/// One open `if`/`elseIf`/`else` chain. `skipping` already accounts for any
/// enclosing chain that is itself skipping (set at push time), so callers
/// only ever need to check the top of the stack.
struct BranchFrame {
    /// Whether a branch in this chain has already been taken; once true,
    /// subsequent `elseIf`/`else` in the same chain are always skipped.
    matched: bool,
    skipping: bool,
    /// True if this entire chain lives inside an already-skipping
    /// ancestor; its own predicates are never evaluated.
    inherited_skip: bool,
}

/// Walks a workflow's step program against a live [`Context`], suspending
/// at `Pause`/`WaitForEvent`/`HumanInTheLoop` steps and fanning out
/// `Parallel`/`Race`/`ForEach`/`Batch` through the supplied [`StepExecutor`].
pub struct Interpreter {
    executor: Arc<dyn StepExecutor>,
    event_bus: Arc<EventBus>,
    pause_registry: Arc<PauseRegistry>,
}

impl Interpreter {
    pub fn new(executor: Arc<dyn StepExecutor>, event_bus: Arc<EventBus>, pause_registry: Arc<PauseRegistry>) -> Self {
        Self { executor, event_bus, pause_registry }
    }

    /// Run `workflow`'s top-level step program to completion against `ctx`.
    /// On step failure, `ctx.error` is set and the error is returned; the
    /// Coordinator is responsible for persisting the terminal status and
    /// firing `on_failure` — the interpreter itself only ever reports the
    /// outcome of one pass through the program.
    #[instrument(skip(self, workflow, ctx), fields(workflow_id = %workflow.id, run_id = %ctx.run_id))]
    pub async fn run(&self, workflow: &Workflow, ctx: &mut Context) -> Result<(), InterpreterError> {
        self.run_steps(workflow, &workflow.steps, ctx).await
    }

    /// Boxed so that `While`/`ForEach`/`Batch` bodies (which recurse back
    /// into this method) don't produce an infinitely-sized future type.
    fn run_steps<'a>(
        &'a self,
        workflow: &'a Workflow,
        steps: &'a [Step],
        ctx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = Result<(), InterpreterError>> + Send + 'a>> {
        Box::pin(async move {
            let mut stack: Vec<BranchFrame> = Vec::new();

            for step in steps {
                if ctx.is_cancelled() {
                    return Err(InterpreterError::Cancelled);
                }

                match &step.kind {
                    StepKind::If { predicate, .. } => {
                        let parent_skipping = Self::currently_skipping(&stack);
                        if parent_skipping {
                            stack.push(BranchFrame { matched: true, skipping: true, inherited_skip: true });
                        } else {
                            let met = predicate::evaluate(predicate, ctx)
                                .map_err(|error| InterpreterError::PredicateError { step: step.name.clone(), error })?;
                            stack.push(BranchFrame { matched: met, skipping: !met, inherited_skip: false });
                        }
                        continue;
                    }
                    StepKind::ElseIf { predicate, .. } => {
                        if let Some(frame) = stack.last_mut() {
                            if !frame.inherited_skip && !frame.matched {
                                let met = predicate::evaluate(predicate, ctx)
                                    .map_err(|error| InterpreterError::PredicateError { step: step.name.clone(), error })?;
                                frame.matched = met;
                                frame.skipping = !met;
                            }
                            // inherited_skip, or a branch already matched: stay skipping.
                        }
                        continue;
                    }
                    StepKind::Else { .. } => {
                        if let Some(frame) = stack.last_mut() {
                            if !frame.inherited_skip && !frame.matched {
                                frame.matched = true;
                                frame.skipping = false;
                            }
                        }
                        continue;
                    }
                    StepKind::EndIf { .. } => {
                        stack.pop();
                        continue;
                    }
                    _ => {}
                }

                if Self::currently_skipping(&stack) {
                    continue;
                }

                self.run_one(workflow, step, ctx).await?;
            }

            Ok(())
        })
    }

    fn currently_skipping(stack: &[BranchFrame]) -> bool {
        stack.last().map(|f| f.skipping).unwrap_or(false)
    }

    async fn run_one(&self, workflow: &Workflow, step: &Step, ctx: &mut Context) -> Result<(), InterpreterError> {
        match &step.kind {
            StepKind::Action { handler, background } => {
                if *background {
                    ctx.step_name = step.name.clone();
                    self.spawn_background(workflow, step, ctx, handler.clone());
                } else {
                    ctx.step_name = step.name.clone();
                    let output = self.invoke(ctx, handler, &step.options).await.map_err(|error| {
                        InterpreterError::StepFailed { step: step.name.clone(), error }
                    })?;
                    ctx.steps.insert(step.name.clone(), output.clone());
                    ctx.last = Some(output);
                }
            }
            StepKind::Parallel { handlers, .. } => {
                ctx.step_name = step.name.clone();
                let results = self.run_group(ctx, handlers, &step.options).await;
                let mut outputs = Vec::with_capacity(results.len());
                for result in results {
                    outputs.push(result.map_err(|error| InterpreterError::StepFailed { step: step.name.clone(), error })?);
                }
                let value = Value::Array(outputs);
                ctx.steps.insert(step.name.clone(), value.clone());
                ctx.last = Some(value);
            }
            StepKind::Race { handlers, .. } => {
                ctx.step_name = step.name.clone();
                let value = self.run_race(ctx, handlers, &step.options).await.map_err(|error| {
                    InterpreterError::StepFailed { step: step.name.clone(), error }
                })?;
                ctx.steps.insert(step.name.clone(), value.clone());
                ctx.last = Some(value);
            }
            StepKind::While { name, predicate, body } => {
                let mut iterations: u32 = 0;
                loop {
                    let met = predicate::evaluate(predicate, ctx)
                        .map_err(|error| InterpreterError::PredicateError { step: name.clone(), error })?;
                    if !met {
                        break;
                    }
                    if iterations >= MAX_LOOP_ITERATIONS {
                        return Err(InterpreterError::LoopOverflow(name.clone()));
                    }
                    self.run_steps(workflow, body, ctx).await?;
                    iterations += 1;
                }
            }
            StepKind::ForEach { name, items, body } => {
                let items = predicate::resolve(items, ctx)
                    .and_then(|v| v.as_array().cloned())
                    .ok_or_else(|| InterpreterError::NotAnArray { expr: items.clone() })?;

                let mut futures = Vec::with_capacity(items.len());
                for item in items {
                    let mut item_ctx = ctx.with_item(item);
                    futures.push(async move {
                        self.run_steps(workflow, body, &mut item_ctx).await.map(|_| item_ctx.last)
                    });
                }
                let results = futures::future::join_all(futures).await;
                let mut outputs = Vec::with_capacity(results.len());
                for result in results {
                    outputs.push(result?.unwrap_or(Value::Null));
                }
                let value = Value::Array(outputs);
                ctx.steps.insert(name.clone(), value.clone());
                ctx.last = Some(value);
            }
            StepKind::Batch { name, items, size, body } => {
                let items = predicate::resolve(items, ctx)
                    .and_then(|v| v.as_array().cloned())
                    .ok_or_else(|| InterpreterError::NotAnArray { expr: items.clone() })?;
                let size = (*size).max(1);

                let mut outputs = Vec::with_capacity(items.len());
                for chunk in items.chunks(size) {
                    let mut futures = Vec::with_capacity(chunk.len());
                    for item in chunk {
                        let mut item_ctx = ctx.with_item(item.clone());
                        futures.push(async move {
                            self.run_steps(workflow, body, &mut item_ctx).await.map(|_| item_ctx.last)
                        });
                    }
                    for result in futures::future::join_all(futures).await {
                        outputs.push(result?.unwrap_or(Value::Null));
                    }
                }
                let value = Value::Array(outputs);
                ctx.steps.insert(name.clone(), value.clone());
                ctx.last = Some(value);
            }
            StepKind::Pause { token, callback } => {
                ctx.step_name = step.name.clone();
                if let Some(callback) = callback {
                    let _ = self.invoke(ctx, callback, &step.options).await;
                }
                let rx = self
                    .pause_registry
                    .pause(ctx.run_id, ctx.workflow_id.clone(), step.name.clone(), token.clone(), String::new(), None)
                    .await?;
                match rx.await {
                    Ok(ResumeOutcome::Resumed(payload)) | Ok(ResumeOutcome::TimedOut(payload)) => {
                        ctx.steps.insert(step.name.clone(), payload.clone());
                        ctx.last = Some(payload);
                    }
                    Ok(ResumeOutcome::Cancelled) => return Err(InterpreterError::Cancelled),
                    Err(_) => {
                        return Err(InterpreterError::StepFailed {
                            step: step.name.clone(),
                            error: "pause waiter dropped".to_string(),
                        })
                    }
                }
            }
            StepKind::WaitForEvent { event_name, timeout } => {
                ctx.step_name = step.name.clone();
                let payload = self.event_bus.wait_for_event(ctx.run_id, event_name, *timeout).await?;
                ctx.steps.insert(step.name.clone(), payload.clone());
                ctx.last = Some(payload);
            }
            StepKind::HumanInTheLoop { token, description, timeout, .. } => {
                ctx.step_name = step.name.clone();
                let rx = self
                    .pause_registry
                    .pause(
                        ctx.run_id,
                        ctx.workflow_id.clone(),
                        step.name.clone(),
                        token.clone(),
                        description.clone(),
                        *timeout,
                    )
                    .await?;
                match rx.await {
                    Ok(ResumeOutcome::Resumed(payload)) | Ok(ResumeOutcome::TimedOut(payload)) => {
                        ctx.steps.insert(step.name.clone(), payload.clone());
                        ctx.last = Some(payload);
                    }
                    Ok(ResumeOutcome::Cancelled) => return Err(InterpreterError::Cancelled),
                    Err(_) => {
                        return Err(InterpreterError::StepFailed {
                            step: step.name.clone(),
                            error: "human-in-the-loop waiter dropped".to_string(),
                        })
                    }
                }
            }
            StepKind::If { .. } | StepKind::ElseIf { .. } | StepKind::Else { .. } | StepKind::EndIf { .. } => {
                unreachable!("control-flow markers are handled in run_steps")
            }
        }
        Ok(())
    }

    async fn invoke(&self, ctx: &Context, handler: &str, options: &StepOptions) -> Result<Value, String> {
        self.executor.execute(ctx, handler, options).await
    }

    async fn run_group(&self, ctx: &Context, handlers: &[String], options: &StepOptions) -> Vec<Result<Value, String>> {
        let futures = handlers.iter().map(|handler| {
            let ctx = ctx.clone();
            let options = options.clone();
            async move { self.invoke(&ctx, handler, &options).await }
        });
        futures::future::join_all(futures).await
    }

    /// Await the first success among `handlers`; dropping the remaining
    /// futures in the `FuturesUnordered` is this engine's cancellation of
    /// the losers, since they are plain, unspawned futures rather than
    /// independent tasks.
    async fn run_race(&self, ctx: &Context, handlers: &[String], options: &StepOptions) -> Result<Value, String> {
        let mut pending = FuturesUnordered::new();
        for handler in handlers {
            let ctx = ctx.clone();
            let options = options.clone();
            let handler = handler.clone();
            pending.push(async move { self.invoke(&ctx, &handler, &options).await });
        }

        let mut last_error = "race had no candidates".to_string();
        while let Some(result) = pending.next().await {
            match result {
                Ok(value) => return Ok(value),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    fn spawn_background(&self, workflow: &Workflow, step: &Step, ctx: &Context, handler: String) {
        let executor = self.executor.clone();
        let ctx = ctx.clone();
        let options = step.options.clone();
        let hook = workflow.step_hooks.get(&step.id).cloned();
        let step_id = step.id.clone();
        tokio::spawn(async move {
            let result = executor.execute(&ctx, &handler, &options).await;
            if let Err(error) = &result {
                warn!(step = %step_id, %error, "background action failed");
            }
            if let Some(hook) = hook {
                let hook_ctx = match &result {
                    Ok(output) => ctx.with_last(output.clone()),
                    Err(error) => ctx.with_error(error.clone()),
                };
                if let Err(error) = executor.execute(&hook_ctx, &hook, &StepOptions::default()).await {
                    warn!(step = %step_id, %error, "background action hook failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::StateKv;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct EchoExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StepExecutor for EchoExecutor {
        async fn execute(&self, ctx: &Context, handler: &str, _options: &StepOptions) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match handler {
                "fail" => Err("boom".to_string()),
                "echo_amount" => Ok(ctx.payload.get("amount").cloned().unwrap_or(Value::Null)),
                other => Ok(json!({ "handler": other })),
            }
        }
    }

    fn test_ctx(payload: Value) -> Context {
        let store = Arc::new(MemoryStore::new());
        let kv = StateKv::new(store);
        Context {
            run_id: uuid::Uuid::now_v7(),
            workflow_id: "wf".into(),
            step_name: String::new(),
            payload,
            steps: HashMap::new(),
            last: None,
            services: Vec::new(),
            trigger_headers: HashMap::new(),
            state: kv.scoped_to_run(uuid::Uuid::now_v7()),
            cancel: CancellationToken::new(),
            error: None,
        }
    }

    fn interpreter(executor: Arc<dyn StepExecutor>) -> Interpreter {
        let store = Arc::new(MemoryStore::new());
        Interpreter::new(executor, Arc::new(EventBus::new()), Arc::new(PauseRegistry::new(store)))
    }

    #[tokio::test]
    async fn high_value_branch_executes_process_high() {
        let executor = Arc::new(EchoExecutor { calls: AtomicUsize::new(0) });
        let interp = interpreter(executor);
        let workflow = Workflow::new("wf", "amount-check").with_steps(vec![
            Step::action("check-amount", "echo_amount"),
            Step {
                id: "if1".into(),
                name: "if_is-high-value".into(),
                title: None,
                description: None,
                kind: StepKind::If { name: "is-high-value".into(), predicate: "amount>120".into() },
                options: StepOptions::default(),
            },
            Step::action("process-high", "mark_high"),
            Step {
                id: "endif1".into(),
                name: "endif".into(),
                title: None,
                description: None,
                kind: StepKind::EndIf { name: "is-high-value".into() },
                options: StepOptions::default(),
            },
            Step::action("final", "finalize"),
        ]);

        let mut ctx = test_ctx(json!({"amount": 500}));
        interp.run(&workflow, &mut ctx).await.unwrap();
        assert!(ctx.steps.contains_key("process-high"));
        assert!(ctx.steps.contains_key("final"));
    }

    #[tokio::test]
    async fn low_value_skips_process_high() {
        let executor = Arc::new(EchoExecutor { calls: AtomicUsize::new(0) });
        let interp = interpreter(executor);
        let workflow = Workflow::new("wf", "amount-check").with_steps(vec![
            Step::action("check-amount", "echo_amount"),
            Step {
                id: "if1".into(),
                name: "if_is-high-value".into(),
                title: None,
                description: None,
                kind: StepKind::If { name: "is-high-value".into(), predicate: "amount>120".into() },
                options: StepOptions::default(),
            },
            Step::action("process-high", "mark_high"),
            Step {
                id: "endif1".into(),
                name: "endif".into(),
                title: None,
                description: None,
                kind: StepKind::EndIf { name: "is-high-value".into() },
                options: StepOptions::default(),
            },
            Step::action("final", "finalize"),
        ]);

        let mut ctx = test_ctx(json!({"amount": 50}));
        interp.run(&workflow, &mut ctx).await.unwrap();
        assert!(!ctx.steps.contains_key("process-high"));
        assert!(ctx.steps.contains_key("final"));
    }

    #[tokio::test]
    async fn step_failure_propagates_as_interpreter_error() {
        let executor = Arc::new(EchoExecutor { calls: AtomicUsize::new(0) });
        let interp = interpreter(executor);
        let workflow = Workflow::new("wf", "x").with_steps(vec![Step::action("s1", "fail")]);
        let mut ctx = test_ctx(json!({}));
        let err = interp.run(&workflow, &mut ctx).await.unwrap_err();
        assert!(matches!(err, InterpreterError::StepFailed { .. }));
    }

    #[tokio::test]
    async fn parallel_step_preserves_source_order() {
        let executor = Arc::new(EchoExecutor { calls: AtomicUsize::new(0) });
        let interp = interpreter(executor);
        let workflow = Workflow::new("wf", "x").with_steps(vec![Step {
            id: "p1".into(),
            name: "fanout".into(),
            title: None,
            description: None,
            kind: StepKind::Parallel {
                group_id: "g1".into(),
                handlers: vec!["a".into(), "b".into(), "c".into()],
            },
            options: StepOptions::default(),
        }]);
        let mut ctx = test_ctx(json!({}));
        interp.run(&workflow, &mut ctx).await.unwrap();
        let output = ctx.steps.get("fanout").unwrap();
        assert_eq!(output, &json!([{"handler": "a"}, {"handler": "b"}, {"handler": "c"}]));
    }

    #[tokio::test]
    async fn while_loop_honors_max_iterations() {
        let executor = Arc::new(EchoExecutor { calls: AtomicUsize::new(0) });
        let interp = interpreter(executor);
        let workflow = Workflow::new("wf", "x").with_steps(vec![Step {
            id: "w1".into(),
            name: "loop".into(),
            title: None,
            description: None,
            kind: StepKind::While {
                name: "loop".into(),
                predicate: "true".into(),
                body: vec![Step::action("tick", "noop")],
            },
            options: StepOptions::default(),
        }]);
        let mut ctx = test_ctx(json!({}));
        let err = interp.run(&workflow, &mut ctx).await.unwrap_err();
        assert!(matches!(err, InterpreterError::LoopOverflow(_)));
    }

    #[tokio::test]
    async fn for_each_runs_body_per_item() {
        let executor = Arc::new(EchoExecutor { calls: AtomicUsize::new(0) });
        let interp = interpreter(executor);
        let workflow = Workflow::new("wf", "x").with_steps(vec![Step {
            id: "fe1".into(),
            name: "each".into(),
            title: None,
            description: None,
            kind: StepKind::ForEach {
                name: "each".into(),
                items: "items".into(),
                body: vec![Step::action("process", "process_item")],
            },
            options: StepOptions::default(),
        }]);
        let mut ctx = test_ctx(json!({"items": [1, 2, 3]}));
        interp.run(&workflow, &mut ctx).await.unwrap();
        let output = ctx.steps.get("each").unwrap().as_array().unwrap();
        assert_eq!(output.len(), 3);
    }
}
