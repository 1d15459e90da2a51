//! End-to-end coverage of the retry-then-succeed scenario: a handler
//! that fails its first two attempts and succeeds on the third, driven
//! through the `Engine` with an exponential backoff policy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use workflow_engine::context::Context;
use workflow_engine::handler::HandlerError;
use workflow_engine::model::{Step, StepOptions, StepRecordStatus};
use workflow_engine::prelude::*;

async fn wait_for_terminal(engine: &Arc<Engine>, run_id: workflow_engine::model::RunId) -> Run {
    let mut run = engine.inspect(run_id).await.unwrap();
    for _ in 0..200 {
        if run.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        run = engine.inspect(run_id).await.unwrap();
    }
    run
}

#[tokio::test]
async fn handler_succeeds_on_third_attempt_after_exponential_backoff() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone());

    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = attempts.clone();
        engine.register_handler("flaky_call", move |_ctx: Context| {
            let attempts = attempts.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(HandlerError::failed("connection reset"))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        });
    }

    let retry = RetryOptions {
        attempts: 3,
        backoff: RetryPolicy::new(BackoffStrategy::Exponential, Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(200))
            .with_jitter(false),
        retry_on: None,
    };

    let workflow = Workflow::new("flaky", "flaky").with_steps(vec![Step::action("call", "flaky_call")
        .with_options(StepOptions { retry: Some(retry), ..StepOptions::default() })])
        .with_trigger(TriggerSpec::Manual);

    engine.define(workflow).await.unwrap();
    let run_id = engine.trigger("flaky", json!({})).await.unwrap();
    let run = wait_for_terminal(&engine, run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(run.last_step_name.as_deref(), Some("call"));
    assert_eq!(run.steps_output.get("call"), Some(&json!({"ok": true})));

    let records = store.list_step_records(run_id).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.step_name, "call");
    assert_eq!(record.status, StepRecordStatus::Success);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.retry_delays.len(), 2);
}

#[tokio::test]
async fn handler_exhausts_retries_and_the_run_fails() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone());

    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = attempts.clone();
        engine.register_handler("always_fails", move |_ctx: Context| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::failed("timeout exceeded"))
            }
        });
    }

    let retry = RetryOptions {
        attempts: 2,
        backoff: RetryPolicy::fixed(Duration::from_millis(1)).with_jitter(false),
        retry_on: None,
    };

    let workflow = Workflow::new("always-fails", "always-fails").with_steps(vec![Step::action(
        "call",
        "always_fails",
    )
    .with_options(StepOptions { retry: Some(retry), ..StepOptions::default() })])
    .with_trigger(TriggerSpec::Manual);

    engine.define(workflow).await.unwrap();
    let run_id = engine.trigger("always-fails", json!({})).await.unwrap();
    let run = wait_for_terminal(&engine, run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(run.error.is_some());
    assert_eq!(run.last_step_name.as_deref(), Some("call"));

    let records = store.list_step_records(run_id).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, StepRecordStatus::Failure);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.retry_delays.len(), 1);
}
