//! End-to-end coverage of the human-in-the-loop-with-timeout scenario: a
//! run pausing on a `HumanInTheLoop` step that is never resumed surfaces
//! the synthesized timeout payload and the run still completes (the
//! timeout payload is a normal step output, not a failure).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use workflow_engine::context::Context;
use workflow_engine::model::{Step, StepKind, StepOptions};
use workflow_engine::prelude::*;

async fn wait_for_terminal(engine: &Arc<Engine>, run_id: workflow_engine::model::RunId) -> Run {
    let mut run = engine.inspect(run_id).await.unwrap();
    for _ in 0..300 {
        if run.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        run = engine.inspect(run_id).await.unwrap();
    }
    run
}

#[tokio::test]
async fn unanswered_approval_times_out_and_the_run_completes() {
    let engine = Engine::new(Arc::new(MemoryStore::new()));

    let after_approval_output = Arc::new(std::sync::Mutex::new(None));
    {
        let captured = after_approval_output.clone();
        engine.register_handler("record_decision", move |ctx: Context| {
            let captured = captured.clone();
            async move {
                *captured.lock().unwrap() = ctx.last.clone();
                Ok(json!("recorded"))
            }
        });
    }

    let workflow = Workflow::new("needs-approval", "needs-approval")
        .with_steps(vec![
            Step {
                id: "approve".into(),
                name: "manager-approval".into(),
                title: None,
                description: None,
                kind: StepKind::HumanInTheLoop {
                    token: "approval-token".into(),
                    description: "approve the refund".into(),
                    timeout: Some(Duration::from_millis(50)),
                    metadata: json!({}),
                },
                options: StepOptions::default(),
            },
            Step::action("record", "record_decision"),
        ])
        .with_trigger(TriggerSpec::Manual);

    engine.define(workflow).await.unwrap();
    let run_id = engine.trigger("needs-approval", json!({"amount": 250})).await.unwrap();

    // Deliberately never call engine.resume(...): the pause must time out
    // on its own after 50ms.
    let run = wait_for_terminal(&engine, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);

    let output = after_approval_output.lock().unwrap().clone().unwrap();
    assert_eq!(output.get("approved"), Some(&json!(false)));
    assert_eq!(output.get("timedOut"), Some(&json!(true)));
}

#[tokio::test]
async fn explicit_resume_delivers_the_caller_supplied_payload() {
    let engine = Engine::new(Arc::new(MemoryStore::new()));

    let resumed_called = Arc::new(AtomicBool::new(false));
    {
        let flag = resumed_called.clone();
        engine.register_handler("record_decision", move |ctx: Context| {
            let flag = flag.clone();
            async move {
                if ctx.last.as_ref().and_then(|v| v.get("approved")).and_then(|v| v.as_bool()) == Some(true) {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok(json!("recorded"))
            }
        });
    }

    let workflow = Workflow::new("needs-approval-2", "needs-approval-2")
        .with_steps(vec![
            Step {
                id: "approve".into(),
                name: "manager-approval".into(),
                title: None,
                description: None,
                kind: StepKind::HumanInTheLoop {
                    token: "approval-token-2".into(),
                    description: "approve the refund".into(),
                    timeout: Some(Duration::from_secs(30)),
                    metadata: json!({}),
                },
                options: StepOptions::default(),
            },
            Step::action("record", "record_decision"),
        ])
        .with_trigger(TriggerSpec::Manual);

    engine.define(workflow).await.unwrap();
    let run_id = engine.trigger("needs-approval-2", json!({})).await.unwrap();

    // Give the interpreter a moment to reach the pause before resuming.
    for _ in 0..50 {
        if !engine.list_paused_workflows().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.resume("approval-token-2", json!({"approved": true, "approvedBy": "mgr-1"})).await.unwrap();

    let run = wait_for_terminal(&engine, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(resumed_called.load(Ordering::SeqCst));
}
