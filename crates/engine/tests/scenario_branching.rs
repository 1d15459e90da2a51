//! End-to-end coverage of the `If`/`EndIf` branch-skip scenario through the
//! `Engine` facade: a high-value payload takes the branch, a low-value
//! payload skips it, and the trailing step always runs either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use workflow_engine::context::Context;
use workflow_engine::model::{Step, StepKind, StepOptions, StepRecordStatus};
use workflow_engine::prelude::*;

fn branching_workflow() -> Workflow {
    Workflow::new("amount-check", "amount-check").with_steps(vec![
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
    ])
    .with_trigger(TriggerSpec::Manual)
}

async fn wait_for_terminal(engine: &Arc<Engine>, run_id: workflow_engine::model::RunId) -> Run {
    let mut run = engine.inspect(run_id).await.unwrap();
    for _ in 0..100 {
        if run.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        run = engine.inspect(run_id).await.unwrap();
    }
    run
}

#[tokio::test]
async fn high_value_payload_executes_the_branch() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone());

    let process_high_called = Arc::new(AtomicBool::new(false));
    let finalize_called = Arc::new(AtomicBool::new(false));

    engine.register_handler("echo_amount", |ctx: Context| async move {
        Ok(ctx.payload.get("amount").cloned().unwrap_or(json!(null)))
    });
    {
        let flag = process_high_called.clone();
        engine.register_handler("mark_high", move |_ctx: Context| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(json!("processed"))
            }
        });
    }
    {
        let flag = finalize_called.clone();
        engine.register_handler("finalize", move |_ctx: Context| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(json!("done"))
            }
        });
    }

    engine.define(branching_workflow()).await.unwrap();
    let run_id = engine.trigger("amount-check", json!({"amount": 500})).await.unwrap();
    let run = wait_for_terminal(&engine, run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(process_high_called.load(Ordering::SeqCst));
    assert!(finalize_called.load(Ordering::SeqCst));
    assert_eq!(run.last_step_name.as_deref(), Some("final"));
    assert_eq!(run.steps_output.get("check-amount"), Some(&json!(500)));
    assert_eq!(run.steps_output.get("process-high"), Some(&json!("processed")));
    assert_eq!(run.steps_output.get("final"), Some(&json!("done")));

    let records = store.list_step_records(run_id).await.unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.step_name.as_str()).collect();
    assert_eq!(names, vec!["check-amount", "process-high", "final"]);
    assert!(records.iter().all(|r| r.status == StepRecordStatus::Success));
}

#[tokio::test]
async fn low_value_payload_skips_the_branch_but_still_finalizes() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone());

    let process_high_called = Arc::new(AtomicBool::new(false));
    let finalize_called = Arc::new(AtomicBool::new(false));

    engine.register_handler("echo_amount", |ctx: Context| async move {
        Ok(ctx.payload.get("amount").cloned().unwrap_or(json!(null)))
    });
    {
        let flag = process_high_called.clone();
        engine.register_handler("mark_high", move |_ctx: Context| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(json!("processed"))
            }
        });
    }
    {
        let flag = finalize_called.clone();
        engine.register_handler("finalize", move |_ctx: Context| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(json!("done"))
            }
        });
    }

    engine.define(branching_workflow()).await.unwrap();
    let run_id = engine.trigger("amount-check", json!({"amount": 50})).await.unwrap();
    let run = wait_for_terminal(&engine, run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(!process_high_called.load(Ordering::SeqCst));
    assert!(finalize_called.load(Ordering::SeqCst));
    assert_eq!(run.last_step_name.as_deref(), Some("final"));
    assert!(!run.steps_output.contains_key("process-high"));

    let records = store.list_step_records(run_id).await.unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.step_name.as_str()).collect();
    assert_eq!(names, vec!["check-amount", "final"]);
}
