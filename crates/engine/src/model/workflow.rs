//! The `Workflow` aggregate: an immutable, registered program of steps plus
//! its trigger specs, hooks and service map.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::step::Step;

/// Error surfaced at workflow registration time (never at run time).
///
/// Covers invalid workflow shape: bad duration/cron, empty id, duplicate
/// id, unsupported option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct WorkflowError {
    pub message: String,
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// The set of ways a run can be created for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    Manual,
    Webhook { path: String, method: String },
    Cron { expression: String },
    Interval { every: String },
    Event { name: String },
}

/// Opaque callable name invoked at a lifecycle transition.
pub type HookName = String;

/// An immutable, registered workflow: an ordered step program plus its
/// trigger specs, concurrency cap, default timeout, lifecycle hooks and
/// service capability map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: u32,
    pub steps: Vec<Step>,
    pub triggers: Vec<TriggerSpec>,
    /// `None` means unlimited concurrent runs.
    pub concurrency: Option<usize>,
    pub timeout: Option<Duration>,
    pub on_success: Option<HookName>,
    pub on_failure: Option<HookName>,
    /// Per-step-id hooks invoked in addition to the terminal ones above.
    pub step_hooks: HashMap<String, HookName>,
    /// Name -> opaque capability, threaded through to every step context
    /// unmodified. This crate does not interpret the values at all.
    pub services: Vec<String>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: 1,
            steps: Vec::new(),
            triggers: Vec::new(),
            concurrency: None,
            timeout: None,
            on_success: None,
            on_failure: None,
            step_hooks: HashMap::new(),
            services: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSpec) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_concurrency(mut self, max: usize) -> Self {
        self.concurrency = Some(max);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_on_success(mut self, hook: impl Into<String>) -> Self {
        self.on_success = Some(hook.into());
        self
    }

    pub fn with_on_failure(mut self, hook: impl Into<String>) -> Self {
        self.on_failure = Some(hook.into());
        self
    }

    /// Validate structural invariants at registration time. Never called
    /// from the run path; every error here is a `ConfigurationError`.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.id.trim().is_empty() {
            return Err(WorkflowError::new("workflow id must not be empty")
                .with_code("EMPTY_WORKFLOW_ID"));
        }
        let mut seen_ids = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(
                    WorkflowError::new("step id must not be empty").with_code("EMPTY_STEP_ID")
                );
            }
            if !seen_ids.insert(step.id.clone()) {
                return Err(WorkflowError::new(format!("duplicate step id: {}", step.id))
                    .with_code("DUPLICATE_STEP_ID"));
            }
        }
        for trigger in &self.triggers {
            if let TriggerSpec::Webhook { path, .. } = trigger {
                if path.trim().is_empty() {
                    return Err(WorkflowError::new("webhook path must not be empty")
                        .with_code("EMPTY_WEBHOOK_PATH"));
                }
            }
        }
        validate_step_nesting(&self.steps)?;
        Ok(())
    }

    /// Whether two registrations of the same id are semantically identical
    /// (used by the Store's idempotent `register_workflow`).
    pub fn semantically_equal(&self, other: &Workflow) -> bool {
        self == other
    }
}

/// `If`/`ElseIf`/`Else`/`EndIf` markers must nest properly: every `If` is
/// eventually closed by a matching `EndIf`, and `ElseIf`/`Else` may only
/// appear between an open `If` and its `EndIf`.
fn validate_step_nesting(steps: &[Step]) -> Result<(), WorkflowError> {
    use super::step::StepKind;

    let mut depth: i32 = 0;
    for step in steps {
        match &step.kind {
            StepKind::If { .. } => depth += 1,
            StepKind::ElseIf { .. } | StepKind::Else { .. } => {
                if depth == 0 {
                    return Err(WorkflowError::new(
                        "elseIf/else without a preceding open if",
                    )
                    .with_code("MALFORMED_CONTROL_FLOW"));
                }
            }
            StepKind::EndIf { .. } => {
                depth -= 1;
                if depth < 0 {
                    return Err(
                        WorkflowError::new("endIf without a matching if")
                            .with_code("MALFORMED_CONTROL_FLOW"),
                    );
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(WorkflowError::new("unclosed if block").with_code("MALFORMED_CONTROL_FLOW"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::step::{Step, StepKind};
    use super::*;

    #[test]
    fn rejects_empty_workflow_id() {
        let w = Workflow::new("", "x");
        assert!(w.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let w = Workflow::new("wf", "x").with_steps(vec![
            Step::action("s1", "h1"),
            Step::action("s1", "h2"),
        ]);
        assert!(w.validate().is_err());
    }

    #[test]
    fn rejects_unbalanced_if() {
        let w = Workflow::new("wf", "x").with_steps(vec![Step {
            id: "if1".into(),
            name: "if1".into(),
            title: None,
            description: None,
            kind: StepKind::If {
                name: "cond".into(),
                predicate: "true".into(),
            },
            options: Default::default(),
        }]);
        assert!(w.validate().is_err());
    }

    #[test]
    fn rejects_empty_webhook_path() {
        let w = Workflow::new("wf", "x").with_trigger(TriggerSpec::Webhook {
            path: "".into(),
            method: "POST".into(),
        });
        assert!(w.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_workflow() {
        let w = Workflow::new("wf", "x").with_steps(vec![
            Step {
                id: "if1".into(),
                name: "if1".into(),
                title: None,
                description: None,
                kind: StepKind::If {
                    name: "cond".into(),
                    predicate: "amount>120".into(),
                },
                options: Default::default(),
            },
            Step {
                id: "endif1".into(),
                name: "endif1".into(),
                title: None,
                description: None,
                kind: StepKind::EndIf { name: "cond".into() },
                options: Default::default(),
            },
        ]);
        assert!(w.validate().is_ok());
    }
}
