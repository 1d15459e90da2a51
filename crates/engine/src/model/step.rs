//! `Step`: the mini-bytecode the Control-Flow Interpreter walks.
//!
//! Control flow (`if/elseIf/else/endIf`) is flattened into a linear sequence
//! of marker steps rather than a nested AST, per the interpreter's
//! program-counter-plus-branch-stack design (see `interpreter`). This makes
//! a run resumable from a flat, serializable list rather than requiring a
//! recursive tree walk to be checkpointed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::{CircuitBreakerConfig, RetryPolicy};

/// One element of a workflow's step program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub kind: StepKind,
    pub options: StepOptions,
}

impl Step {
    /// Convenience constructor for a plain blocking step with an opaque
    /// handler name and no resilience options.
    pub fn action(id: impl Into<String>, handler: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            title: None,
            description: None,
            kind: StepKind::Action {
                handler: handler.into(),
                background: false,
            },
            options: StepOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }
}

/// The discriminated kinds a step may be. Control-flow markers
/// (`If`/`ElseIf`/`Else`/`EndIf`) must appear properly nested within a
/// workflow's step list (enforced at registration, see
/// `Workflow::validate`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StepKind {
    /// Evaluate `predicate` against the run context; if false, everything
    /// up to the matching `EndIf` (unless an `ElseIf`/`Else` matches first)
    /// is skipped.
    If { name: String, predicate: String },
    /// Only reachable while a previous branch in the same if-chain was
    /// skipped.
    ElseIf { name: String, predicate: String },
    /// Mirror of `ElseIf` with an implicit `true` predicate.
    Else { name: String },
    /// Closes the branch frame opened by the matching `If`.
    EndIf { name: String },

    /// Regular step/action with an opaque handler. `background = true`
    /// marks a fire-and-forget action (the interpreter advances without
    /// blocking on completion).
    Action {
        handler: String,
        #[serde(default)]
        background: bool,
    },

    /// Fan out `handlers` concurrently; await all. Output is the ordered
    /// array of outputs (source order, not completion order). Any failure
    /// fails the step.
    Parallel { group_id: String, handlers: Vec<String> },

    /// Fan out `handlers` concurrently; await the first success and cancel
    /// the rest. Output is the winner's output. If all fail, the step
    /// fails.
    Race { group_id: String, handlers: Vec<String> },

    /// Bounded loop (hard cap of 1000 iterations) evaluating `predicate`
    /// before each iteration of `body`.
    While {
        name: String,
        predicate: String,
        body: Vec<Step>,
    },

    /// Iterate `items` (a run-context expression naming a JSON array) in
    /// parallel, running `body` as a private sub-interpretation per item.
    ForEach {
        name: String,
        items: String,
        body: Vec<Step>,
    },

    /// Like `ForEach` but `items` is processed in sequential batches of
    /// `size`, running `body` in parallel within each batch.
    Batch {
        name: String,
        items: String,
        size: usize,
        body: Vec<Step>,
    },

    /// Suspend the run until resumed by an external call carrying `token`.
    Pause {
        token: String,
        callback: Option<String>,
    },

    /// Suspend the run until `event_name` is published or `timeout`
    /// elapses.
    WaitForEvent {
        event_name: String,
        #[serde(default, with = "crate::model::step::option_duration_millis")]
        timeout: Option<Duration>,
    },

    /// A specialized pause: expects a resume payload shaped
    /// `{approved: bool, reason?, approvedBy?}`, or the synthesized
    /// timeout payload if `timeout` elapses first.
    HumanInTheLoop {
        token: String,
        description: String,
        #[serde(default, with = "crate::model::step::option_duration_millis")]
        timeout: Option<Duration>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
}

/// Per-step resilience and scheduling options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepOptions {
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,
    pub retry: Option<RetryOptions>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub cache: Option<CacheOptions>,
    #[serde(default, with = "option_duration_millis")]
    pub delay: Option<Duration>,
    /// Fallback handler invoked after retries are exhausted; its return
    /// value becomes a successful output.
    pub on_error: Option<String>,
}

/// Retry configuration embedded in a step's options. Wraps
/// [`RetryPolicy`] plus an optional `retry_on` selector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryOptions {
    pub attempts: u32,
    pub backoff: RetryPolicy,
    pub retry_on: Option<RetryOn>,
}

/// How to decide whether a failed attempt should be retried. Exactly one
/// of these is evaluated, in the priority order documented on
/// `Envelope::is_retryable`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetryOn {
    pub error_patterns: Vec<String>,
    pub status_codes: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheOptions {
    pub key_fn: Option<String>,
    #[serde(with = "crate::model::step::duration_millis")]
    pub ttl: Duration,
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        d.as_millis().serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(d) => d.as_millis().serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_step_defaults_to_blocking() {
        let step = Step::action("s1", "my_handler");
        match step.kind {
            StepKind::Action { background, .. } => assert!(!background),
            _ => panic!("expected Action"),
        }
    }

    #[test]
    fn step_kind_round_trips_through_json() {
        let step = Step {
            id: "wait1".into(),
            name: "wait1".into(),
            title: None,
            description: None,
            kind: StepKind::WaitForEvent {
                event_name: "order.paid".into(),
                timeout: Some(Duration::from_secs(30)),
            },
            options: StepOptions::default(),
        };
        let json = serde_json::to_string(&step).unwrap();
        let parsed: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(step, parsed);
    }
}
