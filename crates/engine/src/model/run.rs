//! `Run`, `StepRecord`, `PauseInfo`, `ScheduleEntry`: the aggregates the
//! Store persists and the Coordinator/Interpreter mutate across a run's
//! lifetime.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow::WorkflowError;

pub type RunId = Uuid;

/// `Pending -> Running <-> Paused -> {Completed|Failed|Cancelled}`.
///
/// Once a run reaches a terminal variant, no further status mutation or
/// `StepRecord` append is permitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    /// Whether transitioning from `self` to `next` is a legal run
    /// transition under the monotonicity invariant: once terminal, a run
    /// never moves again.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Paused, Cancelled) => true,
            (s, n) if s == n => true,
            _ => false,
        }
    }
}

/// One execution instance of a workflow over a specific trigger payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub payload: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<WorkflowError>,
    pub steps_output: HashMap<String, serde_json::Value>,
    pub paused_token: Option<String>,
    pub last_step_name: Option<String>,
}

impl Run {
    pub fn new(workflow_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            payload,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            steps_output: HashMap::new(),
            paused_token: None,
            last_step_name: None,
        }
    }
}

/// Persistent record of one step attempt. Written once per attempt; the
/// final attempt for a `(run_id, step_name)` pair is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub run_id: RunId,
    pub step_name: String,
    pub status: StepRecordStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(with = "duration_vec_millis")]
    pub retry_delays: Vec<Duration>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepRecordStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PauseStatus {
    Waiting,
    Resumed,
    TimedOut,
    Cancelled,
}

/// `token -> suspended run` mapping maintained by the Pause Registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PauseInfo {
    pub token: String,
    pub run_id: RunId,
    pub workflow_id: String,
    pub step_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: PauseStatus,
    pub resume_payload: Option<serde_json::Value>,
    pub last_step_output: Option<serde_json::Value>,
}

/// A registered cron/interval trigger's schedule bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub workflow_id: String,
    pub cron_expression: String,
    pub last_fired: Option<DateTime<Utc>>,
    pub next_fire: DateTime<Utc>,
}

mod duration_vec_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(v: &[Duration], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis: Vec<u128> = v.iter().map(|d| d.as_millis()).collect();
        millis.serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Vec<u64> = Vec::deserialize(d)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_monotonicity_allows_documented_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn run_status_monotonicity_rejects_illegal_transitions() {
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Paused));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn terminal_statuses_are_identified() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }
}
