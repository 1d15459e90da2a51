//! `Job`: the dispatcher's unit of work.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::RunId;
use super::step::RetryOptions;

pub type JobId = Uuid;

/// Dispatch priority. A hint, not a hard guarantee: dependency gating can
/// and does preempt priority ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// A unit of work in the dispatcher: one step's dispatch record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub workflow_id: String,
    pub step_name: String,
    pub state: JobState,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub retry_config: Option<RetryOptions>,
    /// Job ids that must reach `Completed` before this job may be
    /// dequeued.
    pub dependencies: Vec<JobId>,
    #[serde(with = "super::step::duration_millis")]
    pub timeout: Duration,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(run_id: RunId, workflow_id: impl Into<String>, step_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            workflow_id: workflow_id.into(),
            step_name: step_name.into(),
            state: JobState::Pending,
            priority: JobPriority::default(),
            payload,
            retry_config: None,
            dependencies: Vec::new(),
            timeout: Duration::from_secs(30),
            attempt_count: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<JobId>) -> Self {
        self.dependencies = deps;
        self
    }
}
