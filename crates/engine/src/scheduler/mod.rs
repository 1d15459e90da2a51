//! Scheduler: fires due cron/interval entries into the Run Coordinator.
//!
//! A `tokio::select!` 1-second tick loop keeps `list_due_schedules`/
//! `advance_schedule` Store-driven and crash-recoverable, rather than
//! handing scheduling off to a background thread the store can't observe.
//! Next-fire times are computed with `croner` against the real cron
//! expression rather than approximated with a fixed offset.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::model::ScheduleEntry;
use crate::store::{Store, StoreError};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("invalid interval '{0}': expected Nm/Nh/Nd")]
    InvalidInterval(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Interval triggers are transformed to cron on registration:
/// `Nm -> */N * * * *`, `Nh -> 0 */N * * *`, `Nd -> 0 0 */N * *`. Anything
/// else is a registration error.
pub fn normalize_interval(every: &str) -> Result<String, SchedulerError> {
    let trimmed = every.trim();
    let (digits, unit) = trimmed.split_at(trimmed.len().saturating_sub(1));
    let n: u32 = digits
        .parse()
        .map_err(|_| SchedulerError::InvalidInterval(every.to_string()))?;
    if n == 0 {
        return Err(SchedulerError::InvalidInterval(every.to_string()));
    }
    match unit {
        "m" => Ok(format!("*/{n} * * * *")),
        "h" => Ok(format!("0 */{n} * * *")),
        "d" => Ok(format!("0 0 */{n} * *")),
        _ => Err(SchedulerError::InvalidInterval(every.to_string())),
    }
}

fn parse_cron(expression: &str) -> Result<Cron, SchedulerError> {
    expression
        .parse::<Cron>()
        .map_err(|e| SchedulerError::InvalidCron(format!("{expression}: {e}")))
}

fn next_fire_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    let cron = parse_cron(expression)?;
    cron.iter_after(after)
        .next()
        .ok_or_else(|| SchedulerError::InvalidCron(expression.to_string()))
}

/// Holds due cron/interval entries and fires them on a 1-second tick.
pub struct Scheduler {
    store: Arc<dyn Store>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validate `cron_expression` and register/replace the workflow's
    /// schedule entry, computing a real `next_fire` via `croner`.
    #[instrument(skip(self))]
    pub async fn register_cron(&self, workflow_id: &str, cron_expression: &str) -> Result<(), SchedulerError> {
        let next_fire = next_fire_after(cron_expression, Utc::now())?;
        self.store
            .upsert_schedule(ScheduleEntry {
                workflow_id: workflow_id.to_string(),
                cron_expression: cron_expression.to_string(),
                last_fired: None,
                next_fire,
            })
            .await?;
        Ok(())
    }

    pub async fn register_interval(&self, workflow_id: &str, every: &str) -> Result<(), SchedulerError> {
        let cron_expression = normalize_interval(every)?;
        self.register_cron(workflow_id, &cron_expression).await
    }

    /// Run the tick loop until `cancel` fires. `on_due` is invoked once per
    /// due entry with the pre-advance `ScheduleEntry`; this method advances
    /// `next_fire`/`last_fired` itself once `on_due` returns.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, on_due: F)
    where
        F: Fn(ScheduleEntry) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    if let Err(err) = self.tick(&on_due).await {
                        warn!(error = %err, "scheduler tick failed");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("scheduler stopping");
                    return;
                }
            }
        }
    }

    async fn tick<F, Fut>(&self, on_due: &F) -> Result<(), SchedulerError>
    where
        F: Fn(ScheduleEntry) -> Fut,
        Fut: Future<Output = ()>,
    {
        let now = Utc::now();
        let due = self.store.list_due_schedules(now).await?;
        for entry in due {
            on_due(entry.clone()).await;
            match next_fire_after(&entry.cron_expression, now) {
                Ok(next_fire) => {
                    self.store.advance_schedule(&entry.workflow_id, now, next_fire).await?;
                }
                Err(err) => warn!(workflow_id = %entry.workflow_id, error = %err, "failed to compute next fire"),
            }
        }
        Ok(())
    }
}
