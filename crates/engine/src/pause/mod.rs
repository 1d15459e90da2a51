//! Pause Registry & Human-in-the-Loop.
//!
//! Opaque one-shot resume tokens with an auto-timeout: a run suspends on
//! an `oneshot::Receiver`, and a background `tokio::select!` sweeper
//! resolves it with a synthesized timeout payload if no caller resumes it
//! in time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{instrument, warn};

use crate::model::{PauseInfo, PauseStatus, RunId};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum PauseError {
    #[error("pause token not found: {0}")]
    TokenInvalid(String),
    #[error("pause token already resumed or expired: {0}")]
    TokenExpired(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a suspended interpreter receives when its pause resolves.
#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    Resumed(serde_json::Value),
    TimedOut(serde_json::Value),
    Cancelled,
}

/// Synthesized output for a Human-in-the-Loop step whose `timeout` elapsed
/// before an external `resume` call.
fn timeout_payload() -> serde_json::Value {
    json!({"approved": false, "timedOut": true, "reason": "Timeout", "status": "timeout"})
}

/// Maps opaque, one-shot tokens to suspended runs. Pairs a durable
/// [`PauseInfo`] record (so `inspect`/`list_paused_workflows` survive a
/// restart) with an in-memory one-shot waiter that actually unblocks the
/// interpreter task awaiting it in this process.
#[derive(Clone)]
pub struct PauseRegistry {
    store: Arc<dyn Store>,
    waiters: Arc<DashMap<String, oneshot::Sender<ResumeOutcome>>>,
}

impl PauseRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            waiters: Arc::new(DashMap::new()),
        }
    }

    /// Persist a new pause and register its waiter. Spawns the timeout
    /// sweeper if `timeout` is set. Returns the receiver the interpreter
    /// awaits to resume.
    #[instrument(skip(self))]
    pub async fn pause(
        &self,
        run_id: RunId,
        workflow_id: String,
        step_name: String,
        token: String,
        description: String,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<ResumeOutcome>, PauseError> {
        let expires_at = timeout.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        let info = PauseInfo {
            token: token.clone(),
            run_id,
            workflow_id,
            step_name,
            description,
            created_at: Utc::now(),
            expires_at,
            status: PauseStatus::Waiting,
            resume_payload: None,
            last_step_output: None,
        };
        self.store.store_pause(info).await?;

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(token.clone(), tx);

        if let Some(duration) = timeout {
            let registry = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Err(err) = registry.timeout_if_still_waiting(&token).await {
                    warn!(%token, error = %err, "pause timeout sweep failed");
                }
            });
        }

        Ok(rx)
    }

    async fn timeout_if_still_waiting(&self, token: &str) -> Result<(), PauseError> {
        let Some(mut info) = self.store.load_pause(token).await.ok() else {
            return Ok(());
        };
        if info.status != PauseStatus::Waiting {
            return Ok(());
        }
        info.status = PauseStatus::TimedOut;
        info.resume_payload = Some(timeout_payload());
        self.store.store_pause(info).await?;

        if let Some((_, sender)) = self.waiters.remove(token) {
            let _ = sender.send(ResumeOutcome::TimedOut(timeout_payload()));
        }
        Ok(())
    }

    /// Deliver `payload` to the run waiting on `token`. Fails with
    /// `TokenInvalid`/`TokenExpired` if the token is unknown, already
    /// resumed, or already timed out; tokens are one-shot.
    #[instrument(skip(self, payload))]
    pub async fn resume(&self, token: &str, payload: serde_json::Value) -> Result<(), PauseError> {
        let mut info = self
            .store
            .load_pause(token)
            .await
            .map_err(|_| PauseError::TokenInvalid(token.to_string()))?;

        match info.status {
            PauseStatus::Waiting => {}
            PauseStatus::Resumed | PauseStatus::TimedOut | PauseStatus::Cancelled => {
                return Err(PauseError::TokenExpired(token.to_string()));
            }
        }

        info.status = PauseStatus::Resumed;
        info.resume_payload = Some(payload.clone());
        self.store.store_pause(info).await?;

        match self.waiters.remove(token) {
            Some((_, sender)) => {
                let _ = sender.send(ResumeOutcome::Resumed(payload));
                Ok(())
            }
            None => Err(PauseError::TokenExpired(token.to_string())),
        }
    }

    pub async fn list_paused(&self) -> Result<Vec<PauseInfo>, PauseError> {
        Ok(self.store.list_pauses().await?)
    }

    /// Resolve every still-waiting pause belonging to `run_id` as
    /// cancelled, so the interpreter tasks suspended on them unblock
    /// instead of waiting out their timeout (or forever, if unset).
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), PauseError> {
        for info in self.store.list_pauses().await? {
            if info.run_id != run_id || info.status != PauseStatus::Waiting {
                continue;
            }

            let mut info = info;
            info.status = PauseStatus::Cancelled;
            self.store.store_pause(info.clone()).await?;

            if let Some((_, sender)) = self.waiters.remove(&info.token) {
                let _ = sender.send(ResumeOutcome::Cancelled);
            }
        }
        Ok(())
    }
}
