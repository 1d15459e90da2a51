//! In-process `Store` implementation backed by `parking_lot::RwLock`s.
//!
//! One lock-guarded map per concern (runs, pauses, schedules, kv);
//! intended primarily for tests and single-process embedding where no
//! external database is warranted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::{PauseInfo, Run, RunId, ScheduleEntry, StepRecord, Workflow};

use super::{RunEvent, RunEventPayload, Store, StoreError};

struct RunState {
    run: Run,
    events: Vec<RunEvent>,
    step_records: Vec<StepRecord>,
}

struct KvEntry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory implementation of [`Store`].
///
/// This is primarily for testing and single-process embedding without a
/// persistence requirement across restarts. It provides the same
/// semantics as [`super::SqliteStore`].
///
/// # Example
///
/// ```
/// use workflow_engine::store::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    workflows: RwLock<HashMap<String, Workflow>>,
    runs: RwLock<HashMap<RunId, RunState>>,
    pauses: RwLock<HashMap<String, PauseInfo>>,
    schedules: RwLock<HashMap<String, ScheduleEntry>>,
    kv: RwLock<HashMap<String, KvEntry>>,
    run_sequence: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            pauses: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
            kv: RwLock::new(HashMap::new()),
            run_sequence: AtomicI64::new(0),
        }
    }

    /// Number of runs currently tracked (for tests/inspection).
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if let Some(existing) = workflows.get(&workflow.id) {
            if !existing.semantically_equal(&workflow) {
                return Err(StoreError::WorkflowConflict(workflow.id));
            }
            return Ok(());
        }
        workflows.insert(workflow.id.clone(), workflow);
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self.workflows.read().values().cloned().collect())
    }

    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        runs.insert(
            run.id,
            RunState {
                run,
                events: Vec::new(),
                step_records: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|state| state.run.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn update_run(&self, run: Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let state = runs.get_mut(&run.id).ok_or(StoreError::RunNotFound(run.id))?;
        if state.run.status != run.status && !state.run.status.can_transition_to(run.status) {
            return Err(StoreError::IllegalTransition {
                run_id: run.id,
                from: state.run.status,
                to: run.status,
            });
        }
        state.run = run;
        Ok(())
    }

    async fn append_run_event(
        &self,
        run_id: RunId,
        payload: RunEventPayload,
    ) -> Result<i64, StoreError> {
        let mut runs = self.runs.write();
        let state = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let sequence = self.run_sequence.fetch_add(1, Ordering::SeqCst);
        state.events.push(RunEvent {
            run_id,
            sequence,
            recorded_at: Utc::now(),
            payload,
        });
        Ok(sequence)
    }

    async fn load_run_events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|state| state.events.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn append_step_record(&self, record: StepRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let state = runs
            .get_mut(&record.run_id)
            .ok_or(StoreError::RunNotFound(record.run_id))?;
        state.step_records.push(record);
        Ok(())
    }

    async fn list_step_records(&self, run_id: RunId) -> Result<Vec<StepRecord>, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|state| state.step_records.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn store_pause(&self, pause: PauseInfo) -> Result<(), StoreError> {
        self.pauses.write().insert(pause.token.clone(), pause);
        Ok(())
    }

    async fn load_pause(&self, token: &str) -> Result<PauseInfo, StoreError> {
        self.pauses
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| StoreError::PauseNotFound(token.to_string()))
    }

    async fn delete_pause(&self, token: &str) -> Result<(), StoreError> {
        self.pauses.write().remove(token);
        Ok(())
    }

    async fn list_pauses(&self) -> Result<Vec<PauseInfo>, StoreError> {
        Ok(self.pauses.read().values().cloned().collect())
    }

    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<(), StoreError> {
        self.schedules.write().insert(entry.workflow_id.clone(), entry);
        Ok(())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError> {
        Ok(self
            .schedules
            .read()
            .values()
            .filter(|entry| entry.next_fire <= now)
            .cloned()
            .collect())
    }

    async fn advance_schedule(
        &self,
        workflow_id: &str,
        fired_at: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        let entry = schedules
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        entry.last_fired = Some(fired_at);
        entry.next_fire = next_fire;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let kv = self.kv.read();
        match kv.get(key) {
            Some(entry) if entry.expires_at.map(|exp| exp > Utc::now()).unwrap_or(true) => {
                Ok(Some(entry.value.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn kv_set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| Utc::now() + d);
        self.kv.write().insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }

    async fn kv_incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut kv = self.kv.write();
        let entry = kv.entry(key.to_string()).or_insert(KvEntry {
            value: serde_json::json!(0),
            expires_at: None,
        });
        let current = entry.value.as_i64().unwrap_or(0);
        let next = current + delta;
        entry.value = serde_json::json!(next);
        Ok(next)
    }

    async fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        self.kv.write().remove(key);
        Ok(())
    }

    async fn kv_cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut kv = self.kv.write();
        let before = kv.len();
        kv.retain(|_, entry| entry.expires_at.map(|exp| exp > now).unwrap_or(true));
        Ok((before - kv.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PauseStatus, RunStatus};
    use serde_json::json;

    #[tokio::test]
    async fn create_and_get_run_round_trips() {
        let store = MemoryStore::new();
        let run = Run::new("wf-1", json!({"a": 1}));
        let id = run.id;
        store.create_run(run).await.unwrap();
        let loaded = store.get_run(id).await.unwrap();
        assert_eq!(loaded.workflow_id, "wf-1");
        assert_eq!(loaded.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get_run(uuid::Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn run_events_append_with_increasing_sequence() {
        let store = MemoryStore::new();
        let run = Run::new("wf-1", json!({}));
        let id = run.id;
        store.create_run(run).await.unwrap();
        let seq1 = store
            .append_run_event(id, RunEventPayload::StepStarted { step_name: "a".into() })
            .await
            .unwrap();
        let seq2 = store
            .append_run_event(id, RunEventPayload::RunCompleted)
            .await
            .unwrap();
        assert!(seq2 > seq1);
        assert_eq!(store.load_run_events(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pause_lifecycle() {
        let store = MemoryStore::new();
        let pause = PauseInfo {
            token: "tok-1".into(),
            run_id: uuid::Uuid::now_v7(),
            workflow_id: "wf-1".into(),
            step_name: "approve".into(),
            description: "needs approval".into(),
            created_at: Utc::now(),
            expires_at: None,
            status: PauseStatus::Waiting,
            resume_payload: None,
            last_step_output: None,
        };
        store.store_pause(pause).await.unwrap();
        assert!(store.load_pause("tok-1").await.is_ok());
        store.delete_pause("tok-1").await.unwrap();
        assert!(store.load_pause("tok-1").await.is_err());
    }

    #[tokio::test]
    async fn kv_incr_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.kv_incr("counter", 1).await.unwrap(), 1);
        assert_eq!(store.kv_incr("counter", 4).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn kv_expired_entries_are_invisible_and_cleaned_up() {
        let store = MemoryStore::new();
        store
            .kv_set("k", json!("v"), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.kv_get("k").await.unwrap(), None);
        let removed = store.kv_cleanup_expired(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn due_schedules_are_filtered_by_next_fire() {
        let store = MemoryStore::new();
        store
            .upsert_schedule(ScheduleEntry {
                workflow_id: "wf-cron".into(),
                cron_expression: "* * * * *".into(),
                last_fired: None,
                next_fire: Utc::now() - chrono::Duration::seconds(1),
            })
            .await
            .unwrap();
        let due = store.list_due_schedules(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
    }
}
