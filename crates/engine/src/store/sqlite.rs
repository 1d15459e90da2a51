//! SQLite implementation of [`Store`].
//!
//! Connection pool held by value, one `sqlx::query` per operation,
//! `#[instrument]` on each entry point, a transaction plus a sequence
//! check for optimistic concurrency on the event log. SQLite rather than
//! a server-backed database because the engine is meant to be embeddable
//! without an external database process; SQLite's own file locking
//! serializes writers per connection/transaction, which is enough to
//! stand in for a row-level `FOR UPDATE` here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, instrument};

use crate::model::{PauseInfo, Run, RunId, RunStatus, ScheduleEntry, StepRecord, Workflow};

use super::{RunEvent, RunEventPayload, Store, StoreError};

/// Schema applied by [`SqliteStore::new`]. Kept inline (rather than a
/// `migrations/` directory + `sqlx::migrate!`) to keep the crate
/// embeddable without a build-time database connection.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    definition TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    status TEXT NOT NULL,
    run_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_events (
    run_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (run_id, sequence)
);

CREATE TABLE IF NOT EXISTS step_records (
    run_id TEXT NOT NULL,
    step_name TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    record_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pauses (
    token TEXT PRIMARY KEY,
    pause_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    workflow_id TEXT PRIMARY KEY,
    cron_expression TEXT NOT NULL,
    last_fired TEXT,
    next_fire TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at TEXT
);
"#;

/// SQLite-backed implementation of [`Store`]. Designed for embedding: a
/// single file (or `:memory:`) database, no external server.
///
/// # Example
///
/// ```ignore
/// use workflow_engine::store::SqliteStore;
/// use sqlx::sqlite::SqlitePoolOptions;
///
/// let pool = SqlitePoolOptions::new().connect("sqlite://engine.db").await?;
/// let store = SqliteStore::new(pool).await?;
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, workflow))]
    async fn register_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        if let Some(row) = sqlx::query("SELECT definition FROM workflows WHERE id = ?1")
            .bind(&workflow.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
        {
            let definition: String = row.get("definition");
            let existing: Workflow =
                serde_json::from_str(&definition).map_err(|e| StoreError::Serialization(e.to_string()))?;
            if !existing.semantically_equal(&workflow) {
                return Err(StoreError::WorkflowConflict(workflow.id));
            }
            return Ok(());
        }

        let definition =
            serde_json::to_string(&workflow).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO workflows (id, definition) VALUES (?1, ?2)")
            .bind(&workflow.id)
            .bind(definition)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to register workflow: {e}");
                StoreError::Database(e.to_string())
            })?;
        debug!(workflow_id = %workflow.id, "registered workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        let definition: String = row.get("definition");
        serde_json::from_str(&definition).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query("SELECT definition FROM workflows")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let definition: String = row.get("definition");
                serde_json::from_str(&definition).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self, run))]
    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        let run_json = serde_json::to_string(&run).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO runs (id, workflow_id, status, run_json) VALUES (?1, ?2, ?3, ?4)")
            .bind(run.id.to_string())
            .bind(&run.workflow_id)
            .bind(status_name(run.status))
            .bind(run_json)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to create run: {e}");
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        let row = sqlx::query("SELECT run_json FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::RunNotFound(run_id))?;
        let run_json: String = row.get("run_json");
        serde_json::from_str(&run_json).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    #[instrument(skip(self, run))]
    async fn update_run(&self, run: Run) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT run_json FROM runs WHERE id = ?1")
            .bind(run.id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::RunNotFound(run.id))?;
        let existing_json: String = row.get("run_json");
        let existing: Run =
            serde_json::from_str(&existing_json).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if existing.status != run.status && !existing.status.can_transition_to(run.status) {
            return Err(StoreError::IllegalTransition {
                run_id: run.id,
                from: existing.status,
                to: run.status,
            });
        }

        let run_json = serde_json::to_string(&run).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query("UPDATE runs SET status = ?1, run_json = ?2 WHERE id = ?3")
            .bind(status_name(run.status))
            .bind(run_json)
            .bind(run.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run.id));
        }
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn append_run_event(
        &self,
        run_id: RunId,
        payload: RunEventPayload,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT COALESCE(MAX(sequence) + 1, 0) as next_seq FROM run_events WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let sequence: i64 = row.get("next_seq");

        let payload_json =
            serde_json::to_string(&payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO run_events (run_id, sequence, recorded_at, payload) VALUES (?1, ?2, ?3, ?4)")
            .bind(run_id.to_string())
            .bind(sequence)
            .bind(Utc::now().to_rfc3339())
            .bind(payload_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        debug!(%run_id, sequence, "appended run event");
        Ok(sequence)
    }

    async fn load_run_events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        let rows = sqlx::query("SELECT sequence, recorded_at, payload FROM run_events WHERE run_id = ?1 ORDER BY sequence ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let sequence: i64 = row.get("sequence");
                let recorded_at: String = row.get("recorded_at");
                let payload_json: String = row.get("payload");
                Ok(RunEvent {
                    run_id,
                    sequence,
                    recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?
                        .with_timezone(&Utc),
                    payload: serde_json::from_str(&payload_json)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn append_step_record(&self, record: StepRecord) -> Result<(), StoreError> {
        let record_json =
            serde_json::to_string(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO step_records (run_id, step_name, attempts, record_json) VALUES (?1, ?2, ?3, ?4)")
            .bind(record.run_id.to_string())
            .bind(&record.step_name)
            .bind(record.attempts as i64)
            .bind(record_json)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_step_records(&self, run_id: RunId) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query("SELECT record_json FROM step_records WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let record_json: String = row.get("record_json");
                serde_json::from_str(&record_json).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn store_pause(&self, pause: PauseInfo) -> Result<(), StoreError> {
        let pause_json =
            serde_json::to_string(&pause).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO pauses (token, pause_json) VALUES (?1, ?2) ON CONFLICT(token) DO UPDATE SET pause_json = excluded.pause_json")
            .bind(&pause.token)
            .bind(pause_json)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn load_pause(&self, token: &str) -> Result<PauseInfo, StoreError> {
        let row = sqlx::query("SELECT pause_json FROM pauses WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::PauseNotFound(token.to_string()))?;
        let pause_json: String = row.get("pause_json");
        serde_json::from_str(&pause_json).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn delete_pause(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pauses WHERE token = ?1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_pauses(&self) -> Result<Vec<PauseInfo>, StoreError> {
        let rows = sqlx::query("SELECT pause_json FROM pauses")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let pause_json: String = row.get("pause_json");
                serde_json::from_str(&pause_json).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO schedules (workflow_id, cron_expression, last_fired, next_fire) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(workflow_id) DO UPDATE SET cron_expression = excluded.cron_expression, \
             last_fired = excluded.last_fired, next_fire = excluded.next_fire",
        )
        .bind(&entry.workflow_id)
        .bind(&entry.cron_expression)
        .bind(entry.last_fired.map(|t| t.to_rfc3339()))
        .bind(entry.next_fire.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError> {
        let rows = sqlx::query("SELECT workflow_id, cron_expression, last_fired, next_fire FROM schedules WHERE next_fire <= ?1")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let last_fired: Option<String> = row.get("last_fired");
                let next_fire: String = row.get("next_fire");
                Ok(ScheduleEntry {
                    workflow_id: row.get("workflow_id"),
                    cron_expression: row.get("cron_expression"),
                    last_fired: last_fired
                        .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                        .transpose()
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    next_fire: DateTime::parse_from_rfc3339(&next_fire)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    async fn advance_schedule(
        &self,
        workflow_id: &str,
        fired_at: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE schedules SET last_fired = ?1, next_fire = ?2 WHERE workflow_id = ?3")
            .bind(fired_at.to_rfc3339())
            .bind(next_fire.to_rfc3339())
            .bind(workflow_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id.to_string()));
        }
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query("SELECT value, expires_at FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        let expires_at: Option<String> = row.get("expires_at");
        if let Some(expires_at) = expires_at {
            let expires_at = DateTime::parse_from_rfc3339(&expires_at)
                .map_err(|e| StoreError::Serialization(e.to_string()))?
                .with_timezone(&Utc);
            if expires_at <= Utc::now() {
                return Ok(None);
            }
        }
        let value: String = row.get("value");
        Ok(Some(
            serde_json::from_str(&value).map_err(|e| StoreError::Serialization(e.to_string()))?,
        ))
    }

    async fn kv_set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), StoreError> {
        let value_json = serde_json::to_string(&value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let expires_at = ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| (Utc::now() + d).to_rfc3339());
        sqlx::query("INSERT INTO kv_store (key, value, expires_at) VALUES (?1, ?2, ?3) ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at")
            .bind(key)
            .bind(value_json)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn kv_incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let current: i64 = match row {
            Some(row) => {
                let value: String = row.get("value");
                serde_json::from_str(&value).unwrap_or(0)
            }
            None => 0,
        };
        let next = current + delta;
        sqlx::query("INSERT INTO kv_store (key, value, expires_at) VALUES (?1, ?2, NULL) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(next.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(next)
    }

    async fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn kv_cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?1")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

fn status_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Paused => "paused",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn run_round_trips_through_sqlite() {
        let store = test_store().await;
        let run = Run::new("wf-1", json!({"a": 1}));
        let id = run.id;
        store.create_run(run).await.unwrap();
        let loaded = store.get_run(id).await.unwrap();
        assert_eq!(loaded.workflow_id, "wf-1");
    }

    #[tokio::test]
    async fn workflow_registration_is_idempotent() {
        let store = test_store().await;
        let workflow = Workflow::new("wf-1", "Example");
        store.register_workflow(workflow.clone()).await.unwrap();
        store.register_workflow(workflow).await.unwrap();
        assert_eq!(store.list_workflows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kv_round_trips_and_expires() {
        let store = test_store().await;
        store.kv_set("k", json!("v"), None).await.unwrap();
        assert_eq!(store.kv_get("k").await.unwrap(), Some(json!("v")));
        store
            .kv_set("short", json!(1), Some(std::time::Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.kv_get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn schedules_become_due_and_advance() {
        let store = test_store().await;
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
        store
            .advance_schedule("wf-cron", Utc::now(), Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        let due = store.list_due_schedules(Utc::now()).await.unwrap();
        assert!(due.is_empty());
    }
}
