//! Event Bus: in-process pub/sub with bounded history.
//!
//! A bounded ring-buffer history plus a one-shot waiter table keyed by
//! event name, built on the same `oneshot`/`DashMap` idioms used
//! elsewhere in this crate for background-task signalling.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{instrument, warn};

use crate::model::RunId;

const HISTORY_CAP: usize = 1000;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("event wait timed out")]
    Timeout,
    #[error("event bus is shutting down")]
    Closed,
}

/// One published fact, appended to the bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// In-process publish/subscribe bus. `publish` is synchronous and never
/// blocks on listeners: per-listener publish errors (surfaced by whatever
/// invokes a listening workflow) are logged but never abort sibling
/// listeners or the publish call itself.
#[derive(Clone, Default)]
pub struct EventBus {
    history: std::sync::Arc<Mutex<VecDeque<EventRecord>>>,
    waiters: std::sync::Arc<DashMap<String, Vec<(RunId, oneshot::Sender<Value>)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to history and resolve every waiter registered for `name`,
    /// regardless of which run registered it.
    #[instrument(skip(self, payload))]
    pub fn publish(&self, name: impl Into<String>, payload: Value) -> EventRecord {
        let name = name.into();
        let record = EventRecord {
            name: name.clone(),
            payload: payload.clone(),
            timestamp: Utc::now(),
        };

        {
            let mut history = self.history.lock();
            if history.len() >= HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        if let Some((_, waiters)) = self.waiters.remove(&name) {
            for (run_id, sender) in waiters {
                if sender.send(payload.clone()).is_err() {
                    warn!(%run_id, event = %name, "event waiter dropped before delivery");
                }
            }
        }

        record
    }

    pub fn history(&self) -> Vec<EventRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Register a one-shot waiter for `name` on behalf of `run_id` and
    /// resolve on the next matching publish, or after `timeout` elapses.
    /// Called from the Control-Flow Interpreter's `WaitForEvent` handling.
    pub async fn wait_for_event(
        &self,
        run_id: RunId,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, EventBusError> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry(name.to_string())
            .or_default()
            .push((run_id, tx));

        let result = match timeout {
            Some(d) => tokio::time::timeout(d, rx).await.map_err(|_| EventBusError::Timeout)?,
            None => Ok(rx.await),
        };

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(EventBusError::Closed),
            Err(timeout_err) => Err(timeout_err),
        }
    }
}
