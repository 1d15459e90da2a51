//! Trigger Ingest: normalizes manual/webhook/schedule/event inputs into a
//! uniform [`Trigger`] handed to the Run Coordinator.
//!
//! The webhook surface's 2xx/4xx/5xx error mapping follows the
//! `IntoResponse` pattern used for HTTP error surfaces elsewhere in this
//! crate's style. This module is only the normalization layer plus a
//! thin, optional `axum::Router` builder (`trigger::webhook::router`)
//! callers may mount; it is not a standalone server binary, and does not
//! ship its own cron parser or framework adapters.

pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use chrono::{DateTime, Utc};
use std::fmt;

/// The normalized, uniform call into the Run Coordinator, regardless of
/// which external surface produced it.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub workflow_id: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub kind: TriggerKind,
}

#[derive(Debug, Clone)]
pub enum TriggerKind {
    Manual,
    Webhook { method: String, path: String },
    Event { name: String },
    Schedule { cron_expression: String, scheduled_at: DateTime<Utc> },
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("validation failed: {error}")]
    Validation { error: String, details: Option<Value> },
    #[error("required header missing: {0}")]
    MissingHeader(String),
    #[error("no webhook registered for {method} {path}")]
    RouteNotFound { method: String, path: String },
}

/// A registered webhook route: the configuration the Trigger Ingest
/// surface holds for one workflow's webhook trigger. Schema/predicate
/// validation hooks are opaque callables by design — named closures, not
/// a persisted value.
pub struct WebhookRoute {
    pub workflow_id: String,
    pub method: String,
    pub path: String,
    pub required_headers: Vec<String>,
    /// Minimal "required top-level keys present" schema check. A full JSON
    /// Schema validator is unnecessary here; this crate only needs to
    /// reject obviously malformed bodies with a 400 and a `details` body.
    pub required_fields: Vec<String>,
    pub predicate: Option<Arc<dyn Fn(&Value) -> bool + Send + Sync>>,
    pub raw_body: bool,
}

impl fmt::Debug for WebhookRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookRoute")
            .field("workflow_id", &self.workflow_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("required_headers", &self.required_headers)
            .field("required_fields", &self.required_fields)
            .field("raw_body", &self.raw_body)
            .finish()
    }
}

impl WebhookRoute {
    pub fn new(workflow_id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            method: method.into().to_uppercase(),
            path: path.into(),
            required_headers: Vec::new(),
            required_fields: Vec::new(),
            predicate: None,
            raw_body: false,
        }
    }

    pub fn with_required_headers(mut self, headers: Vec<String>) -> Self {
        self.required_headers = headers;
        self
    }

    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

/// Outcome of validating an inbound webhook call against its registered
/// route, before a run is ever created.
pub enum WebhookOutcome {
    /// Validation passed and the predicate (if any) matched: create a run.
    Trigger(Trigger),
    /// Validation passed but the predicate returned false: responds
    /// `200 {success:true, conditionMet:false}`, no run created.
    ConditionNotMet,
}

/// Normalizes manual/webhook/event/schedule inputs into [`Trigger`]s.
#[derive(Clone, Default)]
pub struct TriggerIngest {
    routes: Arc<DashMap<(String, String), WebhookRoute>>,
}

impl TriggerIngest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_webhook(&self, route: WebhookRoute) {
        self.routes.insert((route.method.clone(), route.path.clone()), route);
    }

    pub fn manual(workflow_id: impl Into<String>, payload: Value) -> Trigger {
        Trigger {
            workflow_id: workflow_id.into(),
            payload,
            headers: HashMap::new(),
            kind: TriggerKind::Manual,
        }
    }

    pub fn event(workflow_id: impl Into<String>, name: impl Into<String>, payload: Value) -> Trigger {
        let name = name.into();
        Trigger {
            workflow_id: workflow_id.into(),
            payload,
            headers: HashMap::new(),
            kind: TriggerKind::Event { name },
        }
    }

    pub fn schedule(
        workflow_id: impl Into<String>,
        cron_expression: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Trigger {
        let cron_expression = cron_expression.into();
        let workflow_id = workflow_id.into();
        Trigger {
            payload: serde_json::json!({
                "trigger_type": "schedule",
                "cron_expression": cron_expression,
                "scheduled_at": scheduled_at,
                "workflow_id": workflow_id,
            }),
            headers: HashMap::new(),
            kind: TriggerKind::Schedule { cron_expression, scheduled_at },
            workflow_id,
        }
    }

    /// Normalize and validate an inbound webhook call.
    pub fn ingest_webhook(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Value,
    ) -> Result<WebhookOutcome, TriggerError> {
        let method = method.to_uppercase();
        let route = self
            .routes
            .get(&(method.clone(), path.to_string()))
            .ok_or_else(|| TriggerError::RouteNotFound { method: method.clone(), path: path.to_string() })?;

        for required in &route.required_headers {
            if !headers.contains_key(required.to_lowercase().as_str())
                && !headers.keys().any(|k| k.eq_ignore_ascii_case(required))
            {
                return Err(TriggerError::MissingHeader(required.clone()));
            }
        }

        if !route.required_fields.is_empty() {
            let missing: Vec<String> = route
                .required_fields
                .iter()
                .filter(|field| body.get(field.as_str()).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(TriggerError::Validation {
                    error: "request body failed schema validation".to_string(),
                    details: Some(serde_json::json!({ "missing_fields": missing })),
                });
            }
        }

        if let Some(predicate) = &route.predicate {
            if !predicate(&body) {
                return Ok(WebhookOutcome::ConditionNotMet);
            }
        }

        Ok(WebhookOutcome::Trigger(Trigger {
            workflow_id: route.workflow_id.clone(),
            payload: body,
            headers,
            kind: TriggerKind::Webhook { method, path: path.to_string() },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_header_rejects() {
        let ingest = TriggerIngest::new();
        ingest.register_webhook(
            WebhookRoute::new("wf", "POST", "/hook").with_required_headers(vec!["x-api-key".into()]),
        );
        let err = ingest
            .ingest_webhook("POST", "/hook", HashMap::new(), json!({}))
            .unwrap_err();
        assert!(matches!(err, TriggerError::MissingHeader(_)));
    }

    #[test]
    fn missing_required_field_rejects_with_details() {
        let ingest = TriggerIngest::new();
        ingest.register_webhook(WebhookRoute::new("wf", "POST", "/hook").with_required_fields(vec!["amount".into()]));
        let err = ingest
            .ingest_webhook("POST", "/hook", HashMap::new(), json!({}))
            .unwrap_err();
        assert!(matches!(err, TriggerError::Validation { .. }));
    }

    #[test]
    fn predicate_false_yields_condition_not_met() {
        let ingest = TriggerIngest::new();
        ingest.register_webhook(
            WebhookRoute::new("wf", "POST", "/hook").with_predicate(|v| v["amount"].as_i64().unwrap_or(0) > 100),
        );
        let outcome = ingest
            .ingest_webhook("POST", "/hook", HashMap::new(), json!({"amount": 10}))
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::ConditionNotMet));
    }

    #[test]
    fn valid_request_produces_trigger() {
        let ingest = TriggerIngest::new();
        ingest.register_webhook(WebhookRoute::new("wf", "POST", "/hook"));
        let outcome = ingest
            .ingest_webhook("POST", "/hook", HashMap::new(), json!({"amount": 500}))
            .unwrap();
        match outcome {
            WebhookOutcome::Trigger(t) => assert_eq!(t.workflow_id, "wf"),
            _ => panic!("expected Trigger"),
        }
    }

    #[test]
    fn unregistered_route_is_not_found() {
        let ingest = TriggerIngest::new();
        let err = ingest.ingest_webhook("POST", "/missing", HashMap::new(), json!({})).unwrap_err();
        assert!(matches!(err, TriggerError::RouteNotFound { .. }));
    }
}
