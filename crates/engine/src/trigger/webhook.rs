//! Thin `axum::Router` builder over [`super::TriggerIngest`]'s webhook
//! wire surface. The HTTP server itself is supplied by the embedding
//! application — this is the adapter it mounts, not a standalone binary.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde_json::json;

use super::{TriggerError, TriggerIngest, WebhookOutcome};
use crate::model::RunId;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whatever can turn a normalized [`super::Trigger`] into a run. Implemented
/// by `Engine` — kept as a trait so this module doesn't depend on the
/// top-level engine type.
pub trait RunTriggerer: Send + Sync + 'static {
    fn trigger_webhook(&self, trigger: super::Trigger) -> BoxFuture<'_, Result<RunId, String>>;
}

#[derive(Clone)]
struct WebhookState {
    ingest: Arc<TriggerIngest>,
    triggerer: Arc<dyn RunTriggerer>,
}

/// Build a router that accepts any method/path and dispatches against
/// whatever webhook routes are registered on `ingest`.
pub fn router(ingest: Arc<TriggerIngest>, triggerer: Arc<dyn RunTriggerer>) -> Router {
    let state = WebhookState { ingest, triggerer };
    Router::new().fallback(handle).with_state(state)
}

async fn handle(
    State(state): State<WebhookState>,
    method: axum::http::Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();

    let body_value = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(v) => v,
        Err(_) if body.is_empty() => json!({}),
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": format!("invalid JSON body: {err}"), "details": null})),
            )
                .into_response()
        }
    };

    match state
        .ingest
        .ingest_webhook(method.as_str(), uri.path(), header_map, body_value)
    {
        Ok(WebhookOutcome::ConditionNotMet) => {
            (StatusCode::OK, Json(json!({"success": true, "conditionMet": false}))).into_response()
        }
        Ok(WebhookOutcome::Trigger(trigger)) => match state.triggerer.trigger_webhook(trigger).await {
            Ok(run_id) => (
                StatusCode::OK,
                Json(json!({"success": true, "runId": run_id, "timestamp": Utc::now()})),
            )
                .into_response(),
            Err(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": error, "timestamp": Utc::now()})),
            )
                .into_response(),
        },
        Err(TriggerError::RouteNotFound { .. }) => StatusCode::NOT_FOUND.into_response(),
        Err(TriggerError::MissingHeader(header)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": format!("missing required header: {header}"), "details": null})),
        )
            .into_response(),
        Err(TriggerError::Validation { error, details }) => {
            (StatusCode::BAD_REQUEST, Json(json!({"success": false, "error": error, "details": details}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::WebhookRoute;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct AlwaysSucceeds;
    impl RunTriggerer for AlwaysSucceeds {
        fn trigger_webhook(&self, _trigger: super::super::Trigger) -> BoxFuture<'_, Result<RunId, String>> {
            Box::pin(async { Ok(uuid::Uuid::now_v7()) })
        }
    }

    #[tokio::test]
    async fn unregistered_path_returns_404() {
        let ingest = Arc::new(TriggerIngest::new());
        let app = router(ingest, Arc::new(AlwaysSucceeds));
        let response = app
            .oneshot(Request::builder().uri("/nope").method("POST").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn registered_path_triggers_run() {
        let ingest = Arc::new(TriggerIngest::new());
        ingest.register_webhook(WebhookRoute::new("wf", "POST", "/hook"));
        let app = router(ingest, Arc::new(AlwaysSucceeds));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/hook")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
