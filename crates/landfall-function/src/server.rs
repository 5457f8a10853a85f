//! HTTP surface for notification pushes.
//!
//! - `POST /` - one storage notification (push envelope, bare message or
//!   object resource)
//! - `GET /health` - shallow liveness check
//! - `GET /metrics` - Prometheus text
//!
//! A notification that ends cleanly or with a recoverable error answers
//! `200`. Any other error answers `500` so the push subscription redelivers,
//! unless the server reports errors instead, in which case it answers `200`
//! after the error has been logged.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use landfall_ingest::{Dispatcher, Notification, Outcome};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    report_errors: bool,
    pub(crate) metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, report_errors: bool) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            report_errors,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(notify))
        .route("/health", get(health))
        .route("/metrics", get(crate::metrics::serve_metrics))
        .with_state(state)
}

/// Body of every `POST /` response.
#[derive(Debug, Serialize)]
struct NotifyResponse {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// POST / - Handle one notification.
async fn notify(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let result = match Notification::from_json(&body) {
        Ok(notification) => state.dispatcher.handle(&notification).await,
        Err(err) => {
            tracing::error!(error = %err, "rejected notification payload");
            Err(err)
        }
    };
    respond(result, state.report_errors)
}

fn respond(
    result: landfall_ingest::Result<Outcome>,
    report_errors: bool,
) -> (StatusCode, Json<NotifyResponse>) {
    match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(NotifyResponse {
                outcome: outcome.as_str(),
                error: None,
            }),
        ),
        Err(err) => {
            let status = if err.is_recoverable() || report_errors {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(NotifyResponse {
                    outcome: err.kind(),
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use landfall_core::{MemoryProvider, StorageBackend, WritePrecondition};
    use landfall_ingest::{IngestConfig, IngestContext};
    use landfall_ingest::warehouse::InMemoryWarehouse;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    fn push(key: &str) -> Value {
        json!({
            "message": {
                "attributes": {
                    "bucketId": "b",
                    "objectId": key,
                    "eventType": "OBJECT_FINALIZE"
                }
            },
            "subscription": "projects/p/subscriptions/landfall"
        })
    }

    async fn setup(report_errors: bool) -> (Router, Arc<InMemoryWarehouse>) {
        let provider = MemoryProvider::new();
        let bucket = provider.memory_bucket("b").expect("bucket");
        for (key, body) in [("d/t/00/part-0.csv", "id\n1\n"), ("d/t/00/_SUCCESS", "")] {
            bucket
                .put(key, Bytes::from(body), WritePrecondition::None)
                .await
                .expect("seed");
        }

        let warehouse = Arc::new(InMemoryWarehouse::new());
        let ctx = IngestContext::new(IngestConfig::default(), warehouse.clone()).expect("context");
        let dispatcher = Dispatcher::new(ctx, Arc::new(provider));
        (router(AppState::new(dispatcher, report_errors)), warehouse)
    }

    async fn post(app: Router, payload: &Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&body).expect("json"))
    }

    #[tokio::test]
    async fn success_marker_is_applied() {
        let (app, warehouse) = setup(false).await;
        let (status, body) = post(app, &push("d/t/00/_SUCCESS")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");
        assert_eq!(warehouse.submitted().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_answers_ok() {
        let (app, warehouse) = setup(false).await;
        let (status, _) = post(app.clone(), &push("d/t/00/_SUCCESS")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = post(app, &push("d/t/00/_SUCCESS")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "duplicate");
        assert_eq!(warehouse.submitted().len(), 1);
    }

    #[tokio::test]
    async fn reportable_error_answers_500_unless_reporting() {
        let (app, _) = setup(false).await;
        let (status, body) = post(app, &push("d/t/00/_BACKFILL")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["outcome"], "unexpected_trigger");

        let (app, _) = setup(true).await;
        let (status, body) = post(app, &json!({"hello": "world"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "unexpected_trigger");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn health_and_metrics_endpoints() {
        let (app, _) = setup(false).await;
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
