//! Prometheus export of the engine's metrics.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::server::AppState;

/// Installs the global Prometheus recorder and describes the ingest metrics.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    landfall_ingest::metrics::describe_metrics();
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// GET /metrics - Prometheus text exposition.
pub async fn serve_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.as_ref() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}
