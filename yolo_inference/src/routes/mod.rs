mod health;
mod infer;
mod metrics;
mod ws_infer;

use crate::{
    error::InferenceError,
    inference_service::{InferencePipeline, InferenceResult},
    params::InferenceParams,
    server::SharedState,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/infer", post(infer::infer))
        .route("/ws/infer", get(ws_infer::ws_infer))
}

/// Runs the pipeline on the blocking pool so a slow model call never stalls the async workers.
pub(crate) async fn run_pipeline(
    pipeline: InferencePipeline,
    image_bytes: Bytes,
    params: InferenceParams,
) -> Result<InferenceResult, InferenceError> {
    tokio::task::spawn_blocking(move || pipeline.run(&image_bytes, params))
        .await
        .map_err(|e| InferenceError::WorkerFailed(e.to_string()))?
}

/// Records the outcome of one inference on the shared metrics and the log.
pub(crate) fn observe(
    state: &SharedState,
    route: &str,
    result: &Result<InferenceResult, InferenceError>,
) {
    match result {
        Ok(result) => {
            state
                .metrics
                .record_inference_duration(result.inference_time_ms, route);
        }
        Err(err) => {
            if err.is_client_error() {
                tracing::warn!("Rejected request on {}: {}", route, err);
            } else {
                tracing::error!("Inference failed on {}: {}", route, err);
            }
            state.metrics.record_error(err.kind(), route);
        }
    }
}

impl IntoResponse for InferenceError {
    fn into_response(self) -> Response {
        let status = if matches!(self, InferenceError::PayloadTooLarge) {
            StatusCode::PAYLOAD_TOO_LARGE
        } else if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if self.is_retryable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
