use crate::{
    error::InferenceError,
    inference_service::InferenceResult,
    params::InferenceParams,
    routes::{observe, run_pipeline},
    server::SharedState,
};
use axum::{
    extract::{FromRequest, Multipart, Query, Request, State},
    http::{header, StatusCode},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

const ROUTE: &str = "/infer";
const FILE_FIELD: &str = "file";

/// Query knobs are taken as text and sanitized, so malformed values degrade to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct InferQuery {
    confidence: Option<String>,
    iou: Option<String>,
    imgsz: Option<String>,
}

impl InferQuery {
    fn params(self) -> InferenceParams {
        let confidence = self.confidence.map(Value::String);
        let iou = self.iou.map(Value::String);
        let imgsz = self.imgsz.map(Value::String);
        InferenceParams::sanitize(confidence.as_ref(), iou.as_ref(), imgsz.as_ref())
    }
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false)
}

/// Keeps the body limit visible to the caller as 413; other body failures are bad input.
fn body_error(status: StatusCode, context: &str, text: String) -> InferenceError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        InferenceError::PayloadTooLarge
    } else {
        InferenceError::InvalidEncoding(format!("{}: {}", context, text))
    }
}

/// Image bytes from the `file` form field of a multipart upload, or the raw body otherwise.
async fn read_image_payload(request: Request, state: &SharedState) -> Result<Bytes, InferenceError> {
    if !is_multipart(&request) {
        return Bytes::from_request(request, state)
            .await
            .map_err(|e| body_error(e.status(), "Invalid request body", e.body_text()));
    }

    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| body_error(e.status(), "Invalid multipart payload", e.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| body_error(e.status(), "Invalid multipart payload", e.body_text()))?
    {
        if field.name() == Some(FILE_FIELD) {
            return field
                .bytes()
                .await
                .map_err(|e| body_error(e.status(), "Failed to read uploaded file", e.body_text()));
        }
    }

    Ok(Bytes::new())
}

#[instrument(skip(state, query, request))]
pub async fn infer(
    State(state): State<SharedState>,
    Query(query): Query<InferQuery>,
    request: Request,
) -> Result<Json<InferenceResult>, InferenceError> {
    state.metrics.record_request(ROUTE);

    let result = match read_image_payload(request, &state).await {
        Ok(image_bytes) if image_bytes.is_empty() => Err(InferenceError::EmptyPayload),
        Ok(image_bytes) => run_pipeline(state.pipeline.clone(), image_bytes, query.params()).await,
        Err(err) => Err(err),
    };

    observe(&state, ROUTE, &result);
    result.map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::tests::png_bytes,
        inference_service::tests::{one_box_model, MockModel},
        params::DEFAULT_IMAGE_SIZE,
        routes::tests::{body_json, state_with, unloaded_state},
    };
    use axum::{body::Body, response::IntoResponse};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn raw_request(body: Vec<u8>) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/infer")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(body))
            .unwrap()
    }

    fn multipart_request(field: &str, bytes: &[u8]) -> Request {
        let boundary = "X-YOLO-BOUNDARY";
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"frame.png\"\r\nContent-Type: image/png\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        axum::http::Request::builder()
            .method("POST")
            .uri("/infer")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn call(state: SharedState, query: InferQuery, request: Request) -> axum::response::Response {
        infer(State(state), Query(query), request)
            .await
            .into_response()
    }

    #[tokio::test]
    async fn test_raw_body_with_default_params() {
        let response = call(
            state_with(one_box_model()),
            InferQuery::default(),
            raw_request(png_bytes(10, 10)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["predictions"],
            json!([{"class": "person", "score": 0.9, "bbox": [1.0, 1.0, 5.0, 5.0]}])
        );
        assert!(body["infer_ms"].as_f64().unwrap() >= 0.);
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let response = call(
            state_with(one_box_model()),
            InferQuery::default(),
            multipart_request("file", &png_bytes(10, 10)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["predictions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_payload_is_rejected_before_pipeline() {
        let model = one_box_model();
        let calls = model.calls.clone();
        let state = state_with(model);

        let response = call(state.clone(), InferQuery::default(), raw_request(Vec::new())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"detail": "Empty image payload."})
        );

        let response = call(
            state,
            InferQuery::default(),
            multipart_request("other", &png_bytes(10, 10)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_keeps_413() {
        let model = one_box_model();
        let calls = model.calls.clone();

        // larger than axum's default 2 MiB body limit
        let response = call(
            state_with(model),
            InferQuery::default(),
            raw_request(vec![0u8; 3 * 1024 * 1024]),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            body_json(response).await,
            json!({"detail": "Image payload too large."})
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_image() {
        let response = call(
            state_with(one_box_model()),
            InferQuery::default(),
            raw_request(b"not an image".to_vec()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"detail": "Invalid image payload."})
        );
    }

    #[tokio::test]
    async fn test_model_not_loaded() {
        let response = call(
            unloaded_state(),
            InferQuery::default(),
            raw_request(png_bytes(10, 10)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(response).await,
            json!({"detail": "Model is not loaded."})
        );
    }

    #[tokio::test]
    async fn test_query_params_are_sanitized() {
        let model = MockModel::default();
        let last_params = model.last_params.clone();
        let query = InferQuery {
            confidence: Some("5.0".into()),
            iou: Some("abc".into()),
            imgsz: None,
        };

        let response = call(state_with(model), query, raw_request(png_bytes(10, 10))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *last_params.lock(),
            Some(InferenceParams {
                confidence: 1.0,
                iou: 0.45,
                image_size: DEFAULT_IMAGE_SIZE,
            })
        );
    }
}
