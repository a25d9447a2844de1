use crate::server::SharedState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
    model_loaded: bool,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let model_loaded = state.pipeline.runtime().is_loaded();
    let (code, status) = if model_loaded {
        (StatusCode::OK, "Available")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Unavailable")
    };

    (
        code,
        Json(Status {
            status: status.into(),
            model_loaded,
        }),
    )
}
