use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Invalid image payload.")]
    InvalidImage,
    #[error("{0}")]
    InvalidEncoding(String),
    #[error("Empty image payload.")]
    EmptyPayload,
    #[error("Image payload too large.")]
    PayloadTooLarge,
    #[error("Model is not loaded.")]
    ModelNotLoaded,
    #[error("YOLO model not found at: {}", .0.display())]
    ModelArtifactMissing(PathBuf),
    #[error("{0} is not a supported device. Use `cpu`, `cuda`, `cuda:<n>` or a GPU index.")]
    InvalidDevice(String),
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Model inference failed: {0}")]
    Model(String),
    #[error("Inference worker failed: {0}")]
    WorkerFailed(String),
}

impl InferenceError {
    /// Errors caused by the request payload itself. Retrying the same input will not help.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            InferenceError::InvalidImage
                | InferenceError::InvalidEncoding(_)
                | InferenceError::EmptyPayload
                | InferenceError::PayloadTooLarge
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, InferenceError::ModelNotLoaded)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::InvalidImage => "invalid_image",
            InferenceError::InvalidEncoding(_) => "invalid_encoding",
            InferenceError::EmptyPayload => "empty_payload",
            InferenceError::PayloadTooLarge => "payload_too_large",
            InferenceError::ModelNotLoaded => "model_not_loaded",
            InferenceError::ModelArtifactMissing(_) => "model_artifact_missing",
            InferenceError::InvalidDevice(_) => "invalid_device",
            InferenceError::ModelLoad(_) => "model_load",
            InferenceError::Model(_) => "model",
            InferenceError::WorkerFailed(_) => "worker_failed",
        }
    }
}
