use crate::{error::InferenceError, params::InferenceParams};
use image::RgbImage;
use std::fmt;

/// One box straight out of the model, in original image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub score: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Compute device a model is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(i32),
}

impl Device {
    pub fn parse(s: &str) -> Result<Self, InferenceError> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => {
                let index = other.strip_prefix("cuda:").unwrap_or(other);
                index
                    .parse::<i32>()
                    .ok()
                    .filter(|i| *i >= 0)
                    .map(Device::Cuda)
                    .ok_or_else(|| InferenceError::InvalidDevice(s.to_string()))
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

/// The opaque detector. Implementations are not required to be reentrant, callers serialize
/// access through `ModelRuntime`.
pub trait DetectionModel: Send + 'static {
    fn predict(
        &mut self,
        image: &RgbImage,
        params: &InferenceParams,
        device: Device,
    ) -> Result<Vec<RawDetection>, InferenceError>;
}
