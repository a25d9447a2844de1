use serde_json::Value;

pub const DEFAULT_CONFIDENCE: f32 = 0.25;
pub const DEFAULT_IOU: f32 = 0.45;
pub const DEFAULT_IMAGE_SIZE: u32 = 640;
pub const MIN_IMAGE_SIZE: i64 = 32;
pub const MAX_IMAGE_SIZE: i64 = 2048;

/// Sanitized knobs handed to the model. Always within bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub confidence: f32,
    pub iou: f32,
    pub image_size: u32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            iou: DEFAULT_IOU,
            image_size: DEFAULT_IMAGE_SIZE,
        }
    }
}

impl InferenceParams {
    /// Builds params from loosely typed inputs. Missing or malformed values fall back to the
    /// defaults and out-of-range values are clamped, this never fails.
    pub fn sanitize(
        confidence: Option<&Value>,
        iou: Option<&Value>,
        image_size: Option<&Value>,
    ) -> Self {
        Self {
            confidence: parse_threshold(confidence, DEFAULT_CONFIDENCE, 0.0, 1.0),
            iou: parse_threshold(iou, DEFAULT_IOU, 0.0, 1.0),
            image_size: parse_image_size(image_size, DEFAULT_IMAGE_SIZE),
        }
    }

    /// Re-applies the bounds to already typed values.
    pub fn clamped(self) -> Self {
        Self {
            confidence: clamp_threshold(self.confidence, 0.0, 1.0, DEFAULT_CONFIDENCE),
            iou: clamp_threshold(self.iou, 0.0, 1.0, DEFAULT_IOU),
            image_size: (self.image_size as i64).clamp(MIN_IMAGE_SIZE, MAX_IMAGE_SIZE) as u32,
        }
    }
}

fn clamp_threshold(value: f32, min_value: f32, max_value: f32, fallback: f32) -> f32 {
    if !value.is_finite() {
        return fallback;
    }
    value.clamp(min_value, max_value)
}

pub fn parse_threshold(value: Option<&Value>, fallback: f32, min_value: f32, max_value: f32) -> f32 {
    let numeric_value = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };

    match numeric_value {
        Some(v) if v.is_finite() => clamp_threshold(v as f32, min_value, max_value, fallback),
        _ => fallback,
    }
}

pub fn parse_image_size(value: Option<&Value>, fallback: u32) -> u32 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| v.trunc() as i64)
        }),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    };

    match parsed {
        Some(size) => size.clamp(MIN_IMAGE_SIZE, MAX_IMAGE_SIZE) as u32,
        None => fallback,
    }
}
