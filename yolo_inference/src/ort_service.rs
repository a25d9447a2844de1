use crate::{
    error::InferenceError,
    model_service::{DetectionModel, Device, RawDetection},
    params::InferenceParams,
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, ArrayView2, ArrayViewD, Axis, Ix2, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::path::Path;

const MAX_DETECTIONS: usize = 300;

fn intersection(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &RawDetection, box2: &RawDetection) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Picks CUDA when the provider reports itself usable, CPU otherwise.
pub fn probe_device() -> Device {
    match CUDAExecutionProvider::default().is_available() {
        Ok(true) => Device::Cuda(0),
        Ok(false) => Device::Cpu,
        Err(e) => {
            tracing::warn!("Could not probe CUDA availability, using cpu: {}", e);
            Device::Cpu
        }
    }
}

fn transform_image(image: &RgbImage, size: u32) -> Array<f32, Ix4> {
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);

    let mut input = Array::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Turns a `[4 + classes, candidates]` YOLO head output into boxes in original image space.
fn decode_candidates(
    output: ArrayView2<f32>,
    img_width: u32,
    img_height: u32,
    params: &InferenceParams,
) -> Vec<RawDetection> {
    let size = params.image_size as f32;
    let (width, height) = (img_width as f32, img_height as f32);
    let (sx, sy) = (width / size, height / size);
    let mut boxes = Vec::new();

    for candidate in output.axis_iter(Axis(1)) {
        let best = candidate
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });
        let Some((class_id, score)) = best else {
            continue;
        };

        if score <= params.confidence {
            continue;
        }

        let xc = candidate[0] * sx;
        let yc = candidate[1] * sy;
        let w = candidate[2] * sx;
        let h = candidate[3] * sy;

        boxes.push(RawDetection {
            class_id,
            score,
            x1: (xc - w / 2.).clamp(0., width),
            y1: (yc - h / 2.).clamp(0., height),
            x2: (xc + w / 2.).clamp(0., width),
            y2: (yc + h / 2.).clamp(0., height),
        });
    }

    non_max_suppression(boxes, params.iou)
}

/// Class-aware greedy NMS, highest score first.
fn non_max_suppression(mut boxes: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    boxes.sort_by(|box1, box2| box2.score.total_cmp(&box1.score));
    let mut result: Vec<RawDetection> = Vec::new();

    for candidate in boxes {
        if result.len() >= MAX_DETECTIONS {
            break;
        }
        let suppressed = result.iter().any(|kept| {
            kept.class_id == candidate.class_id && iou(kept, &candidate) > iou_threshold
        });
        if !suppressed {
            result.push(candidate);
        }
    }

    result
}

fn build_session(path: &Path, device: Device, intra_threads: usize) -> Result<Session, ort::Error> {
    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?;

    if let Device::Cuda(device_id) = device {
        builder = builder.with_execution_providers([CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()
            .error_on_failure()])?;
    }

    builder.commit_from_file(path)
}

/// YOLOv8-style detector exported to ONNX (`output0` of shape `[1, 4 + classes, candidates]`).
/// Models exported with a static input shape only accept their export `imgsz`.
pub struct OrtYoloModel {
    session: Session,
}

impl OrtYoloModel {
    pub fn load(path: &Path, device: Device, intra_threads: usize) -> Result<Self, InferenceError> {
        let session = build_session(path, device, intra_threads)
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;

        tracing::info!("Created ONNX session for {} on {}", path.display(), device);

        Ok(Self { session })
    }
}

impl DetectionModel for OrtYoloModel {
    fn predict(
        &mut self,
        image: &RgbImage,
        params: &InferenceParams,
        device: Device,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let input = transform_image(image, params.image_size);
        tracing::debug!(
            "Running session on {} with imgsz={} conf={} iou={}",
            device,
            params.image_size,
            params.confidence,
            params.iou
        );

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| InferenceError::Model(format!("failed to build tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| InferenceError::Model(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Model(format!("failed to extract tensor: {}", e)))?;

        let array = ArrayViewD::from_shape(shape.to_ixdyn(), data)
            .map_err(|e| InferenceError::Model(format!("invalid tensor shape: {}", e)))?;
        if array.ndim() != 3 {
            return Err(InferenceError::Model(format!(
                "unexpected output rank {}",
                array.ndim()
            )));
        }
        let output = array
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| InferenceError::Model(format!("invalid tensor shape: {}", e)))?;

        let (img_width, img_height) = image.dimensions();
        Ok(decode_candidates(output, img_width, img_height, params))
    }
}
