use crate::{
    codec,
    error::InferenceError,
    labels::ThresholdTable,
    params::InferenceParams,
    runtime::{ModelOutput, ModelRuntime},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};

/// Which filter decides whether a detection is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPolicy {
    /// The model's own `confidence` parameter is the only filter.
    #[default]
    ModelConfidence,
    /// Report application labels only: class ids without one are dropped, as are detections
    /// scoring below their label's minimum confidence.
    PerLabelThreshold,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub score: f64,
    #[serde(rename = "bbox")]
    pub bbox: [f64; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    #[serde(rename = "predictions")]
    pub detections: Vec<Detection>,
    #[serde(rename = "infer_ms")]
    pub inference_time_ms: f64,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Clone)]
pub struct InferencePipeline {
    runtime: Arc<ModelRuntime>,
    label_policy: LabelPolicy,
    thresholds: Arc<ThresholdTable>,
}

impl InferencePipeline {
    pub fn new(runtime: Arc<ModelRuntime>, label_policy: LabelPolicy, thresholds: ThresholdTable) -> Self {
        Self {
            runtime,
            label_policy,
            thresholds: Arc::new(thresholds),
        }
    }

    pub fn runtime(&self) -> &Arc<ModelRuntime> {
        &self.runtime
    }

    /// Decodes `image_bytes` and runs the model on it. Blocking: call it from a worker thread.
    pub fn run(
        &self,
        image_bytes: &[u8],
        params: InferenceParams,
    ) -> Result<InferenceResult, InferenceError> {
        if !self.runtime.is_loaded() {
            return Err(InferenceError::ModelNotLoaded);
        }

        let image = codec::decode(image_bytes)?;
        let params = params.clamped();

        let started_at = Instant::now();
        let output = self.runtime.infer_locked(&image, &params)?;
        let elapsed = started_at.elapsed();

        let detections = self.normalize(output);
        let inference_time_ms = round_to(elapsed.as_secs_f64() * 1000., 2);

        tracing::debug!(
            "Returning {} detections in {} ms",
            detections.len(),
            inference_time_ms
        );

        Ok(InferenceResult {
            detections,
            inference_time_ms,
        })
    }

    fn normalize(&self, output: ModelOutput) -> Vec<Detection> {
        output
            .detections
            .into_iter()
            .filter_map(|raw| {
                let class_label = match self.label_policy {
                    LabelPolicy::ModelConfidence => output.labels.display_label(raw.class_id),
                    LabelPolicy::PerLabelThreshold => {
                        let label = self.thresholds.label_for(raw.class_id)?;
                        if raw.score < self.thresholds.min_confidence(label) {
                            return None;
                        }
                        label.to_string()
                    }
                };

                let (x1, x2) = ordered(raw.x1, raw.x2);
                let (y1, y2) = ordered(raw.y1, raw.y2);

                Some(Detection {
                    class_label,
                    score: round_to((raw.score as f64).clamp(0., 1.), 4),
                    bbox: [
                        round_to(x1, 2),
                        round_to(y1, 2),
                        round_to(x2, 2),
                        round_to(y2, 2),
                    ],
                })
            })
            .collect()
    }
}

fn ordered(a: f32, b: f32) -> (f64, f64) {
    let (a, b) = (a.max(0.) as f64, b.max(0.) as f64);
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        codec::tests::png_bytes,
        labels::LabelTable,
        model_service::{DetectionModel, Device, RawDetection},
    };
    use image::RgbImage;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    /// Returns a fixed set of boxes and records every call.
    #[derive(Clone, Default)]
    pub(crate) struct MockModel {
        pub detections: Vec<RawDetection>,
        pub calls: Arc<AtomicUsize>,
        pub last_params: Arc<parking_lot::Mutex<Option<InferenceParams>>>,
    }

    impl DetectionModel for MockModel {
        fn predict(
            &mut self,
            _image: &RgbImage,
            params: &InferenceParams,
            _device: Device,
        ) -> Result<Vec<RawDetection>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_params.lock() = Some(*params);
            Ok(self.detections.clone())
        }
    }

    pub(crate) fn one_box_model() -> MockModel {
        MockModel {
            detections: vec![RawDetection {
                class_id: 0,
                score: 0.9,
                x1: 1.,
                y1: 1.,
                x2: 5.,
                y2: 5.,
            }],
            ..MockModel::default()
        }
    }

    pub(crate) fn pipeline_with(model: impl DetectionModel) -> InferencePipeline {
        let runtime = Arc::new(ModelRuntime::new());
        runtime.install(Box::new(model), Device::Cpu, LabelTable::coco());
        InferencePipeline::new(runtime, LabelPolicy::ModelConfidence, ThresholdTable::default())
    }

    #[test]
    fn test_run_with_one_box() {
        let pipeline = pipeline_with(one_box_model());

        let result = pipeline
            .run(&png_bytes(10, 10), InferenceParams::default())
            .unwrap();

        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].class_label, "person");
        assert_eq!(result.detections[0].score, 0.9);
        assert_eq!(result.detections[0].bbox, [1.0, 1.0, 5.0, 5.0]);
        assert!(result.inference_time_ms >= 0.);
    }

    #[test]
    fn test_run_requires_loaded_model() {
        let pipeline = InferencePipeline::new(
            Arc::new(ModelRuntime::new()),
            LabelPolicy::ModelConfidence,
            ThresholdTable::default(),
        );

        let result = pipeline.run(&png_bytes(10, 10), InferenceParams::default());

        assert!(matches!(result, Err(InferenceError::ModelNotLoaded)));
    }

    #[test]
    fn test_invalid_image_never_reaches_model() {
        let model = one_box_model();
        let calls = model.calls.clone();
        let pipeline = pipeline_with(model);

        for payload in [&b""[..], &b"not an image"[..]] {
            let result = pipeline.run(payload, InferenceParams::default());
            assert!(matches!(result, Err(InferenceError::InvalidImage)));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_params_are_clamped_before_model_call() {
        let model = MockModel::default();
        let last_params = model.last_params.clone();
        let pipeline = pipeline_with(model);

        let result = pipeline
            .run(
                &png_bytes(10, 10),
                InferenceParams {
                    confidence: 5.0,
                    iou: -1.0,
                    image_size: 4,
                },
            )
            .unwrap();

        assert!(result.detections.is_empty());
        assert_eq!(
            *last_params.lock(),
            Some(InferenceParams {
                confidence: 1.0,
                iou: 0.0,
                image_size: 32,
            })
        );
    }

    #[test]
    fn test_normalization_rounds_and_orders() {
        let pipeline = pipeline_with(MockModel {
            detections: vec![RawDetection {
                class_id: 500,
                score: 0.123456,
                x1: 10.126,
                y1: -2.0,
                x2: 3.333,
                y2: 7.999,
            }],
            ..MockModel::default()
        });

        let result = pipeline
            .run(&png_bytes(10, 10), InferenceParams::default())
            .unwrap();

        let detection = &result.detections[0];
        assert_eq!(detection.class_label, "500");
        assert_eq!(detection.score, 0.1235);
        assert_eq!(detection.bbox, [3.33, 0.0, 10.13, 8.0]);
    }

    fn raw_box(class_id: usize, score: f32) -> RawDetection {
        RawDetection {
            class_id,
            score,
            x1: 0.,
            y1: 0.,
            x2: 1.,
            y2: 1.,
        }
    }

    fn pipelines_over(
        detections: Vec<RawDetection>,
        thresholds: ThresholdTable,
    ) -> (InferencePipeline, InferencePipeline) {
        let runtime = Arc::new(ModelRuntime::new());
        runtime.install(
            Box::new(MockModel {
                detections,
                ..MockModel::default()
            }),
            Device::Cpu,
            LabelTable::coco(),
        );

        (
            InferencePipeline::new(
                runtime.clone(),
                LabelPolicy::ModelConfidence,
                thresholds.clone(),
            ),
            InferencePipeline::new(runtime, LabelPolicy::PerLabelThreshold, thresholds),
        )
    }

    fn labels_of(pipeline: &InferencePipeline) -> Vec<String> {
        pipeline
            .run(&png_bytes(10, 10), InferenceParams::default())
            .unwrap()
            .detections
            .into_iter()
            .map(|detection| detection.class_label)
            .collect()
    }

    #[test]
    fn test_per_label_threshold_policy() {
        let (lenient, strict) = pipelines_over(
            vec![raw_box(0, 0.6), raw_box(16, 0.4)],
            ThresholdTable::new(
                HashMap::from([(0, "person".to_string()), (16, "dog".to_string())]),
                HashMap::from([("person".to_string(), 0.7)]),
            ),
        );

        assert_eq!(labels_of(&lenient), vec!["person", "dog"]);
        // person needs 0.7, dog falls back to 0.5
        assert!(labels_of(&strict).is_empty());
    }

    #[test]
    fn test_per_label_policy_groups_vehicles() {
        let (lenient, strict) = pipelines_over(
            vec![
                raw_box(2, 0.55),
                raw_box(5, 0.45),
                raw_box(7, 0.9),
                raw_box(0, 0.42),
            ],
            ThresholdTable::default(),
        );

        assert_eq!(labels_of(&lenient), vec!["car", "bus", "truck", "person"]);
        assert_eq!(labels_of(&strict), vec!["vehicle", "vehicle", "person"]);
    }

    #[test]
    fn test_per_label_policy_drops_unmapped_ids() {
        let (lenient, strict) = pipelines_over(
            vec![raw_box(3, 0.6), raw_box(500, 0.99)],
            ThresholdTable::default(),
        );

        assert_eq!(labels_of(&lenient), vec!["motorcycle", "500"]);
        assert!(labels_of(&strict).is_empty());
    }

    /// Tracks how many threads are inside `predict` at once.
    struct ConcurrencyProbe {
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl DetectionModel for ConcurrencyProbe {
        fn predict(
            &mut self,
            _image: &RgbImage,
            _params: &InferenceParams,
            _device: Device,
        ) -> Result<Vec<RawDetection>, InferenceError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_model_calls_are_serialized() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline_with(ConcurrencyProbe {
            active: active.clone(),
            max_active: max_active.clone(),
        });
        let image = Arc::new(png_bytes(16, 16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pipeline = pipeline.clone();
                let image = image.clone();
                thread::spawn(move || pipeline.run(&image, InferenceParams::default()))
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_result_serialization() {
        let result = InferenceResult {
            detections: vec![Detection {
                class_label: "person".into(),
                score: 0.9,
                bbox: [1.0, 1.0, 5.0, 5.0],
            }],
            inference_time_ms: 1.25,
        };

        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "predictions": [{"class": "person", "score": 0.9, "bbox": [1.0, 1.0, 5.0, 5.0]}],
                "infer_ms": 1.25
            })
        );
    }
}
