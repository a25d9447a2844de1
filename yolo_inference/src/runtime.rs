use crate::{
    config::ModelConfig,
    error::InferenceError,
    labels::LabelTable,
    model_service::{DetectionModel, Device, RawDetection},
    ort_service::{probe_device, OrtYoloModel},
    params::InferenceParams,
};
use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

struct LoadedModel {
    model: Mutex<Box<dyn DetectionModel>>,
    device: Device,
    labels: Arc<LabelTable>,
}

/// What a guarded model call hands back: the raw boxes and the label table of the model that
/// produced them.
pub struct ModelOutput {
    pub detections: Vec<RawDetection>,
    pub labels: Arc<LabelTable>,
}

/// Owner of the single loaded model. Built empty, filled once by `initialize`, emptied by
/// `shutdown`. Every model call goes through `infer_locked`, which holds one process-wide mutex
/// for the duration of the call. Once shut down the runtime stays empty: a second model with its
/// own mutex could otherwise run next to a call still finishing on the first.
#[derive(Default)]
pub struct ModelRuntime {
    slot: RwLock<Option<Arc<LoadedModel>>>,
    closed: AtomicBool,
}

impl ModelRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the ONNX model described by `config`. No-op when a model is already loaded or the
    /// runtime has been shut down.
    pub fn initialize(&self, config: &ModelConfig) -> Result<(), InferenceError> {
        let intra_threads = config.intra_threads;
        self.initialize_with(config, |path, device| {
            let model = OrtYoloModel::load(path, device, intra_threads)?;
            Ok(Box::new(model) as Box<dyn DetectionModel>)
        })
    }

    pub fn initialize_with<F>(&self, config: &ModelConfig, load: F) -> Result<(), InferenceError>
    where
        F: FnOnce(&Path, Device) -> Result<Box<dyn DetectionModel>, InferenceError>,
    {
        let mut slot = self.slot.write();
        if slot.is_some() {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!("Model runtime already shut down, not loading again");
            return Ok(());
        }

        let model_path = config.get_model_path();
        if !model_path.exists() {
            return Err(InferenceError::ModelArtifactMissing(model_path));
        }

        let device = match &config.device {
            Some(forced) => Device::parse(forced)?,
            None => probe_device(),
        };

        let labels = match &config.labels_file {
            Some(labels_file) => LabelTable::from_file(labels_file).map_err(|e| {
                InferenceError::ModelLoad(format!(
                    "failed to load labels from {}: {}",
                    labels_file.display(),
                    e
                ))
            })?,
            None => LabelTable::coco(),
        };

        tracing::info!(
            "Loading model {} on {} with {} labels",
            model_path.display(),
            device,
            labels.len()
        );
        let model = load(&model_path, device)?;

        *slot = Some(Arc::new(LoadedModel {
            model: Mutex::new(model),
            device,
            labels: Arc::new(labels),
        }));

        Ok(())
    }

    /// Installs an already constructed model. No-op when a model is already loaded.
    #[cfg(test)]
    pub fn install(&self, model: Box<dyn DetectionModel>, device: Device, labels: LabelTable) {
        let mut slot = self.slot.write();
        if slot.is_none() {
            *slot = Some(Arc::new(LoadedModel {
                model: Mutex::new(model),
                device,
                labels: Arc::new(labels),
            }));
        }
    }

    /// Drops the runtime's reference to the model. Calls already in flight finish on their own
    /// reference.
    pub fn shutdown(&self) {
        let mut slot = self.slot.write();
        self.closed.store(true, Ordering::SeqCst);
        if slot.take().is_some() {
            tracing::info!("Model unloaded");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().is_some()
    }

    pub fn device(&self) -> Option<Device> {
        self.slot.read().as_ref().map(|loaded| loaded.device)
    }

    pub fn infer_locked(
        &self,
        image: &RgbImage,
        params: &InferenceParams,
    ) -> Result<ModelOutput, InferenceError> {
        let loaded = self
            .slot
            .read()
            .clone()
            .ok_or(InferenceError::ModelNotLoaded)?;

        let detections = {
            let mut model = loaded.model.lock();
            model.predict(image, params, loaded.device)?
        };

        Ok(ModelOutput {
            detections,
            labels: loaded.labels.clone(),
        })
    }
}
