use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};
use crate::storage::{PersonDetectionModel, Store};

/// Model selection and the shared confidence threshold.
///
/// The store keeps one registry row; every catalog entry reports the same
/// threshold and at most one of them is selected.
#[derive(Clone)]
pub struct ModelRegistry {
    store: Arc<Store>,
    default_type: String,
}

impl ModelRegistry {
    pub fn new(store: Arc<Store>, default_type: impl Into<String>) -> Self {
        Self {
            store,
            default_type: default_type.into(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn list(&self) -> PipelineResult<Vec<PersonDetectionModel>> {
        self.store.list_models()
    }

    /// Make `model_id` the only selected model.
    pub fn select(&self, model_id: i64) -> PipelineResult<PersonDetectionModel> {
        let model = self.store.select_model(model_id)?;
        log::info!("selected person detection model {} ({})", model.id, model.model_type);
        Ok(model)
    }

    /// Apply one threshold to the whole catalog.
    pub fn set_confidence(&self, confidence: f32) -> PipelineResult<()> {
        self.store.set_confidence(confidence)?;
        log::info!("detection confidence set to {:.2}", confidence);
        Ok(())
    }

    pub fn select_with_confidence(
        &self,
        model_id: i64,
        confidence: f32,
    ) -> PipelineResult<PersonDetectionModel> {
        let model = self.store.select_model_with_confidence(model_id, confidence)?;
        log::info!(
            "selected person detection model {} ({}) at confidence {:.2}",
            model.id,
            model.model_type,
            confidence
        );
        Ok(model)
    }

    pub fn confidence(&self) -> PipelineResult<f32> {
        Ok(self.store.registry_state()?.confidence)
    }

    /// Catalog entry used when nothing is selected or a capture names no model.
    pub fn default_model(&self) -> PipelineResult<PersonDetectionModel> {
        self.store
            .find_model_by_type(&self.default_type)?
            .ok_or_else(|| {
                PipelineError::ModelUnavailable(format!(
                    "default model type '{}' is not in the catalog",
                    self.default_type
                ))
            })
    }

    /// Selected model, or the catalog default when none is selected.
    pub fn current(&self) -> PipelineResult<PersonDetectionModel> {
        match self.store.registry_state()?.selected_model_id {
            Some(id) => self.store.get_model(id),
            None => self.default_model(),
        }
    }

    /// Explicit ids must exist; `None` means the catalog default.
    pub fn resolve(&self, model_id: Option<i64>) -> PipelineResult<PersonDetectionModel> {
        match model_id {
            Some(id) => self.store.get_model(id),
            None => self.default_model(),
        }
    }
}
