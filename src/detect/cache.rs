//! Process-wide detector cache with hot-swap.
//!
//! One `ModelCache` is shared by every stream loop and capture. Each `acquire`
//! compares the registry's current model and threshold with the loaded detector
//! under a single lock, so concurrent callers that notice a stale selection
//! reload exactly once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::ModelSettings;
use crate::detect::backend::{DetectorLoader, PersonDetector};
use crate::detect::registry::ModelRegistry;
use crate::detect::result::Inference;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::Frame;
use crate::storage::PersonDetectionModel;

/// Budgeted inferences allowed to be queued or running on one detector.
const MAX_PENDING_INFERENCES: usize = 4;

struct SharedDetector {
    detector: Mutex<Box<dyn PersonDetector>>,
    pending: AtomicUsize,
}

impl SharedDetector {
    fn new(detector: Box<dyn PersonDetector>) -> Self {
        Self {
            detector: Mutex::new(detector),
            pending: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn PersonDetector>> {
        match self.detector.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn infer(&self, frame: &Frame, threshold: f32) -> PipelineResult<Inference> {
        self.lock()
            .infer(frame, threshold)
            .map_err(|err| PipelineError::InferenceFailure(format!("{:#}", err)))
    }
}

/// Releases a pending slot when the worker ends, panics included.
struct PendingSlot(Arc<SharedDetector>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A loaded detector plus the selection it was loaded for.
pub struct ActiveDetector {
    pub model_id: i64,
    pub model_type: String,
    pub asset_path: PathBuf,
    pub threshold: f32,
    shared: Arc<SharedDetector>,
}

impl ActiveDetector {
    pub fn backend_name(&self) -> &'static str {
        self.shared.lock().name()
    }

    /// One inference pass at this handle's threshold. Waits for the result.
    pub fn infer(&self, frame: &Frame) -> PipelineResult<Inference> {
        self.shared.infer(frame, self.threshold)
    }

    /// Inference on a worker thread, abandoned once `budget` elapses.
    ///
    /// A late result is dropped. While `MAX_PENDING_INFERENCES` workers are still
    /// queued on this detector, new calls fail at once.
    pub fn infer_within(&self, frame: &Frame, budget: Duration) -> PipelineResult<Inference> {
        let pending = self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let slot = PendingSlot(Arc::clone(&self.shared));
        if pending >= MAX_PENDING_INFERENCES {
            return Err(PipelineError::InferenceFailure(format!(
                "detector busy with {} overdue inferences",
                pending
            )));
        }

        let (tx, rx) = mpsc::channel();
        let frame = frame.clone();
        let threshold = self.threshold;
        std::thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || {
                let result = slot.0.infer(&frame, threshold);
                drop(slot);
                let _ = tx.send(result);
            })
            .map_err(|err| {
                PipelineError::InferenceFailure(format!("spawn inference worker: {}", err))
            })?;

        match rx.recv_timeout(budget) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::InferenceFailure(format!(
                "inference overran budget of {} ms",
                budget.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::InferenceFailure(
                "inference worker exited without a result".to_string(),
            )),
        }
    }

    fn with_threshold(&self, threshold: f32) -> Self {
        Self {
            model_id: self.model_id,
            model_type: self.model_type.clone(),
            asset_path: self.asset_path.clone(),
            threshold,
            shared: Arc::clone(&self.shared),
        }
    }
}

enum CacheState {
    Unloaded,
    Loaded(Arc<ActiveDetector>),
}

pub struct ModelCache {
    registry: ModelRegistry,
    settings: ModelSettings,
    loader: Arc<dyn DetectorLoader>,
    state: Mutex<CacheState>,
    reloads: AtomicU64,
}

impl ModelCache {
    pub fn new(
        registry: ModelRegistry,
        settings: ModelSettings,
        loader: Arc<dyn DetectorLoader>,
    ) -> Self {
        Self {
            registry,
            settings,
            loader,
            state: Mutex::new(CacheState::Unloaded),
            reloads: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Number of asset loads performed so far.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Detector for the registry's current model and threshold.
    ///
    /// A model change loads a new asset; a threshold change reuses the loaded
    /// detector.
    pub fn acquire(&self) -> PipelineResult<Arc<ActiveDetector>> {
        let mut state = self.lock_state();
        let model = self.registry.current()?;
        let threshold = model.confidence;

        if let CacheState::Loaded(active) = &*state {
            if active.model_id == model.id {
                if active.threshold == threshold {
                    return Ok(Arc::clone(active));
                }
                log::info!(
                    "detection threshold changed {:.2} -> {:.2} for model {}",
                    active.threshold,
                    threshold,
                    model.id
                );
                let refreshed = Arc::new(active.with_threshold(threshold));
                *state = CacheState::Loaded(Arc::clone(&refreshed));
                return Ok(refreshed);
            }
        }

        let active = Arc::new(self.load(&model, threshold)?);
        log::info!(
            "loaded model {} ({}) from {} on {} backend at threshold {:.2}",
            active.model_id,
            active.model_type,
            active.asset_path.display(),
            active.backend_name(),
            threshold
        );
        *state = CacheState::Loaded(Arc::clone(&active));
        Ok(active)
    }

    /// Detector for a specific catalog entry at the registry threshold.
    ///
    /// Reuses the cached detector when it already serves `model`; otherwise loads
    /// a one-off detector without disturbing the cached one.
    pub fn acquire_for(
        &self,
        model: &PersonDetectionModel,
    ) -> PipelineResult<Arc<ActiveDetector>> {
        let threshold = self.registry.confidence()?;
        {
            let state = self.lock_state();
            if let CacheState::Loaded(active) = &*state {
                if active.model_id == model.id {
                    return Ok(Arc::new(active.with_threshold(threshold)));
                }
            }
        }
        log::info!(
            "loading one-off detector for model {} ({})",
            model.id,
            model.model_type
        );
        Ok(Arc::new(self.load(model, threshold)?))
    }

    fn load(
        &self,
        model: &PersonDetectionModel,
        threshold: f32,
    ) -> PipelineResult<ActiveDetector> {
        let (asset_path, mut detector) = self.load_asset(&model.model_type)?;
        if let Err(err) = detector.warm_up() {
            log::warn!("warm-up failed for {}: {:#}", asset_path.display(), err);
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(ActiveDetector {
            model_id: model.id,
            model_type: model.model_type.clone(),
            asset_path,
            threshold,
            shared: Arc::new(SharedDetector::new(detector)),
        })
    }

    /// Mapped asset first, then the designated fallback asset.
    fn load_asset(&self, model_type: &str) -> PipelineResult<(PathBuf, Box<dyn PersonDetector>)> {
        match self.settings.asset_for(model_type) {
            Some(asset) => match self.loader.load(asset) {
                Ok(detector) => return Ok((asset.to_path_buf(), detector)),
                Err(err) => log::warn!(
                    "model asset {} unusable, trying fallback: {:#}",
                    asset.display(),
                    err
                ),
            },
            None => log::warn!(
                "no asset mapped for model type '{}', trying fallback",
                model_type
            ),
        }
        let fallback: &Path = &self.settings.fallback_asset;
        self.loader
            .load(fallback)
            .map(|detector| (fallback.to_path_buf(), detector))
            .map_err(|err| {
                PipelineError::ModelUnavailable(format!(
                    "model type '{}': fallback asset {} failed: {:#}",
                    model_type,
                    fallback.display(),
                    err
                ))
            })
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
