//! Ahon live detection pipeline
//!
//! Turns a continuously replaced camera frame into two MJPEG streams (raw and
//! person-annotated) and, on request, into persisted detections with one victim
//! record per detected person.
//!
//! # Module Structure
//!
//! - `frame`: latest-wins frame slot and the 3-tier `FrameSource`
//! - `ingest`: producers that feed the slot (handoff file, ESP32 MJPEG)
//! - `detect`: detector contract, backends, `ModelRegistry` and the hot-swap `ModelCache`
//! - `stream`: per-connection multipart encoder loop
//! - `capture`: atomic capture of a detection, its snapshot and victims
//! - `storage` / `snapshots`: SQLite store and snapshot files
//! - `api`: HTTP surface

use anyhow::{Context, Result};
use std::sync::Arc;

pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod snapshots;
pub mod storage;
pub mod stream;

pub use capture::{CaptureOrchestrator, CaptureOutcome, CaptureRequest};
pub use config::{PipelineConfig, StreamSettings};
pub use detect::{
    ActiveDetector, BackendLoader, DetectorLoader, ModelCache, ModelRegistry, PersonDetector,
};
pub use error::{PipelineError, PipelineResult};
pub use frame::{Frame, FrameSlot, FrameSource, FrameStatus, FrameTier};
pub use snapshots::SnapshotStore;
pub use storage::{shared_memory_uri, Detection, Mission, PersonDetectionModel, Store, Victim};
pub use stream::{StreamEncoder, StreamVariant};

/// Shared state behind every request: one store, one frame source, one model
/// cache.
pub struct Pipeline {
    pub store: Arc<Store>,
    pub slot: Arc<FrameSlot>,
    pub frames: FrameSource,
    pub cache: Arc<ModelCache>,
    pub capture: CaptureOrchestrator,
    pub stream: StreamSettings,
}

impl Pipeline {
    /// Open the store, seed the model catalog and wire the shared components.
    pub fn open(cfg: &PipelineConfig, loader: Arc<dyn DetectorLoader>) -> Result<Self> {
        let store = Arc::new(
            Store::open(&cfg.db_path, cfg.models.default_confidence)
                .with_context(|| format!("open database {}", cfg.db_path))?,
        );
        let catalog = store.seed_models(cfg.models.assets.keys().map(String::as_str))?;
        log::info!(
            "model catalog: {}",
            catalog
                .iter()
                .map(|m| format!("{}={}", m.id, m.model_type))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let slot = Arc::new(FrameSlot::new());
        Ok(Self::from_parts(cfg, store, slot, loader))
    }

    /// Wire components around an existing store and slot.
    pub fn from_parts(
        cfg: &PipelineConfig,
        store: Arc<Store>,
        slot: Arc<FrameSlot>,
        loader: Arc<dyn DetectorLoader>,
    ) -> Self {
        let frames = FrameSource::new(Arc::clone(&slot), &cfg.frames.placeholder_path);
        let registry = ModelRegistry::new(Arc::clone(&store), cfg.models.default_type.clone());
        let cache = Arc::new(ModelCache::new(registry, cfg.models.clone(), loader));
        let snapshots = Arc::new(SnapshotStore::new(&cfg.snapshot_dir));
        let capture = CaptureOrchestrator::new(
            Arc::clone(&store),
            frames.clone(),
            Arc::clone(&cache),
            snapshots,
        );
        Self {
            store,
            slot,
            frames,
            cache,
            capture,
            stream: cfg.stream.clone(),
        }
    }
}
