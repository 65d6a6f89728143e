//! On-demand capture: one inference pass persisted as a detection with victims.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::detect::ModelCache;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::FrameSource;
use crate::snapshots::{snapshot_name, SnapshotStore};
use crate::storage::{Detection, NewDetection, Store, Victim};

#[derive(Clone, Debug, Deserialize)]
pub struct CaptureRequest {
    pub mission_id: i64,
    #[serde(default, alias = "person_detection_model_id")]
    pub model_id: Option<i64>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub is_live: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct CaptureOutcome {
    #[serde(rename = "data")]
    pub detection: Detection,
    pub victims: Vec<Victim>,
}

pub struct CaptureOrchestrator {
    store: Arc<Store>,
    frames: FrameSource,
    cache: Arc<ModelCache>,
    snapshots: Arc<SnapshotStore>,
}

impl CaptureOrchestrator {
    pub fn new(
        store: Arc<Store>,
        frames: FrameSource,
        cache: Arc<ModelCache>,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            store,
            frames,
            cache,
            snapshots,
        }
    }

    /// Run one capture. Either every row and the snapshot exist afterwards, or
    /// none of them do.
    pub fn capture(&self, request: &CaptureRequest) -> PipelineResult<CaptureOutcome> {
        let mission = self.store.get_mission(request.mission_id)?;
        if !mission.is_open() {
            return Err(PipelineError::MissionClosed(mission.id));
        }
        let model = self.cache.registry().resolve(request.model_id)?;

        let frame = self.frames.live().map_err(|err| {
            log::debug!("capture for mission {} has no frame: {}", mission.id, err);
            PipelineError::NoFrameAvailable
        })?;

        let detector = self.cache.acquire_for(&model)?;
        let inference = detector.infer(&frame)?;

        let new = NewDetection {
            mission_id: mission.id,
            model_id: model.id,
            latitude: request.latitude,
            longitude: request.longitude,
            timestamp: Utc::now(),
            is_live: request.is_live,
        };
        // Staged before the store lock is taken; inside the transaction the
        // snapshot is only renamed into place.
        let staged = self.snapshots.stage(&inference.annotated)?;
        let mut written: Option<String> = None;
        let result = self
            .store
            .persist_capture(&new, &inference.boxes, |detection_id| {
                let name = snapshot_name(detection_id, new.timestamp);
                self.snapshots.commit(staged, &name)?;
                written = Some(name.clone());
                Ok(name)
            });

        match result {
            Ok((detection, victims)) => {
                log::info!(
                    "captured detection {} for mission {} with {} victim(s) using model {} at {:.2}",
                    detection.id,
                    mission.id,
                    victims.len(),
                    model.model_type,
                    detector.threshold
                );
                Ok(CaptureOutcome { detection, victims })
            }
            Err(err) => {
                if let Some(name) = written {
                    if let Err(cleanup) = self.snapshots.remove(&name) {
                        log::warn!("failed to remove orphaned snapshot {}: {}", name, cleanup);
                    }
                }
                log::warn!("capture for mission {} rolled back: {}", mission.id, err);
                Err(err)
            }
        }
    }

    /// Stored snapshot for a detection.
    pub fn snapshot(&self, detection_id: i64) -> PipelineResult<Vec<u8>> {
        let detection = self.store.get_detection(detection_id)?;
        let name = detection
            .snapshot
            .ok_or_else(|| PipelineError::not_found("snapshot", detection_id))?;
        self.snapshots.read(&name).map_err(|err| {
            log::debug!("snapshot {} unreadable: {}", name, err);
            PipelineError::not_found("snapshot", detection_id)
        })
    }

    /// Delete a detection, its victims and its snapshot file.
    pub fn discard_detection(&self, detection_id: i64) -> PipelineResult<()> {
        if let Some(name) = self.store.delete_detection(detection_id)? {
            self.snapshots.remove(&name)?;
        }
        Ok(())
    }

    /// Delete a mission with everything captured under it.
    pub fn discard_mission(&self, mission_id: i64) -> PipelineResult<()> {
        for name in self.store.delete_mission(mission_id)? {
            self.snapshots.remove(&name)?;
        }
        Ok(())
    }
}
