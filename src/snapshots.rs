//! Snapshot files for persisted detections.

use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

pub struct SnapshotStore {
    dir: PathBuf,
}

/// `detection_id_{id}_{YYYYmmdd_HHMMSS}.jpg`
pub fn snapshot_name(detection_id: i64, timestamp: DateTime<Utc>) -> String {
    format!(
        "detection_id_{}_{}.jpg",
        detection_id,
        timestamp.format("%Y%m%d_%H%M%S")
    )
}

/// Snapshot bytes on disk under a temporary name. Dropped uncommitted, the file
/// is removed.
pub struct StagedSnapshot {
    path: Option<PathBuf>,
}

impl Drop for StagedSnapshot {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write via a temp file and rename, so readers never see a partial image.
    pub fn write(&self, name: &str, bytes: &[u8]) -> PipelineResult<PathBuf> {
        self.path_for(name)?;
        let staged = self.stage(bytes)?;
        self.commit(staged, name)
    }

    /// Write `bytes` to a hidden, synced staging file that is not yet servable.
    pub fn stage(&self, bytes: &[u8]) -> PipelineResult<StagedSnapshot> {
        std::fs::create_dir_all(&self.dir)?;
        let staged = StagedSnapshot {
            path: Some(
                self.dir
                    .join(format!(".staged-{:016x}.tmp", rand::random::<u64>())),
            ),
        };
        if let Some(path) = &staged.path {
            let mut file = std::fs::File::create(path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        Ok(staged)
    }

    /// Publish a staged file under `name`. Only a rename.
    pub fn commit(&self, mut staged: StagedSnapshot, name: &str) -> PipelineResult<PathBuf> {
        let target = self.path_for(name)?;
        let source = staged.path.take().ok_or_else(|| {
            PipelineError::Persistence("staged snapshot already committed".to_string())
        })?;
        if let Err(err) = std::fs::rename(&source, &target) {
            let _ = std::fs::remove_file(&source);
            return Err(err.into());
        }
        Ok(target)
    }

    pub fn read(&self, name: &str) -> PipelineResult<Vec<u8>> {
        Ok(std::fs::read(self.path_for(name)?)?)
    }

    /// Remove a snapshot. A missing file is not an error.
    pub fn remove(&self, name: &str) -> PipelineResult<()> {
        match std::fs::remove_file(self.path_for(name)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn path_for(&self, name: &str) -> PipelineResult<PathBuf> {
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains('/')
            && !name.contains('\\');
        if !plain {
            return Err(PipelineError::InvalidRequest(format!(
                "invalid snapshot name '{}'",
                name
            )));
        }
        Ok(self.dir.join(name))
    }
}
