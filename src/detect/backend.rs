use std::path::Path;

use anyhow::Result;

use crate::detect::result::Inference;
use crate::frame::Frame;

/// Person detector contract.
///
/// Implementations take the threshold per call so a new confidence value never
/// forces a reload. `infer` must not write to disk or keep the frame after it
/// returns.
pub trait PersonDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect people in a canonical frame and return boxes plus an annotated copy.
    fn infer(&mut self, frame: &Frame, threshold: f32) -> Result<Inference>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds detectors from model assets.
pub trait DetectorLoader: Send + Sync {
    fn load(&self, asset: &Path) -> Result<Box<dyn PersonDetector>>;
}
