pub mod null;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use std::path::Path;

use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectorLoader, PersonDetector};

pub use null::NullBackend;
pub use stub::{ScriptedLoader, StubBackend};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

/// Loader used by the daemon: picks a backend from the asset extension.
#[derive(Clone, Copy, Debug, Default)]
pub struct BackendLoader;

impl DetectorLoader for BackendLoader {
    fn load(&self, asset: &Path) -> Result<Box<dyn PersonDetector>> {
        if !asset.is_file() {
            return Err(anyhow!("model asset {} does not exist", asset.display()));
        }
        let is_onnx = asset
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("onnx"))
            .unwrap_or(false);
        if !is_onnx {
            return Err(anyhow!(
                "unsupported model asset {}; expected .onnx",
                asset.display()
            ));
        }
        load_onnx(asset)
    }
}

#[cfg(feature = "backend-tract")]
fn load_onnx(asset: &Path) -> Result<Box<dyn PersonDetector>> {
    Ok(Box::new(TractBackend::new(asset)?))
}

#[cfg(not(feature = "backend-tract"))]
fn load_onnx(asset: &Path) -> Result<Box<dyn PersonDetector>> {
    log::warn!(
        "backend-tract feature disabled; {} will run without detections",
        asset.display()
    );
    Ok(Box::new(NullBackend::new()))
}
