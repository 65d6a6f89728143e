use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::annotate::annotate;
use crate::detect::backend::{DetectorLoader, PersonDetector};
use crate::detect::result::{Inference, PersonBox};
use crate::frame::Frame;

/// Scripted backend for tests and demos.
///
/// Returns its scripted boxes filtered by the call's threshold, in script order.
pub struct StubBackend {
    label: String,
    boxes: Vec<PersonBox>,
    delay: Option<Duration>,
    fail: bool,
    last_threshold: Arc<Mutex<Option<f32>>>,
}

impl StubBackend {
    pub fn new(boxes: Vec<PersonBox>) -> Self {
        Self {
            label: "stub".to_string(),
            boxes,
            delay: None,
            fail: false,
            last_threshold: Arc::new(Mutex::new(None)),
        }
    }

    /// Tag the backend, usually with the asset it was loaded from.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sleep before answering, to exercise inference budgets.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every inference.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Shared view of the threshold used by the most recent call.
    pub fn observed_threshold(&self) -> Arc<Mutex<Option<f32>>> {
        Arc::clone(&self.last_threshold)
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PersonDetector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame, threshold: f32) -> Result<Inference> {
        if let Ok(mut seen) = self.last_threshold.lock() {
            *seen = Some(threshold);
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            return Err(anyhow!("stub backend '{}' scripted failure", self.label));
        }
        let boxes: Vec<PersonBox> = self
            .boxes
            .iter()
            .copied()
            .filter(|person| person.confidence >= threshold)
            .collect();
        let annotated = annotate(frame, &boxes)?;
        Ok(Inference { boxes, annotated })
    }
}

/// Loader that hands out `StubBackend`s keyed by asset path.
///
/// Unknown assets fail to load, which lets tests exercise the fallback asset.
#[derive(Clone, Default)]
pub struct ScriptedLoader {
    scripts: HashMap<PathBuf, Script>,
    loads: Arc<Mutex<Vec<PathBuf>>>,
}

#[derive(Clone, Default)]
struct Script {
    boxes: Vec<PersonBox>,
    delay: Option<Duration>,
    fail_inference: bool,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, asset: impl Into<PathBuf>, boxes: Vec<PersonBox>) -> Self {
        self.scripts.insert(
            asset.into(),
            Script {
                boxes,
                ..Script::default()
            },
        );
        self
    }

    pub fn with_slow_asset(mut self, asset: impl Into<PathBuf>, delay: Duration) -> Self {
        self.scripts.insert(
            asset.into(),
            Script {
                delay: Some(delay),
                ..Script::default()
            },
        );
        self
    }

    pub fn with_failing_asset(mut self, asset: impl Into<PathBuf>) -> Self {
        self.scripts.insert(
            asset.into(),
            Script {
                fail_inference: true,
                ..Script::default()
            },
        );
        self
    }

    /// Asset paths loaded so far, in order.
    pub fn loads(&self) -> Vec<PathBuf> {
        self.loads
            .lock()
            .map(|loads| loads.clone())
            .unwrap_or_default()
    }
}

impl DetectorLoader for ScriptedLoader {
    fn load(&self, asset: &Path) -> Result<Box<dyn PersonDetector>> {
        let script = self
            .scripts
            .get(asset)
            .ok_or_else(|| anyhow!("no scripted detector for {}", asset.display()))?;
        if let Ok(mut loads) = self.loads.lock() {
            loads.push(asset.to_path_buf());
        }
        let mut backend =
            StubBackend::new(script.boxes.clone()).with_label(asset.display().to_string());
        if let Some(delay) = script.delay {
            backend = backend.with_delay(delay);
        }
        if script.fail_inference {
            backend = backend.failing();
        }
        Ok(Box::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;
    use crate::frame::canonicalize;
    use crate::frame::tests::solid_png;

    fn person(confidence: f32) -> PersonBox {
        PersonBox {
            bbox: BoundingBox {
                x1: 1.0,
                y1: 1.0,
                x2: 5.0,
                y2: 5.0,
            },
            confidence,
        }
    }

    #[test]
    fn threshold_filters_scripted_boxes() -> Result<()> {
        let frame = canonicalize(&solid_png(8, 8, [0, 0, 0]))?;
        let mut backend = StubBackend::new(vec![person(0.9), person(0.6), person(0.3)]);
        let observed = backend.observed_threshold();

        assert_eq!(backend.infer(&frame, 0.5)?.boxes.len(), 2);
        assert_eq!(backend.infer(&frame, 0.7)?.boxes.len(), 1);
        assert_eq!(*observed.lock().expect("observed"), Some(0.7));
        Ok(())
    }

    #[test]
    fn loader_rejects_unknown_assets() {
        let loader = ScriptedLoader::new().with_asset("a.onnx", vec![]);
        assert!(loader.load(Path::new("a.onnx")).is_ok());
        assert!(loader.load(Path::new("b.onnx")).is_err());
        assert_eq!(loader.loads(), vec![PathBuf::from("a.onnx")]);
    }
}
