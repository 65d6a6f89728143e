use anyhow::Result;

use crate::detect::backend::PersonDetector;
use crate::detect::result::Inference;
use crate::frame::Frame;

/// Detector that never finds anyone. Used when no inference runtime is built in.
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PersonDetector for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn infer(&mut self, frame: &Frame, _threshold: f32) -> Result<Inference> {
        Ok(Inference {
            boxes: Vec::new(),
            annotated: frame.jpeg().to_vec(),
        })
    }
}
