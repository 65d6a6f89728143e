#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::annotate::annotate;
use crate::detect::backend::PersonDetector;
use crate::detect::result::{non_max_suppression, BoundingBox, Inference, PersonBox};
use crate::frame::Frame;

const INPUT_SIZE: u32 = 640;
const PERSON_CLASS: usize = 0;
const NMS_IOU: f32 = 0.45;
const CXCYWH: usize = 4;

/// YOLOv8 ONNX detector run through tract.
///
/// Expects a `1x3x640x640` input and a `[1, 4 + classes, anchors]` output; only the
/// person class is reported.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = INPUT_SIZE as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        Ok(Self { model })
    }

    fn build_input(&self, frame: &Frame) -> Result<(Tensor, f32, f32)> {
        let rgb = frame.decode_rgb()?;
        let (width, height) = rgb.dimensions();
        let resized = imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let side = INPUT_SIZE as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        let scale_x = width as f32 / INPUT_SIZE as f32;
        let scale_y = height as f32 / INPUT_SIZE as f32;
        Ok((input.into_tensor(), scale_x, scale_y))
    }

    fn decode(
        outputs: &TVec<TValue>,
        threshold: f32,
        scale_x: f32,
        scale_y: f32,
        (width, height): (u32, u32),
    ) -> Result<Vec<PersonBox>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a [1, 4 + classes, anchors] output")?;
        let (_, rows, anchors) = preds.dim();
        if rows <= CXCYWH + PERSON_CLASS {
            return Err(anyhow!("model output has no person class row"));
        }

        let mut boxes = Vec::new();
        for a in 0..anchors {
            let confidence = preds[[0, CXCYWH + PERSON_CLASS, a]];
            if confidence < threshold {
                continue;
            }
            let cx = preds[[0, 0, a]] * scale_x;
            let cy = preds[[0, 1, a]] * scale_y;
            let w = preds[[0, 2, a]] * scale_x;
            let h = preds[[0, 3, a]] * scale_y;
            boxes.push(PersonBox {
                bbox: BoundingBox {
                    x1: (cx - w / 2.0).clamp(0.0, width as f32),
                    y1: (cy - h / 2.0).clamp(0.0, height as f32),
                    x2: (cx + w / 2.0).clamp(0.0, width as f32),
                    y2: (cy + h / 2.0).clamp(0.0, height as f32),
                },
                confidence,
            });
        }
        non_max_suppression(&mut boxes, NMS_IOU);
        Ok(boxes)
    }
}

impl PersonDetector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame, threshold: f32) -> Result<Inference> {
        if frame.is_empty() {
            return Err(anyhow!("cannot run inference on an empty frame"));
        }
        let (input, scale_x, scale_y) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let boxes = Self::decode(
            &outputs,
            threshold,
            scale_x,
            scale_y,
            (frame.width, frame.height),
        )?;
        let annotated = annotate(frame, &boxes)?;
        Ok(Inference { boxes, annotated })
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = INPUT_SIZE as usize;
        let blank = tract_ndarray::Array4::<f32>::zeros((1, 3, side, side)).into_tensor();
        self.model
            .run(tvec!(blank.into()))
            .context("ONNX warm-up failed")?;
        Ok(())
    }
}
