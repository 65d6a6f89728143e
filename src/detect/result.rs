use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detected person.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonBox {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Greedy NMS: keep the highest-confidence box of every overlapping group.
pub fn non_max_suppression(boxes: &mut Vec<PersonBox>, iou_threshold: f32) {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept = 0;
    for index in 0..boxes.len() {
        let overlaps =
            (0..kept).any(|prev| boxes[prev].bbox.iou(&boxes[index].bbox) > iou_threshold);
        if !overlaps {
            boxes.swap(kept, index);
            kept += 1;
        }
    }
    boxes.truncate(kept);
}

/// Output of one inference pass.
#[derive(Clone, Debug, Default)]
pub struct Inference {
    /// Boxes in detector output order.
    pub boxes: Vec<PersonBox>,
    /// Annotated frame as JPEG.
    pub annotated: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
        };
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 1.0,
            y2: 1.0,
        };
        let b = BoundingBox {
            x1: 5.0,
            y1: 5.0,
            x2: 6.0,
            y2: 6.0,
        };
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let boxed = |x: f32, confidence: f32| PersonBox {
            bbox: BoundingBox {
                x1: x,
                y1: 0.0,
                x2: x + 10.0,
                y2: 10.0,
            },
            confidence,
        };
        let mut boxes = vec![boxed(0.0, 0.6), boxed(1.0, 0.9), boxed(50.0, 0.7)];
        non_max_suppression(&mut boxes, 0.45);
        let kept: Vec<f32> = boxes.iter().map(|b| b.confidence).collect();
        assert_eq!(kept, vec![0.9, 0.7]);
    }
}
