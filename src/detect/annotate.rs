//! Box overlay for annotated frames.

use anyhow::Result;
use image::{Rgb, RgbImage};

use crate::detect::result::{BoundingBox, PersonBox};
use crate::frame::{encode_jpeg, Frame};

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 3;

/// Draw every box on a copy of `frame` and re-encode it as JPEG.
///
/// An empty frame is passed through unchanged.
pub fn annotate(frame: &Frame, boxes: &[PersonBox]) -> Result<Vec<u8>> {
    if frame.is_empty() {
        return Ok(Vec::new());
    }
    if boxes.is_empty() {
        return Ok(frame.jpeg().to_vec());
    }
    let mut image = frame.decode_rgb()?;
    for person in boxes {
        if let Some(px) = clamp_box(&person.bbox, image.dimensions()) {
            draw_rect(&mut image, px, BOX_COLOR, BOX_THICKNESS);
        }
    }
    encode_jpeg(&image)
}

/// Pixel-space box clamped to the image, or `None` if it falls outside.
fn clamp_box(bbox: &BoundingBox, (w, h): (u32, u32)) -> Option<[u32; 4]> {
    if w == 0 || h == 0 {
        return None;
    }
    let clamp = |v: f32, max: u32| -> u32 { v.max(0.0).min((max - 1) as f32) as u32 };
    let x0 = clamp(bbox.x1, w);
    let y0 = clamp(bbox.y1, h);
    let x1 = clamp(bbox.x2, w);
    let y1 = clamp(bbox.y2, h);
    if x0 > x1 || y0 > y1 {
        return None;
    }
    Some([x0, y0, x1, y1])
}

fn draw_rect(img: &mut RgbImage, [x0, y0, x1, y1]: [u32; 4], color: Rgb<u8>, thickness: u32) {
    for t in 0..thickness {
        let (xx0, yy0) = (x0.saturating_add(t), y0.saturating_add(t));
        let (xx1, yy1) = (x1.saturating_sub(t), y1.saturating_sub(t));
        if xx0 > xx1 || yy0 > yy1 {
            break;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::canonicalize;
    use crate::frame::tests::solid_png;

    #[test]
    fn draws_box_border() -> Result<()> {
        let frame = canonicalize(&solid_png(40, 40, [0, 0, 0]))?;
        let boxes = [PersonBox {
            bbox: BoundingBox {
                x1: 5.0,
                y1: 5.0,
                x2: 30.0,
                y2: 30.0,
            },
            confidence: 0.9,
        }];
        let out = annotate(&frame, &boxes)?;
        let image = image::load_from_memory(&out)?.to_rgb8();
        let edge = image.get_pixel(15, 6);
        assert!(edge[0] > 150 && edge[1] < 100, "edge pixel {:?}", edge);
        let inside = image.get_pixel(18, 18);
        assert!(inside[0] < 60, "interior pixel {:?}", inside);
        Ok(())
    }

    #[test]
    fn out_of_range_box_is_clamped() {
        assert_eq!(
            clamp_box(
                &BoundingBox {
                    x1: -10.0,
                    y1: -10.0,
                    x2: 500.0,
                    y2: 500.0
                },
                (20, 10)
            ),
            Some([0, 0, 19, 9])
        );
    }

    #[test]
    fn empty_frame_passes_through() -> Result<()> {
        assert!(annotate(&Frame::empty(), &[])?.is_empty());
        Ok(())
    }
}
