//! Frame handoff and acquisition.
//!
//! - `FrameSlot`: single-slot, latest-wins buffer written by a producer and read by
//!   every stream loop and capture request.
//! - `Frame`: a canonical JPEG plus its dimensions.
//! - `FrameSource`: 3-tier acquisition (live slot, placeholder file, empty frame).
//!
//! The slot only ever stores complete byte buffers behind an `Arc`; a publish swaps
//! the pointer under the lock, so a reader holds either the previous complete frame
//! or the new one.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{GenericImageView, RgbImage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{PipelineError, PipelineResult};

/// JPEG quality used when re-encoding frames to the canonical format.
pub const CANONICAL_JPEG_QUALITY: u8 = 90;

// ----------------------------------------------------------------------------
// Frame: canonical JPEG
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Frame {
    jpeg: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Zero-length frame emitted when every tier failed.
    pub fn empty() -> Self {
        Self {
            jpeg: Arc::from(Vec::new()),
            width: 0,
            height: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn byte_len(&self) -> usize {
        self.jpeg.len()
    }

    /// Decode to RGB pixels for inference or annotation.
    pub fn decode_rgb(&self) -> Result<RgbImage> {
        if self.is_empty() {
            return Err(anyhow!("cannot decode an empty frame"));
        }
        let image = image::load_from_memory(&self.jpeg).context("decode canonical frame")?;
        Ok(image.to_rgb8())
    }
}

/// Decode any supported image and re-encode it as baseline RGB JPEG.
pub fn canonicalize(bytes: &[u8]) -> Result<Frame> {
    if bytes.is_empty() {
        return Err(anyhow!("frame is empty"));
    }
    let image = image::load_from_memory(bytes).context("decode frame")?;
    let (width, height) = image.dimensions();
    let jpeg = encode_jpeg(&image.to_rgb8())?;
    Ok(Frame {
        jpeg: Arc::from(jpeg),
        width,
        height,
    })
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const PNG_IEND: [u8; 8] = [b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82];

/// True when `bytes` hold a whole JPEG (SOI..EOI) or PNG (signature..IEND).
///
/// A file caught mid-write is cut short and fails this check.
pub fn is_complete_image(bytes: &[u8]) -> bool {
    if bytes.starts_with(&[0xFF, 0xD8]) {
        let end = bytes
            .iter()
            .rposition(|&b| b != 0x00)
            .map_or(0, |last| last + 1);
        return end >= 4 && bytes[..end].ends_with(&[0xFF, 0xD9]);
    }
    bytes.starts_with(&PNG_SIGNATURE) && bytes.ends_with(&PNG_IEND)
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, CANONICAL_JPEG_QUALITY)
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// FrameSlot: latest-wins handoff
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    bytes: Option<Arc<[u8]>>,
    generation: u64,
}

/// Single-slot frame handoff shared between a producer and all consumers.
#[derive(Default)]
pub struct FrameSlot {
    state: RwLock<SlotState>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame. Returns the new generation.
    pub fn publish(&self, bytes: Vec<u8>) -> u64 {
        let bytes: Arc<[u8]> = Arc::from(bytes);
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.bytes = Some(bytes);
        state.generation += 1;
        state.generation
    }

    /// Drop the current frame so consumers observe an absent handoff.
    pub fn clear(&self) {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.bytes = None;
    }

    /// Most recent complete frame and its generation.
    pub fn latest(&self) -> Option<(Arc<[u8]>, u64)> {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .bytes
            .as_ref()
            .map(|bytes| (Arc::clone(bytes), state.generation))
    }

    pub fn generation(&self) -> u64 {
        match self.state.read() {
            Ok(guard) => guard.generation,
            Err(poisoned) => poisoned.into_inner().generation,
        }
    }
}

// ----------------------------------------------------------------------------
// FrameSource: 3-tier acquisition
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameTier {
    Live,
    Placeholder,
    Empty,
}

#[derive(Clone, Debug)]
pub struct SourcedFrame {
    pub frame: Frame,
    pub tier: FrameTier,
}

/// Availability of the live frame, as reported by `GET /status/`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameStatus {
    Available {
        file_size: usize,
        dimensions: Dimensions,
    },
    Invalid {
        file_size: usize,
        error: String,
    },
    NotFound {
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone)]
pub struct FrameSource {
    slot: Arc<FrameSlot>,
    placeholder_path: PathBuf,
}

impl FrameSource {
    pub fn new(slot: Arc<FrameSlot>, placeholder_path: impl Into<PathBuf>) -> Self {
        Self {
            slot,
            placeholder_path: placeholder_path.into(),
        }
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn placeholder_path(&self) -> &Path {
        &self.placeholder_path
    }

    /// Tier 1 only: the live handoff frame, canonicalized.
    pub fn live(&self) -> PipelineResult<Frame> {
        let (bytes, _) = self.slot.latest().ok_or(PipelineError::FrameUnavailable)?;
        canonicalize(&bytes).map_err(|err| {
            log::debug!("live frame rejected: {:#}", err);
            PipelineError::FrameUnavailable
        })
    }

    /// Tier 2 only: the placeholder image, read from disk on every call.
    pub fn placeholder(&self) -> Result<Frame> {
        let bytes = std::fs::read(&self.placeholder_path).with_context(|| {
            format!(
                "read placeholder frame {}",
                self.placeholder_path.display()
            )
        })?;
        canonicalize(&bytes)
    }

    /// Best available frame. Each tier is attempted afresh on every call.
    pub fn latest(&self) -> SourcedFrame {
        match self.live() {
            Ok(frame) => SourcedFrame {
                frame,
                tier: FrameTier::Live,
            },
            Err(_) => self.fallback(),
        }
    }

    /// Tiers 2 and 3, used directly when a later stage fails on a live frame.
    pub fn fallback(&self) -> SourcedFrame {
        match self.placeholder() {
            Ok(frame) => SourcedFrame {
                frame,
                tier: FrameTier::Placeholder,
            },
            Err(err) => {
                log::debug!("placeholder frame unavailable: {:#}", err);
                SourcedFrame {
                    frame: Frame::empty(),
                    tier: FrameTier::Empty,
                }
            }
        }
    }

    pub fn status(&self) -> FrameStatus {
        let Some((bytes, _)) = self.slot.latest() else {
            return FrameStatus::NotFound {
                message: "No image available".to_string(),
            };
        };
        match image::load_from_memory(&bytes) {
            Ok(image) => {
                let (width, height) = image.dimensions();
                FrameStatus::Available {
                    file_size: bytes.len(),
                    dimensions: Dimensions { width, height },
                }
            }
            Err(err) => FrameStatus::Invalid {
                file_size: bytes.len(),
                error: err.to_string(),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    pub(crate) fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb(rgb));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    #[test]
    fn canonicalize_reencodes_png_as_jpeg() -> Result<()> {
        let frame = canonicalize(&solid_png(8, 6, [10, 20, 30]))?;
        assert_eq!((frame.width, frame.height), (8, 6));
        assert_eq!(&frame.jpeg()[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn truncated_images_are_incomplete() -> Result<()> {
        let png = solid_png(6, 6, [1, 2, 3]);
        let jpeg = canonicalize(&png)?.jpeg().to_vec();
        assert!(is_complete_image(&png));
        assert!(is_complete_image(&jpeg));

        let mut padded = jpeg.clone();
        padded.extend_from_slice(&[0, 0]);
        assert!(is_complete_image(&padded));

        assert!(!is_complete_image(&jpeg[..jpeg.len() / 2]));
        assert!(!is_complete_image(&png[..png.len() - 1]));
        assert!(!is_complete_image(b"not an image"));
        assert!(!is_complete_image(&[]));
        Ok(())
    }

    #[test]
    fn slot_is_latest_wins() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());
        assert_eq!(slot.publish(vec![1, 2, 3]), 1);
        assert_eq!(slot.publish(vec![4, 5]), 2);
        let (bytes, generation) = slot.latest().expect("frame");
        assert_eq!(&bytes[..], &[4, 5]);
        assert_eq!(generation, 2);
        slot.clear();
        assert!(slot.latest().is_none());
        assert_eq!(slot.generation(), 2);
    }

    #[test]
    fn readers_never_observe_partial_frames() {
        let slot = Arc::new(FrameSlot::new());
        let writer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                for i in 0..500u32 {
                    let fill = (i % 251) as u8;
                    slot.publish(vec![fill; 4096]);
                }
            })
        };
        for _ in 0..500 {
            if let Some((bytes, _)) = slot.latest() {
                assert_eq!(bytes.len(), 4096);
                assert!(bytes.iter().all(|b| *b == bytes[0]));
            }
        }
        writer.join().expect("writer thread");
    }

    #[test]
    fn falls_back_through_tiers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let placeholder = dir.path().join("placeholder.png");
        let slot = Arc::new(FrameSlot::new());
        let source = FrameSource::new(Arc::clone(&slot), &placeholder);

        // Nothing anywhere: empty frame.
        let sourced = source.latest();
        assert_eq!(sourced.tier, FrameTier::Empty);
        assert!(sourced.frame.is_empty());

        std::fs::write(&placeholder, solid_png(4, 4, [0, 0, 0]))?;
        assert_eq!(source.latest().tier, FrameTier::Placeholder);

        // Corrupt live frame still falls back.
        slot.publish(b"not an image".to_vec());
        assert_eq!(source.latest().tier, FrameTier::Placeholder);

        // A transient failure does not disable tier 1.
        slot.publish(solid_png(4, 4, [255, 0, 0]));
        assert_eq!(source.latest().tier, FrameTier::Live);
        Ok(())
    }

    #[test]
    fn status_reports_dimensions_and_absence() {
        let slot = Arc::new(FrameSlot::new());
        let source = FrameSource::new(Arc::clone(&slot), "missing.jpg");
        assert!(matches!(source.status(), FrameStatus::NotFound { .. }));

        slot.publish(solid_png(3, 2, [1, 2, 3]));
        match source.status() {
            FrameStatus::Available {
                dimensions,
                file_size,
            } => {
                assert_eq!(dimensions, Dimensions { width: 3, height: 2 });
                assert!(file_size > 0);
            }
            other => panic!("unexpected status {:?}", other),
        }

        slot.publish(b"garbage".to_vec());
        assert!(matches!(source.status(), FrameStatus::Invalid { .. }));
    }
}
