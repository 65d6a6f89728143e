//! Multipart MJPEG stream loop.
//!
//! Each client connection owns one `StreamEncoder`. The loop never ends on an
//! internal failure: frame, model and inference errors degrade to the
//! placeholder (or an empty part) and the cadence continues. Only a failed write
//! to the sink or the cancel flag stops it.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::ModelCache;
use crate::frame::{FrameSource, FrameTier};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const WARN_EVERY: u64 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamVariant {
    Raw,
    Annotated,
}

/// Why `run` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamExit {
    Cancelled,
    Disconnected,
}

pub struct StreamEncoder {
    variant: StreamVariant,
    frames: FrameSource,
    cache: Option<Arc<ModelCache>>,
    interval: Duration,
    budget: Duration,
    failures: u64,
    sent: u64,
}

impl StreamEncoder {
    pub fn raw(frames: FrameSource, interval: Duration) -> Self {
        Self {
            variant: StreamVariant::Raw,
            frames,
            cache: None,
            interval,
            budget: Duration::MAX,
            failures: 0,
            sent: 0,
        }
    }

    pub fn annotated(
        frames: FrameSource,
        cache: Arc<ModelCache>,
        interval: Duration,
        budget: Duration,
    ) -> Self {
        Self {
            variant: StreamVariant::Annotated,
            frames,
            cache: Some(cache),
            interval,
            budget,
            failures: 0,
            sent: 0,
        }
    }

    pub fn variant(&self) -> StreamVariant {
        self.variant
    }

    /// Parts written so far.
    pub fn frames_sent(&self) -> u64 {
        self.sent
    }

    /// Iterations that fell back after a failure.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Image bytes for the next part.
    pub fn next_payload(&mut self) -> Vec<u8> {
        let sourced = self.frames.latest();
        let cache = match (self.variant, &self.cache) {
            (StreamVariant::Annotated, Some(cache)) => Arc::clone(cache),
            _ => return sourced.frame.jpeg().to_vec(),
        };
        if sourced.tier != FrameTier::Live {
            return sourced.frame.jpeg().to_vec();
        }
        let result = cache
            .acquire()
            .and_then(|active| active.infer_within(&sourced.frame, self.budget));
        match result {
            Ok(inference) => inference.annotated,
            Err(err) => {
                self.failures += 1;
                if self.failures == 1 || self.failures % WARN_EVERY == 0 {
                    log::warn!(
                        "annotated stream degraded to placeholder ({} failures): {}",
                        self.failures,
                        err
                    );
                }
                self.frames.fallback().frame.jpeg().to_vec()
            }
        }
    }

    /// One multipart part, boundary included.
    pub fn next_chunk(&mut self) -> Vec<u8> {
        encode_part(&self.next_payload())
    }

    /// Emit parts at the configured cadence until cancelled or the sink fails.
    pub fn run<W: Write>(&mut self, sink: &mut W, cancel: &AtomicBool) -> StreamExit {
        loop {
            if cancel.load(Ordering::SeqCst) {
                return StreamExit::Cancelled;
            }
            let started = Instant::now();
            let chunk = self.next_chunk();
            if let Err(err) = write_chunk(sink, &chunk) {
                log::debug!(
                    "{:?} stream client went away after {} parts: {}",
                    self.variant,
                    self.sent,
                    err
                );
                return StreamExit::Disconnected;
            }
            self.sent += 1;
            if let Some(rest) = self.interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }
}

pub fn encode_part(payload: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(payload.len() + 64);
    part.extend_from_slice(b"--");
    part.extend_from_slice(BOUNDARY.as_bytes());
    part.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(payload);
    part.extend_from_slice(b"\r\n");
    part
}

fn write_chunk<W: Write>(sink: &mut W, chunk: &[u8]) -> io::Result<()> {
    sink.write_all(chunk)?;
    sink.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSettings;
    use crate::detect::{BoundingBox, ModelRegistry, PersonBox, ScriptedLoader};
    use crate::frame::tests::solid_png;
    use crate::frame::FrameSlot;
    use crate::storage::Store;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn placeholder_source() -> (tempfile::TempDir, Arc<FrameSlot>, FrameSource, Vec<u8>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let placeholder = dir.path().join("placeholder.png");
        std::fs::write(&placeholder, solid_png(6, 6, [0, 0, 255])).expect("placeholder");
        let slot = Arc::new(FrameSlot::new());
        let source = FrameSource::new(Arc::clone(&slot), &placeholder);
        let expected = source.placeholder().expect("placeholder").jpeg().to_vec();
        (dir, slot, source, expected)
    }

    fn cache_with(loader: ScriptedLoader) -> Arc<ModelCache> {
        let store = Arc::new(Store::open(":memory:", 0.5).expect("store"));
        store.seed_models(["best", "yolov8n"]).expect("seed");
        let mut assets = BTreeMap::new();
        assets.insert("best".to_string(), PathBuf::from("best.onnx"));
        assets.insert("yolov8n".to_string(), PathBuf::from("yolov8n.onnx"));
        let settings = ModelSettings {
            assets,
            default_type: "best".to_string(),
            fallback_asset: PathBuf::from("best.onnx"),
            default_confidence: 0.5,
        };
        Arc::new(ModelCache::new(
            ModelRegistry::new(store, "best"),
            settings,
            Arc::new(loader),
        ))
    }

    #[test]
    fn chunk_framing() {
        assert_eq!(
            encode_part(b"abc"),
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nabc\r\n".to_vec()
        );
    }

    #[test]
    fn empty_slot_emits_placeholder() {
        let (_dir, _slot, source, expected) = placeholder_source();
        let mut raw = StreamEncoder::raw(source, Duration::from_millis(1));
        assert_eq!(raw.next_payload(), expected);
    }

    #[test]
    fn inference_failure_degrades_to_placeholder() {
        let (_dir, slot, source, expected) = placeholder_source();
        slot.publish(solid_png(6, 6, [200, 200, 200]));
        let cache = cache_with(ScriptedLoader::new().with_failing_asset("best.onnx"));
        let mut encoder = StreamEncoder::annotated(
            source,
            cache,
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        assert_eq!(encoder.next_payload(), expected);
        assert_eq!(encoder.next_payload(), expected);
        assert_eq!(encoder.failures(), 2);
    }

    #[test]
    fn slow_inference_keeps_cadence() {
        let (_dir, slot, source, expected) = placeholder_source();
        slot.publish(solid_png(6, 6, [200, 200, 200]));
        let cache = cache_with(
            ScriptedLoader::new().with_slow_asset("best.onnx", Duration::from_millis(1500)),
        );
        let mut encoder = StreamEncoder::annotated(
            source,
            cache,
            Duration::from_millis(1),
            Duration::from_millis(100),
        );
        let started = Instant::now();
        assert_eq!(encoder.next_payload(), expected);
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(encoder.failures(), 1);
    }

    #[test]
    fn hot_swap_applies_on_next_frame() {
        let (_dir, slot, source, _) = placeholder_source();
        slot.publish(solid_png(32, 32, [10, 10, 10]));
        let boxed = |confidence: f32| PersonBox {
            bbox: BoundingBox {
                x1: 2.0,
                y1: 2.0,
                x2: 20.0,
                y2: 20.0,
            },
            confidence,
        };
        let loader = ScriptedLoader::new()
            .with_asset("best.onnx", vec![])
            .with_asset("yolov8n.onnx", vec![boxed(0.75)]);
        let cache = cache_with(loader.clone());
        let mut encoder = StreamEncoder::annotated(
            source.clone(),
            Arc::clone(&cache),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        let live = source.live().expect("live frame");
        assert_eq!(encoder.next_payload(), live.jpeg().to_vec());

        let yolo = cache
            .registry()
            .list()
            .expect("list")
            .into_iter()
            .find(|m| m.model_type == "yolov8n")
            .expect("seeded");
        cache
            .registry()
            .select_with_confidence(yolo.id, 0.7)
            .expect("select");
        let annotated = encoder.next_payload();
        assert_ne!(annotated, live.jpeg().to_vec());
        let active = cache.acquire().expect("acquire");
        assert_eq!(active.asset_path, PathBuf::from("yolov8n.onnx"));
        assert_eq!(active.threshold, 0.7);
        assert_eq!(
            loader.loads(),
            vec![PathBuf::from("best.onnx"), PathBuf::from("yolov8n.onnx")]
        );
    }

    #[test]
    fn run_stops_on_disconnect_and_cancel() {
        let (_dir, _slot, source, _) = placeholder_source();
        let cancel = AtomicBool::new(false);
        let mut encoder = StreamEncoder::raw(source.clone(), Duration::from_millis(1));
        assert_eq!(
            encoder.run(&mut FailingSink, &cancel),
            StreamExit::Disconnected
        );

        cancel.store(true, Ordering::SeqCst);
        let mut sink = Vec::new();
        let mut encoder = StreamEncoder::raw(source, Duration::from_millis(1));
        assert_eq!(encoder.run(&mut sink, &cancel), StreamExit::Cancelled);
        assert!(sink.is_empty());
    }
}
