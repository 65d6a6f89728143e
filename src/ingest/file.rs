//! Handoff-file frame producer.
//!
//! An external camera process keeps overwriting a single JPEG on disk. This
//! producer polls it and publishes each new version into the `FrameSlot`, so the
//! file is read by exactly one thread.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::ProducerHandle;
use crate::frame::{is_complete_image, FrameSlot};

const WARN_EVERY: u64 = 50;

#[derive(Clone, Debug)]
pub struct FileHandoffConfig {
    pub path: PathBuf,
    pub poll_interval: Duration,
    /// Empty the slot when the file disappears instead of keeping the last frame.
    pub clear_on_missing: bool,
}

impl FileHandoffConfig {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            clear_on_missing: false,
        }
    }
}

pub struct FileHandoffProducer {
    config: FileHandoffConfig,
    slot: Arc<FrameSlot>,
    last_seen: Option<(u64, Option<SystemTime>)>,
    misses: u64,
    incomplete: u64,
    published: u64,
}

impl FileHandoffProducer {
    pub fn new(config: FileHandoffConfig, slot: Arc<FrameSlot>) -> Self {
        Self {
            config,
            slot,
            last_seen: None,
            misses: 0,
            incomplete: 0,
            published: 0,
        }
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Check the file once. Returns true when a new frame was published.
    pub fn poll_once(&mut self) -> Result<bool> {
        let meta = match std::fs::metadata(&self.config.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.on_missing();
                return Ok(false);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("stat handoff file {}", self.config.path.display())
                })
            }
        };
        let stamp = (meta.len(), meta.modified().ok());
        if self.last_seen == Some(stamp) {
            return Ok(false);
        }
        let bytes = read_handoff(&self.config.path)?;
        if !is_complete_image(&bytes) {
            // Writer is mid-rewrite: keep the previous frame and retry next poll.
            self.incomplete += 1;
            if self.incomplete == 1 || self.incomplete % WARN_EVERY == 0 {
                log::debug!(
                    "frame handoff {} incomplete ({} bytes, {} times)",
                    self.config.path.display(),
                    bytes.len(),
                    self.incomplete
                );
            }
            return Ok(false);
        }
        self.last_seen = Some(stamp);
        self.misses = 0;
        self.slot.publish(bytes);
        self.published += 1;
        Ok(true)
    }

    pub fn spawn(mut self) -> Result<ProducerHandle> {
        log::info!(
            "watching frame handoff {} every {} ms",
            self.config.path.display(),
            self.config.poll_interval.as_millis()
        );
        ProducerHandle::spawn("file-handoff", move |stop: Arc<AtomicBool>| {
            let mut errors = 0u64;
            while !stop.load(Ordering::SeqCst) {
                if let Err(err) = self.poll_once() {
                    errors += 1;
                    if errors == 1 || errors % WARN_EVERY == 0 {
                        log::warn!("frame handoff poll failed ({} times): {:#}", errors, err);
                    }
                }
                std::thread::sleep(self.config.poll_interval);
            }
            log::info!(
                "frame handoff producer stopped after {} frames",
                self.published
            );
        })
    }

    fn on_missing(&mut self) {
        self.misses += 1;
        if self.misses == 1 {
            log::debug!("frame handoff {} missing", self.config.path.display());
        }
        if self.config.clear_on_missing && self.last_seen.take().is_some() {
            self.slot.clear();
        }
    }
}

fn read_handoff(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read handoff file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::solid_png;
    use crate::frame::{canonicalize, FrameSource};

    #[test]
    fn publishes_only_on_change() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("image.jpg");
        let slot = Arc::new(FrameSlot::new());
        let mut producer = FileHandoffProducer::new(
            FileHandoffConfig::new(&path, Duration::from_millis(5)),
            Arc::clone(&slot),
        );

        assert!(!producer.poll_once()?);
        std::fs::write(&path, solid_png(4, 4, [0, 0, 0]))?;
        assert!(producer.poll_once()?);
        assert!(!producer.poll_once()?);
        let second = solid_png(8, 8, [9, 9, 9]);
        std::fs::write(&path, &second)?;
        assert!(producer.poll_once()?);
        let (bytes, generation) = slot.latest().expect("frame");
        assert_eq!(&bytes[..], &second[..]);
        assert_eq!(generation, 2);
        Ok(())
    }

    #[test]
    fn half_written_frame_keeps_previous_one() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("image.jpg");
        let slot = Arc::new(FrameSlot::new());
        let source = FrameSource::new(Arc::clone(&slot), dir.path().join("placeholder.png"));
        let mut producer = FileHandoffProducer::new(
            FileHandoffConfig::new(&path, Duration::from_millis(5)),
            Arc::clone(&slot),
        );

        let full = canonicalize(&solid_png(16, 16, [40, 80, 120]))?.jpeg().to_vec();
        std::fs::write(&path, &full)?;
        assert!(producer.poll_once()?);
        assert!(source.live().is_ok());

        std::fs::write(&path, &full[..full.len() / 2])?;
        assert!(!producer.poll_once()?);
        let (bytes, generation) = slot.latest().expect("frame");
        assert_eq!(&bytes[..], &full[..]);
        assert_eq!(generation, 1);
        assert!(source.live().is_ok());

        let next = solid_png(32, 32, [1, 2, 3]);
        std::fs::write(&path, &next)?;
        assert!(producer.poll_once()?);
        assert_eq!(slot.generation(), 2);
        Ok(())
    }

    #[test]
    fn missing_file_keeps_or_clears_last_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("image.jpg");
        std::fs::write(&path, solid_png(4, 4, [0, 0, 0]))?;

        let slot = Arc::new(FrameSlot::new());
        let mut keep = FileHandoffProducer::new(
            FileHandoffConfig::new(&path, Duration::from_millis(5)),
            Arc::clone(&slot),
        );
        keep.poll_once()?;
        std::fs::remove_file(&path)?;
        keep.poll_once()?;
        assert!(slot.latest().is_some());

        std::fs::write(&path, solid_png(4, 4, [0, 0, 0]))?;
        let mut config = FileHandoffConfig::new(&path, Duration::from_millis(5));
        config.clear_on_missing = true;
        let mut clear = FileHandoffProducer::new(config, Arc::clone(&slot));
        clear.poll_once()?;
        std::fs::remove_file(&path)?;
        clear.poll_once()?;
        assert!(slot.latest().is_none());
        Ok(())
    }

    #[test]
    fn spawned_producer_stops() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("image.jpg");
        std::fs::write(&path, solid_png(4, 4, [0, 0, 0]))?;
        let slot = Arc::new(FrameSlot::new());
        let handle = FileHandoffProducer::new(
            FileHandoffConfig::new(&path, Duration::from_millis(2)),
            Arc::clone(&slot),
        )
        .spawn()?;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while slot.latest().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        handle.stop()?;
        assert!(slot.latest().is_some());
        Ok(())
    }
}
