//! ESP32 camera producer.
//!
//! Pulls a `multipart/x-mixed-replace` MJPEG stream (or repeated single-JPEG
//! snapshots when the camera does not stream) and publishes every JPEG into the
//! `FrameSlot`. Connection failures are retried with a capped backoff.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use url::Url;

use super::ProducerHandle;
use crate::config::frame_interval;
use crate::frame::FrameSlot;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct MjpegConfig {
    /// Camera URL, e.g. `http://192.168.4.1:81/stream`.
    pub url: String,
    /// Publish at most this many frames per second.
    pub target_fps: u32,
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            url: "http://192.168.4.1:81/stream".to_string(),
            target_fps: 10,
        }
    }
}

pub struct MjpegProducer {
    config: MjpegConfig,
    slot: Arc<FrameSlot>,
    published: u64,
}

enum CameraStream {
    Multipart(JpegScanner<Box<dyn Read + Send + Sync + 'static>>),
    Snapshot,
}

impl MjpegProducer {
    pub fn new(config: MjpegConfig, slot: Arc<FrameSlot>) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse camera url")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported camera scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        Ok(Self {
            config,
            slot,
            published: 0,
        })
    }

    pub fn spawn(mut self) -> Result<ProducerHandle> {
        log::info!("pulling camera stream from {}", self.config.url);
        ProducerHandle::spawn("esp32-mjpeg", move |stop: Arc<AtomicBool>| {
            let mut backoff = Duration::from_millis(250);
            while !stop.load(Ordering::SeqCst) {
                match self.pump(&stop) {
                    Ok(()) => backoff = Duration::from_millis(250),
                    Err(err) => {
                        log::warn!(
                            "camera stream {} interrupted: {:#}; retrying in {} ms",
                            self.config.url,
                            err,
                            backoff.as_millis()
                        );
                        sleep_unless_stopped(backoff, &stop);
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
            log::info!("camera producer stopped after {} frames", self.published);
        })
    }

    /// Connect once and publish frames until the stream ends or `stop` is set.
    fn pump(&mut self, stop: &AtomicBool) -> Result<()> {
        let mut stream = self.connect()?;
        let min_interval = frame_interval(self.config.target_fps);
        let mut last_publish: Option<Instant> = None;
        while !stop.load(Ordering::SeqCst) {
            let jpeg = match &mut stream {
                CameraStream::Multipart(scanner) => scanner.next_jpeg()?,
                CameraStream::Snapshot => {
                    sleep_unless_stopped(min_interval, stop);
                    fetch_single_jpeg(&self.config.url)?
                }
            };
            let now = Instant::now();
            if let Some(last) = last_publish {
                if now.duration_since(last) < min_interval {
                    continue;
                }
            }
            self.slot.publish(jpeg);
            self.published += 1;
            last_publish = Some(now);
        }
        Ok(())
    }

    fn connect(&self) -> Result<CameraStream> {
        let response = ureq::get(&self.config.url)
            .call()
            .context("connect to camera")?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_ascii_lowercase().contains("multipart") {
            Ok(CameraStream::Multipart(JpegScanner::new(
                response.into_reader(),
            )))
        } else {
            Ok(CameraStream::Snapshot)
        }
    }
}

/// Splits a byte stream into JPEG images on SOI/EOI markers.
pub struct JpegScanner<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> JpegScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    pub fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }
            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
