//! Frame producers.
//!
//! Producers feed the shared `FrameSlot` from an outside source:
//! - `FileHandoffProducer`: polls a JPEG written by an external camera process
//! - `MjpegProducer` (feature: ingest-esp32): pulls an ESP32 multipart stream
//!
//! Each producer runs on its own thread and hands back a `ProducerHandle`.
//! Consumers never touch the source directly; they only read the slot.

#[cfg(feature = "ingest-esp32")]
pub mod esp32;
pub mod file;

#[cfg(feature = "ingest-esp32")]
pub use esp32::{MjpegConfig, MjpegProducer};
pub use file::{FileHandoffConfig, FileHandoffProducer};

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Running producer thread.
#[derive(Debug)]
pub struct ProducerHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name(format!("producer-{}", name))
            .spawn(move || body(stop_thread))?;
        Ok(Self {
            name,
            stop,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("{} producer thread panicked", self.name))?;
        }
        Ok(())
    }
}
