//! ahond - live detection pipeline daemon
//!
//! This daemon:
//! 1. Loads configuration (`AHON_CONFIG` JSON plus `AHON_*` overrides)
//! 2. Opens the database and seeds the model catalog
//! 3. Feeds the frame slot from the handoff file (and an ESP32 camera when configured)
//! 4. Serves the raw/annotated streams, status, capture and model-switch endpoints

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::Arc;

use ahon_pipeline::{
    api::{ApiConfig, ApiServer},
    ingest::{FileHandoffConfig, FileHandoffProducer, ProducerHandle},
    BackendLoader, Pipeline, PipelineConfig,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = PipelineConfig::load()?;
    let pipeline = Arc::new(Pipeline::open(&cfg, Arc::new(BackendLoader))?);
    log::info!(
        "ahond v{} using db {} snapshots {}",
        env!("CARGO_PKG_VERSION"),
        cfg.db_path,
        cfg.snapshot_dir.display()
    );

    let mut producers: Vec<ProducerHandle> = Vec::new();
    let mut handoff = FileHandoffConfig::new(&cfg.frames.handoff_path, cfg.frames.poll_interval);
    handoff.clear_on_missing = std::env::var("AHON_CLEAR_ON_MISSING").is_ok();
    producers.push(FileHandoffProducer::new(handoff, Arc::clone(&pipeline.slot)).spawn()?);
    if let Some(camera) = camera_producer(&pipeline, cfg.stream.raw_fps)? {
        producers.push(camera);
    }

    if let Err(err) = pipeline.cache.acquire() {
        log::warn!("no detector loaded at startup: {}", err);
    }

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        Arc::clone(&pipeline),
    )
    .spawn()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!("ahond waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    for producer in producers {
        let name = producer.name();
        if let Err(err) = producer.stop() {
            log::warn!("{} producer did not stop cleanly: {}", name, err);
        }
    }
    Ok(())
}

#[cfg(feature = "ingest-esp32")]
fn camera_producer(pipeline: &Pipeline, target_fps: u32) -> Result<Option<ProducerHandle>> {
    use ahon_pipeline::ingest::{MjpegConfig, MjpegProducer};

    let Ok(url) = std::env::var("AHON_CAMERA_URL") else {
        return Ok(None);
    };
    let producer = MjpegProducer::new(MjpegConfig { url, target_fps }, Arc::clone(&pipeline.slot))?;
    Ok(Some(producer.spawn()?))
}

#[cfg(not(feature = "ingest-esp32"))]
fn camera_producer(_pipeline: &Pipeline, _target_fps: u32) -> Result<Option<ProducerHandle>> {
    if std::env::var("AHON_CAMERA_URL").is_ok() {
        log::warn!("AHON_CAMERA_URL is set but ahond was built without ingest-esp32");
    }
    Ok(None)
}
