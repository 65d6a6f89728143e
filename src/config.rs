use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "ahon.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_HANDOFF_PATH: &str = "image.jpg";
const DEFAULT_PLACEHOLDER_PATH: &str = "placeholder.jpg";
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_RAW_FPS: u32 = 10;
const DEFAULT_ANNOTATED_FPS: u32 = 10;
const DEFAULT_INFERENCE_BUDGET_MS: u64 = 1000;
const DEFAULT_MODEL_TYPE: &str = "best";
const DEFAULT_FALLBACK_ASSET: &str = "best.onnx";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_SNAPSHOT_DIR: &str = "media/snapshots";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    frames: Option<FramesConfigFile>,
    stream: Option<StreamConfigFile>,
    models: Option<ModelsConfigFile>,
    snapshots: Option<SnapshotsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FramesConfigFile {
    handoff_path: Option<PathBuf>,
    placeholder_path: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    raw_fps: Option<u32>,
    annotated_fps: Option<u32>,
    inference_budget_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    assets: Option<BTreeMap<String, PathBuf>>,
    default_type: Option<String>,
    fallback_asset: Option<PathBuf>,
    default_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotsConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub api_addr: String,
    pub frames: FrameSettings,
    pub stream: StreamSettings,
    pub models: ModelSettings,
    pub snapshot_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub handoff_path: PathBuf,
    pub placeholder_path: PathBuf,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub raw_fps: u32,
    pub annotated_fps: u32,
    pub inference_budget: Duration,
}

/// Static model-type → asset mapping plus the designated fallbacks.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub assets: BTreeMap<String, PathBuf>,
    pub default_type: String,
    pub fallback_asset: PathBuf,
    pub default_confidence: f32,
}

impl ModelSettings {
    pub fn asset_for(&self, model_type: &str) -> Option<&Path> {
        self.assets.get(model_type).map(PathBuf::as_path)
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        let mut assets = BTreeMap::new();
        assets.insert("yolov8n".to_string(), PathBuf::from("yolov8n.onnx"));
        assets.insert(
            DEFAULT_MODEL_TYPE.to_string(),
            PathBuf::from(DEFAULT_FALLBACK_ASSET),
        );
        Self {
            assets,
            default_type: DEFAULT_MODEL_TYPE.to_string(),
            fallback_asset: PathBuf::from(DEFAULT_FALLBACK_ASSET),
            default_confidence: DEFAULT_CONFIDENCE,
        }
    }
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AHON_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let frames_file = file.frames.unwrap_or_default();
        let frames = FrameSettings {
            handoff_path: frames_file
                .handoff_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HANDOFF_PATH)),
            placeholder_path: frames_file
                .placeholder_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PLACEHOLDER_PATH)),
            poll_interval: Duration::from_millis(
                frames_file
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
        };
        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            raw_fps: stream_file.raw_fps.unwrap_or(DEFAULT_RAW_FPS),
            annotated_fps: stream_file.annotated_fps.unwrap_or(DEFAULT_ANNOTATED_FPS),
            inference_budget: Duration::from_millis(
                stream_file
                    .inference_budget_ms
                    .unwrap_or(DEFAULT_INFERENCE_BUDGET_MS),
            ),
        };
        let defaults = ModelSettings::default();
        let models_file = file.models.unwrap_or_default();
        let models = ModelSettings {
            assets: models_file.assets.unwrap_or(defaults.assets),
            default_type: models_file.default_type.unwrap_or(defaults.default_type),
            fallback_asset: models_file
                .fallback_asset
                .unwrap_or(defaults.fallback_asset),
            default_confidence: models_file
                .default_confidence
                .unwrap_or(defaults.default_confidence),
        };
        let snapshot_dir = file
            .snapshots
            .and_then(|snapshots| snapshots.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR));
        Ok(Self {
            db_path,
            api_addr,
            frames,
            stream,
            models,
            snapshot_dir,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("AHON_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("AHON_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("AHON_HANDOFF_PATH") {
            if !path.trim().is_empty() {
                self.frames.handoff_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("AHON_PLACEHOLDER_PATH") {
            if !path.trim().is_empty() {
                self.frames.placeholder_path = PathBuf::from(path);
            }
        }
        if let Ok(dir) = std::env::var("AHON_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Ok(confidence) = std::env::var("AHON_DEFAULT_CONFIDENCE") {
            self.models.default_confidence = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("AHON_DEFAULT_CONFIDENCE must be a number in [0, 1]"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.stream.raw_fps == 0 || self.stream.annotated_fps == 0 {
            return Err(anyhow!("stream fps must be greater than zero"));
        }
        if self.stream.inference_budget.is_zero() {
            return Err(anyhow!("inference budget must be greater than zero"));
        }
        validate_confidence(self.models.default_confidence)?;
        if self.models.asset_for(&self.models.default_type).is_none() {
            return Err(anyhow!(
                "default model type '{}' has no asset mapping",
                self.models.default_type
            ));
        }
        Ok(())
    }
}

pub fn validate_confidence(value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("confidence {} outside [0, 1]", value));
    }
    Ok(())
}

/// Frame period for a target rate.
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_millis(1000 / u64::from(fps.max(1)))
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
