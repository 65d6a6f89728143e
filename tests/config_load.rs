use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use ahon_pipeline::config::PipelineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "AHON_CONFIG",
        "AHON_DB_PATH",
        "AHON_API_ADDR",
        "AHON_HANDOFF_PATH",
        "AHON_PLACEHOLDER_PATH",
        "AHON_SNAPSHOT_DIR",
        "AHON_DEFAULT_CONFIDENCE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "field.db",
        "api": { "addr": "0.0.0.0:9000" },
        "frames": { "handoff_path": "/run/cam/image.jpg", "poll_interval_ms": 20 },
        "stream": { "raw_fps": 15, "annotated_fps": 5, "inference_budget_ms": 400 },
        "models": {
            "assets": { "yolov8n": "models/yolov8n.onnx", "sar": "models/sar.onnx" },
            "default_type": "sar",
            "fallback_asset": "models/sar.onnx",
            "default_confidence": 0.4
        },
        "snapshots": { "dir": "/var/lib/ahon/snapshots" }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("AHON_CONFIG", file.path());
    std::env::set_var("AHON_API_ADDR", "127.0.0.1:8100");
    std::env::set_var("AHON_DEFAULT_CONFIDENCE", "0.65");

    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "field.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:8100");
    assert_eq!(cfg.frames.handoff_path, PathBuf::from("/run/cam/image.jpg"));
    assert_eq!(cfg.frames.placeholder_path, PathBuf::from("placeholder.jpg"));
    assert_eq!(cfg.frames.poll_interval, Duration::from_millis(20));
    assert_eq!(cfg.stream.raw_fps, 15);
    assert_eq!(cfg.stream.annotated_fps, 5);
    assert_eq!(cfg.stream.inference_budget, Duration::from_millis(400));
    assert_eq!(cfg.models.default_type, "sar");
    assert_eq!(cfg.models.default_confidence, 0.65);
    assert_eq!(
        cfg.models.asset_for("yolov8n"),
        Some(std::path::Path::new("models/yolov8n.onnx"))
    );
    assert_eq!(cfg.snapshot_dir, PathBuf::from("/var/lib/ahon/snapshots"));

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "ahon.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:8000");
    assert_eq!(cfg.frames.handoff_path, PathBuf::from("image.jpg"));
    assert_eq!(cfg.models.default_confidence, 0.5);
    assert_eq!(cfg.models.default_type, "best");
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AHON_DEFAULT_CONFIDENCE", "high");
    assert!(PipelineConfig::load().is_err());
    std::env::set_var("AHON_DEFAULT_CONFIDENCE", "1.5");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "stream": { "raw_fps": 0 } }"#)
        .expect("write config");
    std::env::set_var("AHON_CONFIG", file.path());
    assert!(PipelineConfig::load().is_err());
    clear_env();
}
