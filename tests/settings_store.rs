use std::sync::Mutex;

use tempfile::NamedTempFile;

use traffic_scan::config::{DetectionPolicy, Settings, SettingsStore};
use traffic_scan::SourceKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TRAFFIC_SCAN_CONFIG",
        "TRAFFIC_SCAN_SOURCE",
        "TRAFFIC_SCAN_OUTPUT",
        "TRAFFIC_SCAN_MODEL",
        "TRAFFIC_SCAN_SEGMENT_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn missing_file_writes_defaults() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("nested").join("config.json");
    let store = SettingsStore::new(&path);

    let settings = store.load().expect("load settings");

    assert_eq!(settings, Settings::default());
    let written = std::fs::read_to_string(&path).expect("defaults written");
    let reloaded: Settings = serde_json::from_str(&written).expect("valid json");
    assert_eq!(reloaded, Settings::default());
}

#[test]
fn empty_or_corrupt_file_gives_defaults_without_overwriting() {
    for contents in ["", "   \n", "{ not json"] {
        let mut file = NamedTempFile::new().expect("temp config");
        std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
        let store = SettingsStore::new(file.path());

        let settings = store.load().expect("load settings");

        assert_eq!(settings, Settings::default());
        let after = std::fs::read_to_string(file.path()).expect("read back");
        assert_eq!(after, contents, "bad settings file must be left alone");
    }
}

#[test]
fn save_then_load_keeps_every_field() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = SettingsStore::new(dir.path().join("config.json"));
    let settings = Settings {
        video_path: "/data/junction.mp4".to_string(),
        rtsp_url: "rtsp://user:pw@10.0.0.5/live".to_string(),
        output_folder: "/data/out".to_string(),
        yolo_model_path: "/models/yolov8n.onnx".to_string(),
        segment_length_sec: 12.0,
        screen_duration_sec: 90,
        rtsp_duration_sec: 600,
        source: SourceKind::Screen,
        screen_device: Some(":1.0".to_string()),
        on_detection_error: DetectionPolicy::Skip,
    };

    store.save(&settings).expect("save settings");

    assert_eq!(store.load().expect("load settings"), settings);
}

#[test]
fn loads_settings_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "video_path": "/data/junction.mp4",
        "output_folder": "/data/out",
        "yolo_model_path": "/models/yolov8n.onnx",
        "segment_length_sec": 30,
        "source": "file"
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("TRAFFIC_SCAN_CONFIG", file.path());
    std::env::set_var("TRAFFIC_SCAN_SOURCE", "rtsp");
    std::env::set_var("TRAFFIC_SCAN_SEGMENT_SECS", "15");

    let settings = Settings::load().expect("load settings");

    assert_eq!(settings.video_path, "/data/junction.mp4");
    assert_eq!(settings.output_folder, "/data/out");
    assert_eq!(settings.yolo_model_path, "/models/yolov8n.onnx");
    assert_eq!(settings.source, SourceKind::Rtsp);
    assert_eq!(settings.segment_length_sec, 15.0);
    assert_eq!(settings.on_detection_error, DetectionPolicy::Abort);

    clear_env();
}

#[test]
fn invalid_env_override_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    std::env::set_var("TRAFFIC_SCAN_CONFIG", dir.path().join("config.json"));
    std::env::set_var("TRAFFIC_SCAN_SEGMENT_SECS", "0");
    assert!(Settings::load().is_err());

    std::env::set_var("TRAFFIC_SCAN_SEGMENT_SECS", "ten");
    assert!(Settings::load().is_err());

    clear_env();
}
