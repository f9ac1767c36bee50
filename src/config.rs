use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ScanError;
use crate::ingest::SourceKind;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_SEGMENT_LENGTH_SEC: f64 = 30.0;
const MIN_SEGMENT_LENGTH_SEC: f64 = 1.0;

/// What a run does when the detector fails on one segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionPolicy {
    /// Stop the run and report it as failed.
    #[default]
    Abort,
    /// Log the failure, drop that segment's result and keep going.
    Skip,
}

/// Options recognised by a run. Every field has a default so partial files still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub video_path: String,
    pub rtsp_url: String,
    pub output_folder: String,
    pub yolo_model_path: String,
    pub segment_length_sec: f64,
    /// 0 captures until cancelled.
    pub screen_duration_sec: u64,
    /// 0 captures until cancelled or the stream ends.
    pub rtsp_duration_sec: u64,
    pub source: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_device: Option<String>,
    pub on_detection_error: DetectionPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            video_path: String::new(),
            rtsp_url: String::new(),
            output_folder: String::new(),
            yolo_model_path: String::new(),
            segment_length_sec: DEFAULT_SEGMENT_LENGTH_SEC,
            screen_duration_sec: 0,
            rtsp_duration_sec: 0,
            source: SourceKind::File,
            screen_device: None,
            on_detection_error: DetectionPolicy::Abort,
        }
    }
}

impl Settings {
    /// Load from the store named by `TRAFFIC_SCAN_CONFIG` (default `config.json`), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let store = SettingsStore::from_env();
        let mut settings = store.load()?;
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("TRAFFIC_SCAN_SOURCE") {
            if !source.trim().is_empty() {
                self.source = source
                    .parse()
                    .context("TRAFFIC_SCAN_SOURCE is not a known source")?;
            }
        }
        if let Ok(output) = std::env::var("TRAFFIC_SCAN_OUTPUT") {
            if !output.trim().is_empty() {
                self.output_folder = output;
            }
        }
        if let Ok(model) = std::env::var("TRAFFIC_SCAN_MODEL") {
            if !model.trim().is_empty() {
                self.yolo_model_path = model;
            }
        }
        if let Ok(seconds) = std::env::var("TRAFFIC_SCAN_SEGMENT_SECS") {
            self.segment_length_sec = seconds.trim().parse().map_err(|_| {
                anyhow!("TRAFFIC_SCAN_SEGMENT_SECS must be a number of seconds")
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.segment_length_sec.is_finite()
            || self.segment_length_sec < MIN_SEGMENT_LENGTH_SEC
        {
            return Err(anyhow!(
                "segment_length_sec must be at least {} second, got {}",
                MIN_SEGMENT_LENGTH_SEC,
                self.segment_length_sec
            ));
        }
        Ok(())
    }

    /// Location of the active source, for logs.
    pub fn source_location(&self) -> String {
        match self.source {
            SourceKind::File => self.video_path.clone(),
            SourceKind::Rtsp => crate::ingest::redact_credentials(&self.rtsp_url),
            SourceKind::Screen => self
                .screen_device
                .clone()
                .unwrap_or_else(|| "primary display".to_string()),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        if self.output_folder.trim().is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.output_folder)
        }
    }
}

/// Load/save lifecycle of the persisted settings document.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_env() -> Self {
        let path = std::env::var("TRAFFIC_SCAN_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file: defaults are written and returned. Unreadable or empty file: a warning
    /// is logged and defaults are returned, leaving the file as it is.
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            let defaults = Settings::default();
            self.save(&defaults)?;
            log::info!("wrote default settings to {}", self.path.display());
            return Ok(defaults);
        }
        match read_config_file(&self.path) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                log::warn!("{}; using defaults", err);
                Ok(Settings::default())
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(settings).context("serialize settings")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("failed to write settings to {}", self.path.display()))?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> std::result::Result<Settings, ScanError> {
    let unreadable = |reason: String| ScanError::Configuration {
        path: path.to_path_buf(),
        reason,
    };
    let raw = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
    if raw.trim().is_empty() {
        return Err(unreadable("file is empty".to_string()));
    }
    serde_json::from_str(&raw).map_err(|e| unreadable(e.to_string()))
}
