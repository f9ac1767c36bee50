//! The boundary between a run and the object detector.
//!
//! One gateway holds one loaded detector for the whole run. Each call submits one
//! composite, persists it together with an annotated copy under
//! `<destination>/<artifact stem>_part<segment>/`, and returns per-class counts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use crate::detect::annotate::draw_detections;
use crate::detect::backend::DetectorBackend;
use crate::detect::backends::StubBackend;
use crate::detect::result::{count_by_class, format_counts, ClassCounts};
use crate::error::ScanError;

/// Minimum score for an instance to be counted.
pub const DEFAULT_CONFIDENCE: f32 = 0.3;

pub const ORIGINAL_FILE: &str = "original.jpg";
pub const ANNOTATED_FILE: &str = "detected.jpg";

pub struct DetectionGateway {
    backend: Box<dyn DetectorBackend>,
    confidence: f32,
}

impl DetectionGateway {
    pub fn new(backend: Box<dyn DetectorBackend>) -> Self {
        Self {
            backend,
            confidence: DEFAULT_CONFIDENCE,
        }
    }

    /// Load the detector named by `model_ref` and warm it up.
    pub fn open(model_ref: &str) -> Result<Self> {
        let mut backend = open_backend(model_ref)?;
        backend
            .warm_up()
            .with_context(|| format!("warm up detector {}", model_ref))?;
        log::info!(
            "DetectionGateway: using {} backend for {}",
            backend.name(),
            model_ref
        );
        Ok(Self::new(backend))
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Detect objects on one composite and persist `original.jpg` and `detected.jpg`.
    ///
    /// Detector failures surface as `ScanError::Detection`; they are not retried.
    pub fn detect(
        &mut self,
        image: &RgbImage,
        destination: &Path,
        artifact_name: &str,
        segment_index: usize,
    ) -> Result<ClassCounts> {
        let save_dir = destination.join(part_dir_name(artifact_name, segment_index));
        fs::create_dir_all(&save_dir)
            .with_context(|| format!("create {}", save_dir.display()))?;

        image
            .save(save_dir.join(ORIGINAL_FILE))
            .with_context(|| format!("write composite into {}", save_dir.display()))?;

        let detections = self
            .backend
            .infer(image, self.confidence)
            .map_err(|err| ScanError::Detection {
                segment: segment_index,
                reason: format!("{err:#}"),
            })?;

        draw_detections(image, &detections)
            .save(save_dir.join(ANNOTATED_FILE))
            .with_context(|| format!("write annotated composite into {}", save_dir.display()))?;

        let counts = count_by_class(&detections, self.backend.class_names());
        log::info!(
            "saved results to {} | detected: {}",
            save_dir.display(),
            format_counts(&counts)
        );
        Ok(counts)
    }
}

/// `<stem of artifact_name>_part<segment_index>`.
pub fn part_dir_name(artifact_name: &str, segment_index: usize) -> String {
    let stem = Path::new(artifact_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| artifact_name.to_string());
    format!("{}_part{}", stem, segment_index)
}

/// Directory `detect` writes into for this segment.
pub fn part_dir(destination: &Path, artifact_name: &str, segment_index: usize) -> PathBuf {
    destination.join(part_dir_name(artifact_name, segment_index))
}

/// Resolve a model reference: `stub://` gives the synthetic detector, anything else is an
/// ONNX file path.
pub fn open_backend(model_ref: &str) -> Result<Box<dyn DetectorBackend>> {
    let model_ref = model_ref.trim();
    if model_ref.is_empty() {
        return Err(anyhow!("detector model path is not set"));
    }
    if model_ref.starts_with("stub://") {
        return Ok(Box::new(StubBackend::from_reference(model_ref)?));
    }
    open_model_file(model_ref)
}

#[cfg(feature = "backend-tract")]
fn open_model_file(model_ref: &str) -> Result<Box<dyn DetectorBackend>> {
    Ok(Box::new(crate::detect::backends::TractBackend::new(
        model_ref,
    )?))
}

#[cfg(not(feature = "backend-tract"))]
fn open_model_file(model_ref: &str) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!(
        "loading {} requires the backend-tract feature",
        model_ref
    ))
}
