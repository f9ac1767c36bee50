#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::load_labels;
use crate::detect::result::{non_max_suppression, Detection};

/// Square input edge of YOLOv8 exports.
pub const INPUT_SIZE: u32 = 640;

/// IoU above which overlapping boxes of one class are merged.
pub const NMS_IOU: f32 = 0.7;

const LETTERBOX_FILL: Rgb<u8> = Rgb([114, 114, 114]);

/// Tract-based backend for YOLOv8 ONNX exports.
///
/// Expects one input `[1, 3, 640, 640]` (RGB, 0..1) and one output `[1, 4 + classes, anchors]`
/// holding centre-size boxes followed by per-class scores.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    labels: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = INPUT_SIZE as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        let mut backend = Self {
            model,
            labels: Vec::new(),
        };
        let class_count = backend.probe_class_count()?;
        backend.labels = load_labels(model_path, class_count)?;
        log::info!(
            "TractBackend: loaded {} ({} classes)",
            model_path.display(),
            class_count
        );
        Ok(backend)
    }

    fn probe_class_count(&self) -> Result<usize> {
        let blank = RgbImage::from_pixel(INPUT_SIZE, INPUT_SIZE, LETTERBOX_FILL);
        let (input, _) = letterbox(&blank);
        let outputs = self.model.run(tvec!(input.into())).context("ONNX warm-up failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let shape = output.shape();
        if shape.len() != 3 || shape[1] <= 4 {
            return Err(anyhow!(
                "expected a [1, 4 + classes, anchors] output, got {:?}",
                shape
            ));
        }
        Ok(shape[1] - 4)
    }
}

/// Letterbox geometry: `source = (model - pad) / scale`.
#[derive(Clone, Copy, Debug)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Scale into the model square keeping aspect ratio, centred on grey padding.
fn letterbox(image: &RgbImage) -> (Tensor, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
    let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);

    let pad_x = (INPUT_SIZE - scaled_w) / 2;
    let pad_y = (INPUT_SIZE - scaled_h) / 2;
    let mut canvas = RgbImage::from_pixel(INPUT_SIZE, INPUT_SIZE, LETTERBOX_FILL);
    imageops::replace(&mut canvas, &resized, i64::from(pad_x), i64::from(pad_y));

    let side = INPUT_SIZE as usize;
    let tensor = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
    .into_tensor();

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn class_names(&self) -> &[String] {
        &self.labels
    }

    fn infer(&mut self, image: &RgbImage, confidence: f32) -> Result<Vec<Detection>> {
        let (input, geometry) = letterbox(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let predictions = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not three-dimensional")?;

        let (_, rows, anchors) = predictions.dim();
        let (width, height) = image.dimensions();
        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let mut best_class = 0;
            let mut best_score = f32::NEG_INFINITY;
            for class_id in 0..rows.saturating_sub(4) {
                let score = predictions[[0, 4 + class_id, anchor]];
                if score > best_score {
                    best_score = score;
                    best_class = class_id;
                }
            }
            if best_score < confidence {
                continue;
            }

            let cx = predictions[[0, 0, anchor]];
            let cy = predictions[[0, 1, anchor]];
            let w = predictions[[0, 2, anchor]];
            let h = predictions[[0, 3, anchor]];
            let x = ((cx - w / 2.0 - geometry.pad_x) / geometry.scale).clamp(0.0, width as f32);
            let y = ((cy - h / 2.0 - geometry.pad_y) / geometry.scale).clamp(0.0, height as f32);
            detections.push(Detection {
                x,
                y,
                w: (w / geometry.scale).min(width as f32 - x),
                h: (h / geometry.scale).min(height as f32 - y),
                confidence: best_score,
                class_id: best_class,
            });
        }

        Ok(non_max_suppression(detections, NMS_IOU))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tall_composites_are_centred() {
        let image = RgbImage::from_pixel(40, 400, Rgb([255, 255, 255]));
        let (tensor, geometry) = letterbox(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((geometry.scale - 1.6).abs() < 1e-6);
        assert_eq!(geometry.pad_y, 0.0);
        assert_eq!(geometry.pad_x, 288.0);
    }
}
