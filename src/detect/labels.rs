//! Class label lookup for ONNX detectors.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The 80 COCO labels YOLO checkpoints are usually trained on.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// `<model>.names` next to the model file.
pub fn sidecar_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("names")
}

/// Labels for a model with `class_count` outputs.
///
/// Reads the sidecar when present. Otherwise COCO labels are used, and any class index
/// beyond them is named `class_<id>`.
pub fn load_labels(model_path: &Path, class_count: usize) -> Result<Vec<String>> {
    let sidecar = sidecar_path(model_path);
    let mut labels: Vec<String> = if sidecar.is_file() {
        let text = fs::read_to_string(&sidecar)
            .with_context(|| format!("read labels from {}", sidecar.display()))?;
        parse_names(&text)
    } else {
        if class_count != COCO_CLASSES.len() {
            log::warn!(
                "model {} has {} classes and no {} sidecar; using COCO labels",
                model_path.display(),
                class_count,
                sidecar.display()
            );
        }
        COCO_CLASSES.iter().map(|label| label.to_string()).collect()
    };

    labels.truncate(class_count);
    while labels.len() < class_count {
        labels.push(format!("class_{}", labels.len()));
    }
    Ok(labels)
}

fn parse_names(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
