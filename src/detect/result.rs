use std::collections::BTreeMap;

/// Per-class instance counts for one composite, ordered by label.
pub type ClassCounts = BTreeMap<String, u32>;

/// One detected instance in composite pixel coordinates (top-left origin).
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Tally one occurrence per detection whose class index maps to a known label.
///
/// Duplicates are not merged: three cars are three counts.
pub fn count_by_class(detections: &[Detection], labels: &[String]) -> ClassCounts {
    let mut counts = ClassCounts::new();
    for detection in detections {
        match labels.get(detection.class_id) {
            Some(label) => *counts.entry(label.clone()).or_insert(0) += 1,
            None => log::debug!(
                "ignoring detection with unknown class index {}",
                detection.class_id
            ),
        }
    }
    counts
}

/// Render counts as `label: n, label: n`, or `none` when nothing was found.
pub fn format_counts(counts: &ClassCounts) -> String {
    if counts.is_empty() {
        return "none".to_string();
    }
    counts
        .iter()
        .map(|(label, count)| format!("{}: {}", label, count))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Greedy per-class non-max suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id && existing.iou(&candidate) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
