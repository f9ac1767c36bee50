use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Stub backend for testing.
///
/// Configured from a model reference:
/// - `stub://fixed?car=3&truck=1` reports three cars and one truck on every composite
/// - `stub://empty` never finds anything
/// - `stub://fail` fails every call
///
/// `fail_on=N` makes the N-th call (1-based) fail; `confidence=0.2` sets the score of
/// every reported instance (default 0.9); `delay_ms=50` makes every call take that long.
pub struct StubBackend {
    labels: Vec<String>,
    per_class: Vec<u32>,
    confidence: f32,
    always_fail: bool,
    fail_on: Option<u64>,
    delay: Option<Duration>,
    calls: u64,
}

impl StubBackend {
    /// A backend that reports nothing.
    pub fn new() -> Self {
        Self {
            labels: Vec::new(),
            per_class: Vec::new(),
            confidence: 0.9,
            always_fail: false,
            fail_on: None,
            delay: None,
            calls: 0,
        }
    }

    /// A backend that reports the given distribution on every call.
    pub fn fixed<S: Into<String>>(distribution: impl IntoIterator<Item = (S, u32)>) -> Self {
        let mut backend = Self::new();
        for (label, count) in distribution {
            backend.labels.push(label.into());
            backend.per_class.push(count);
        }
        backend
    }

    pub fn from_reference(reference: &str) -> Result<Self> {
        let parsed = url::Url::parse(reference)
            .with_context(|| format!("invalid stub model reference '{}'", reference))?;
        if parsed.scheme() != "stub" {
            bail!("'{}' is not a stub:// model reference", reference);
        }

        let mut backend = Self::new();
        match parsed.host_str().unwrap_or_default() {
            "fixed" | "" => {}
            "empty" => {}
            "fail" => backend.always_fail = true,
            other => bail!("unknown stub detector '{}'", other),
        }

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "fail_on" => {
                    backend.fail_on = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow!("fail_on='{}' is not a number", value))?,
                    )
                }
                "delay_ms" => {
                    let millis: u64 = value
                        .parse()
                        .map_err(|_| anyhow!("delay_ms='{}' is not a number", value))?;
                    backend.delay = Some(Duration::from_millis(millis));
                }
                "confidence" => {
                    backend.confidence = value
                        .parse()
                        .map_err(|_| anyhow!("confidence='{}' is not a number", value))?
                }
                label => {
                    let count = value
                        .parse()
                        .map_err(|_| anyhow!("count for '{}' must be a number, got '{}'", label, value))?;
                    backend.labels.push(label.to_string());
                    backend.per_class.push(count);
                }
            }
        }
        Ok(backend)
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn class_names(&self) -> &[String] {
        &self.labels
    }

    fn infer(&mut self, image: &RgbImage, confidence: f32) -> Result<Vec<Detection>> {
        self.calls += 1;
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.always_fail || self.fail_on == Some(self.calls) {
            bail!("stub detector failure on call {}", self.calls);
        }
        if self.confidence < confidence {
            return Ok(Vec::new());
        }

        let total: u32 = self.per_class.iter().sum();
        let (width, height) = image.dimensions();
        let slot_w = (width as f32 / total.max(1) as f32).max(1.0);
        let box_h = (height as f32 / 2.0).max(1.0);

        let mut detections = Vec::with_capacity(total as usize);
        for (class_id, &count) in self.per_class.iter().enumerate() {
            for _ in 0..count {
                let slot = detections.len() as f32;
                detections.push(Detection {
                    x: slot * slot_w,
                    y: box_h / 2.0,
                    w: slot_w,
                    h: box_h,
                    confidence: self.confidence,
                    class_id,
                });
            }
        }
        Ok(detections)
    }
}
