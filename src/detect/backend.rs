use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// # Boundary
///
/// Backends only see the composite handed to `infer` and return instances. They must not
/// write to disk; persisting the composite and its annotated copy is the gateway's job.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Labels indexed by class id.
    fn class_names(&self) -> &[String];

    /// Run inference on one composite, keeping instances at or above `confidence`.
    fn infer(&mut self, image: &RgbImage, confidence: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once when the gateway is opened.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
