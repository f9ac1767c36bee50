//! Decoded frames.
//!
//! - `Frame`: one captured image, tightly packed RGB24, never mutated after capture.
//!
//! Sources build frames; the accumulator takes ownership of them and hands whole
//! segments to the line-scan reducer and the clip recorder.

use anyhow::{anyhow, Result};

/// Bytes per pixel for packed RGB24.
pub const CHANNELS: usize = 3;

/// A single decoded RGB frame.
///
/// Pixel data is private so a frame cannot change once it leaves its source.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap packed RGB24 pixels, validating the buffer length against the dimensions.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero, got {width}x{height}"));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Solid-colour frame, mostly useful for tests and synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let pixels = (width as usize) * (height as usize);
        let data = rgb.iter().copied().cycle().take(pixels * CHANNELS).collect();
        Self::from_rgb(width, height, data)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Packed RGB24 pixels, row-major.
    pub fn as_rgb(&self) -> &[u8] {
        &self.data
    }

    /// One pixel row, or `None` when `y` is outside `[0, height)`.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let stride = self.width as usize * CHANNELS;
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}
