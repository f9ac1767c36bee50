//! Synthetic frame feed behind `stub://` locations.
//!
//! Recognised query parameters:
//! - `width`, `height`: frame size (default 64x48)
//! - `fps`: reported frame rate, before the fallback rule (default 20)
//! - `frames`: frames before end of stream (default: source-specific, may be unbounded)
//! - `fail_at`: frame number whose read fails instead of producing a frame
//! - `unavailable`: refuse to open

use anyhow::{anyhow, Result};

use super::StubParams;
use crate::frame::{Frame, CHANNELS};

const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;
const DEFAULT_FPS: f64 = 20.0;

pub(crate) struct SyntheticFeed {
    pub name: String,
    width: u32,
    height: u32,
    reported_fps: f64,
    total_frames: Option<u64>,
    fail_at: Option<u64>,
    frame_count: u64,
}

impl SyntheticFeed {
    /// Build a feed from stub parameters; `default_frames` applies when `frames` is absent.
    pub(crate) fn from_location(location: &str, default_frames: Option<u64>) -> Result<Self> {
        let params = StubParams::parse(location)?;
        if params.has("unavailable") {
            return Err(anyhow!("synthetic source '{}' refuses to open", params.name));
        }
        let width = params.get::<u32>("width")?.unwrap_or(DEFAULT_WIDTH);
        let height = params.get::<u32>("height")?.unwrap_or(DEFAULT_HEIGHT);
        if width == 0 || height == 0 {
            return Err(anyhow!("synthetic frame size must be non-zero"));
        }
        Ok(Self {
            width,
            height,
            reported_fps: params.get::<f64>("fps")?.unwrap_or(DEFAULT_FPS),
            total_frames: params.get::<u64>("frames")?.or(default_frames),
            fail_at: params.get::<u64>("fail_at")?,
            frame_count: 0,
            name: params.name,
        })
    }

    pub(crate) fn reported_fps(&self) -> f64 {
        self.reported_fps
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self
            .total_frames
            .is_some_and(|total| self.frame_count >= total)
        {
            return Ok(None);
        }
        if self.fail_at == Some(self.frame_count + 1) {
            return Err(anyhow!(
                "synthetic read failure at frame {}",
                self.frame_count + 1
            ));
        }
        self.frame_count += 1;
        Frame::from_rgb(self.width, self.height, self.render()).map(Some)
    }

    /// A dark road with a bright "vehicle" bar sliding right one step per frame.
    fn render(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let bar = (width / 8).max(1);
        let offset = (self.frame_count as usize * 2) % width;

        let mut pixels = vec![0u8; width * height * CHANNELS];
        for (i, px) in pixels.chunks_exact_mut(CHANNELS).enumerate() {
            let x = i % width;
            let y = i / width;
            let inside = (x + width - offset) % width < bar;
            let shade = if inside { 230 } else { 40 + (y % 16) as u8 };
            px.copy_from_slice(&[shade, shade, if inside { 60 } else { shade }]);
        }
        pixels
    }
}
