//! Screen capture source.
//!
//! Full-screen snapshots at a nominal 20 frames per second. Capture slots are fixed on the
//! wall clock from the start of capture, and the pacer sleeps until the next slot is due, so
//! a fast grabber never over-samples. After a slow grab or a long pause between reads the
//! overdue slots are taken back to back until capture is on schedule again.

use std::time::{Duration, Instant};

use anyhow::Result;

#[cfg(feature = "screen-ffmpeg")]
use super::ffmpeg::FfmpegCapture;
use super::synthetic::SyntheticFeed;
use super::{is_stub, CaptureClock, FrameSource, SourceKind};
use crate::error::ScanError;
use crate::frame::Frame;

/// Nominal screen capture rate.
pub const SCREEN_FPS: f64 = 20.0;

const ARTIFACT_STEM: &str = "screen_capture";

/// Configuration for a screen source.
#[derive(Clone, Debug, Default)]
pub struct ScreenConfig {
    /// Capture device override (ffmpeg device string) or a `stub://` location.
    /// Defaults to the primary display of the current platform.
    pub device: Option<String>,
    /// Wall-clock capture limit in seconds; 0 captures until cancelled.
    pub duration_sec: u64,
}

/// Fixed-rate capture pacing.
#[derive(Debug)]
pub struct Pacer {
    started: Instant,
    fps: f64,
    ticks: u64,
}

impl Pacer {
    pub fn new(fps: f64) -> Self {
        Self {
            started: Instant::now(),
            fps,
            ticks: 0,
        }
    }

    /// Sleep until the next capture slot. The first call returns immediately.
    pub fn wait(&mut self) {
        let due = self.started + Duration::from_secs_f64(self.ticks as f64 / self.fps);
        self.ticks += 1;
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

/// Screen frame source.
pub struct ScreenSource {
    device: String,
    clock: CaptureClock,
    pacer: Pacer,
    backend: ScreenBackend,
}

enum ScreenBackend {
    Synthetic(SyntheticFeed),
    #[cfg(feature = "screen-ffmpeg")]
    Ffmpeg(FfmpegCapture),
}

impl ScreenSource {
    pub fn open(config: ScreenConfig) -> Result<Self> {
        let device = config
            .device
            .as_deref()
            .map(str::trim)
            .filter(|device| !device.is_empty())
            .map(str::to_string)
            .unwrap_or_else(default_device);

        let backend = if is_stub(&device) {
            let feed = SyntheticFeed::from_location(&device, None)
                .map_err(|e| ScanError::source_unavailable(&device, format!("{e:#}")))?;
            ScreenBackend::Synthetic(feed)
        } else {
            connect_display(&device)
                .map_err(|e| ScanError::source_unavailable(&device, format!("{e:#}")))?
        };

        let source = Self {
            device,
            clock: CaptureClock::start(config.duration_sec),
            pacer: Pacer::new(SCREEN_FPS),
            backend,
        };
        let (width, height) = source.frame_dimensions();
        log::info!(
            "ScreenSource: capturing {} ({}x{} @ {} fps)",
            source.device,
            width,
            height,
            SCREEN_FPS
        );
        Ok(source)
    }
}

#[cfg(feature = "screen-ffmpeg")]
fn connect_display(device: &str) -> Result<ScreenBackend> {
    let framerate = format!("{}", SCREEN_FPS as u32);
    let capture = FfmpegCapture::open_device(
        DEVICE_FORMAT,
        device,
        &[("framerate", framerate.as_str())],
    )?;
    Ok(ScreenBackend::Ffmpeg(capture))
}

#[cfg(not(feature = "screen-ffmpeg"))]
fn connect_display(_device: &str) -> Result<ScreenBackend> {
    anyhow::bail!("screen capture requires the screen-ffmpeg feature")
}

#[cfg(all(feature = "screen-ffmpeg", target_os = "windows"))]
const DEVICE_FORMAT: &str = "gdigrab";
#[cfg(all(feature = "screen-ffmpeg", target_os = "macos"))]
const DEVICE_FORMAT: &str = "avfoundation";
#[cfg(all(
    feature = "screen-ffmpeg",
    not(any(target_os = "windows", target_os = "macos"))
))]
const DEVICE_FORMAT: &str = "x11grab";

#[cfg(target_os = "windows")]
fn default_device() -> String {
    "desktop".to_string()
}

#[cfg(target_os = "macos")]
fn default_device() -> String {
    "1:none".to_string()
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn default_device() -> String {
    std::env::var("DISPLAY")
        .ok()
        .filter(|display| !display.is_empty())
        .unwrap_or_else(|| ":0.0".to_string())
}

impl FrameSource for ScreenSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Screen
    }

    fn location(&self) -> String {
        self.device.clone()
    }

    fn artifact_stem(&self) -> String {
        ARTIFACT_STEM.to_string()
    }

    fn effective_fps(&self) -> f64 {
        SCREEN_FPS
    }

    fn frame_dimensions(&self) -> (u32, u32) {
        match &self.backend {
            ScreenBackend::Synthetic(feed) => feed.dimensions(),
            #[cfg(feature = "screen-ffmpeg")]
            ScreenBackend::Ffmpeg(capture) => capture.dimensions(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.clock.expired() {
            return Ok(None);
        }
        self.pacer.wait();
        match &mut self.backend {
            ScreenBackend::Synthetic(feed) => feed.next_frame(),
            #[cfg(feature = "screen-ffmpeg")]
            ScreenBackend::Ffmpeg(capture) => capture.next_frame(),
        }
    }

    fn frames_captured(&self) -> u64 {
        match &self.backend {
            ScreenBackend::Synthetic(feed) => feed.frames_captured(),
            #[cfg(feature = "screen-ffmpeg")]
            ScreenBackend::Ffmpeg(capture) => capture.frames_captured(),
        }
    }
}
