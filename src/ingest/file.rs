//! Local file frame source.
//!
//! `FileSource` decodes a local container front to back. The frame rate comes from the
//! container metadata and falls back to 20 fps when the reported value is not in
//! `(0, 120]`. Completed segments from a file run are persisted as standalone clips named
//! after the source file.

use std::path::Path;

use anyhow::Result;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::ffmpeg::FfmpegCapture;
use super::synthetic::SyntheticFeed;
use super::{effective_fps, is_stub, FrameSource, SourceKind};
use crate::error::ScanError;
use crate::frame::Frame;

/// Synthetic files hold five seconds of frames at the default rate unless told otherwise.
const SYNTHETIC_DEFAULT_FRAMES: u64 = 100;

/// Configuration for a local file source.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    /// Local file path (e.g., "/data/traffic/junction.mp4"), or a `stub://` location.
    pub path: String,
}

/// Local file frame source.
pub struct FileSource {
    config: FileConfig,
    stem: String,
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticFeed),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegCapture),
}

impl FileSource {
    /// Open the file for decoding.
    ///
    /// Fails with `ScanError::SourceUnavailable` when the path is empty, missing, not a
    /// local path, or cannot be decoded.
    pub fn open(config: FileConfig) -> Result<Self> {
        let path = config.path.trim().to_string();
        if path.is_empty() {
            return Err(ScanError::source_unavailable("<file>", "video path is not set").into());
        }

        let (backend, stem) = if is_stub(&path) {
            let feed = SyntheticFeed::from_location(&path, Some(SYNTHETIC_DEFAULT_FRAMES))
                .map_err(|e| ScanError::source_unavailable(&path, format!("{e:#}")))?;
            let stem = feed.name.clone();
            (FileBackend::Synthetic(feed), stem)
        } else {
            if path.contains("://") {
                return Err(ScanError::source_unavailable(
                    &path,
                    "file ingestion only supports local paths",
                )
                .into());
            }
            if !Path::new(&path).is_file() {
                return Err(ScanError::source_unavailable(&path, "no such file").into());
            }
            let stem = Path::new(&path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "video".to_string());
            (connect_decoder(&path)?, stem)
        };

        let source = Self {
            config: FileConfig { path },
            stem,
            backend,
        };
        log::info!(
            "FileSource: opened {} ({}x{} @ {:.2} fps)",
            source.config.path,
            source.frame_dimensions().0,
            source.frame_dimensions().1,
            source.effective_fps()
        );
        Ok(source)
    }

    fn reported_fps(&self) -> f64 {
        match &self.backend {
            FileBackend::Synthetic(feed) => feed.reported_fps(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(capture) => capture.reported_fps(),
        }
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn connect_decoder(path: &str) -> Result<FileBackend> {
    let capture = FfmpegCapture::open_file(path)
        .map_err(|e| ScanError::source_unavailable(path, format!("{e:#}")))?;
    Ok(FileBackend::Ffmpeg(capture))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn connect_decoder(path: &str) -> Result<FileBackend> {
    Err(ScanError::source_unavailable(
        path,
        "file decoding requires the ingest-file-ffmpeg feature",
    )
    .into())
}

impl FrameSource for FileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn location(&self) -> String {
        self.config.path.clone()
    }

    fn artifact_stem(&self) -> String {
        self.stem.clone()
    }

    fn effective_fps(&self) -> f64 {
        effective_fps(self.reported_fps())
    }

    fn frame_dimensions(&self) -> (u32, u32) {
        match &self.backend {
            FileBackend::Synthetic(feed) => feed.dimensions(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(capture) => capture.dimensions(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(feed) => feed.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(capture) => capture.next_frame(),
        }
    }

    fn frames_captured(&self) -> u64 {
        match &self.backend {
            FileBackend::Synthetic(feed) => feed.frames_captured(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(capture) => capture.frames_captured(),
        }
    }
}
