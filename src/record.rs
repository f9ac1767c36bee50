//! Raw clip persistence.
//!
//! File runs write one clip per completed segment; RTSP and screen runs write one clip
//! for the whole run as frames arrive. With the `record-ffmpeg` feature clips are
//! MPEG-4 in AVI; otherwise they are uncompressed YUV4MPEG2 streams.
//!
//! A `ClipWriter` is finalised by `finish`, or on drop if a run exits early, so the
//! container trailer is always written.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::frame::{Frame, CHANNELS};

/// File extension of clips produced by this build.
pub fn clip_extension() -> &'static str {
    if cfg!(feature = "record-ffmpeg") {
        "avi"
    } else {
        "y4m"
    }
}

pub struct ClipWriter {
    path: PathBuf,
    width: u32,
    height: u32,
    frames: u64,
    backend: Option<ClipBackend>,
}

enum ClipBackend {
    #[cfg_attr(feature = "record-ffmpeg", allow(dead_code))]
    Y4m(BufWriter<File>),
    #[cfg(feature = "record-ffmpeg")]
    Ffmpeg(ffmpeg_clip::FfmpegEncoder),
}

impl ClipWriter {
    pub fn create(path: &Path, fps: f64, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot record {}x{} clip", width, height));
        }
        let backend = open_backend(path, fps, width, height)
            .with_context(|| format!("create clip {}", path.display()))?;
        log::debug!("recording clip {} ({}x{} @ {:.2} fps)", path.display(), width, height, fps);
        Ok(Self {
            path: path.to_path_buf(),
            width,
            height,
            frames: 0,
            backend: Some(backend),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(anyhow!(
                "clip {} expects {}x{} frames, got {}x{}",
                self.path.display(),
                self.width,
                self.height,
                frame.width,
                frame.height
            ));
        }
        match self.backend.as_mut() {
            Some(ClipBackend::Y4m(out)) => write_y4m_frame(out, frame)?,
            #[cfg(feature = "record-ffmpeg")]
            Some(ClipBackend::Ffmpeg(encoder)) => encoder.write(frame, self.frames as i64)?,
            None => return Err(anyhow!("clip {} is already finished", self.path.display())),
        }
        self.frames += 1;
        Ok(())
    }

    /// Flush the encoder and close the file.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.finish_inner()?;
        Ok(self.path.clone())
    }

    fn finish_inner(&mut self) -> Result<()> {
        match self.backend.take() {
            Some(ClipBackend::Y4m(mut out)) => out.flush().context("flush y4m clip")?,
            #[cfg(feature = "record-ffmpeg")]
            Some(ClipBackend::Ffmpeg(mut encoder)) => encoder.finish()?,
            None => {}
        }
        Ok(())
    }
}

impl Drop for ClipWriter {
    fn drop(&mut self) {
        if let Err(err) = self.finish_inner() {
            log::warn!("failed to finalise clip {}: {:#}", self.path.display(), err);
        }
    }
}

/// Write `frames` as one standalone clip.
pub fn write_clip(path: &Path, fps: f64, frames: &[Frame]) -> Result<PathBuf> {
    let first = frames
        .first()
        .ok_or_else(|| anyhow!("no frames to record into {}", path.display()))?;
    let mut writer = ClipWriter::create(path, fps, first.width, first.height)?;
    for frame in frames {
        writer.write(frame)?;
    }
    writer.finish()
}

#[cfg(feature = "record-ffmpeg")]
fn open_backend(path: &Path, fps: f64, width: u32, height: u32) -> Result<ClipBackend> {
    Ok(ClipBackend::Ffmpeg(ffmpeg_clip::FfmpegEncoder::create(
        path, fps, width, height,
    )?))
}

#[cfg(not(feature = "record-ffmpeg"))]
fn open_backend(path: &Path, fps: f64, width: u32, height: u32) -> Result<ClipBackend> {
    let mut out = BufWriter::new(File::create(path)?);
    let (num, den) = fps_ratio(fps);
    write!(out, "YUV4MPEG2 W{width} H{height} F{num}:{den} Ip A1:1 C444\n")?;
    Ok(ClipBackend::Y4m(out))
}

/// Frame rate as a reduced `num:den` pair with millihertz precision.
fn fps_ratio(fps: f64) -> (u64, u64) {
    let num = (fps.max(0.001) * 1000.0).round() as u64;
    let den = 1000;
    let divisor = gcd(num, den);
    (num / divisor, den / divisor)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a.max(1)
    } else {
        gcd(b, a % b)
    }
}

/// One YUV 4:4:4 frame, BT.601 studio range.
fn write_y4m_frame(out: &mut impl Write, frame: &Frame) -> Result<()> {
    let pixels = frame.as_rgb().chunks_exact(CHANNELS);
    let count = frame.as_rgb().len() / CHANNELS;
    let mut planes = vec![0u8; count * 3];
    let (y_plane, rest) = planes.split_at_mut(count);
    let (u_plane, v_plane) = rest.split_at_mut(count);

    for (i, px) in pixels.enumerate() {
        let (r, g, b) = (i32::from(px[0]), i32::from(px[1]), i32::from(px[2]));
        y_plane[i] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;
        u_plane[i] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        v_plane[i] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
    }

    out.write_all(b"FRAME\n")?;
    out.write_all(&planes)?;
    Ok(())
}

#[cfg(feature = "record-ffmpeg")]
mod ffmpeg_clip {
    use std::path::Path;

    use anyhow::{anyhow, Context, Result};
    use ffmpeg_next as ffmpeg;

    use crate::frame::Frame;

    pub(super) struct FfmpegEncoder {
        output: ffmpeg::format::context::Output,
        encoder: ffmpeg::encoder::Video,
        scaler: ffmpeg::software::scaling::Context,
        encoder_time_base: ffmpeg::Rational,
        stream_time_base: ffmpeg::Rational,
        width: u32,
        height: u32,
    }

    impl FfmpegEncoder {
        pub(super) fn create(path: &Path, fps: f64, width: u32, height: u32) -> Result<Self> {
            ffmpeg::init().context("initialize ffmpeg")?;
            let mut output = ffmpeg::format::output(&path).context("open clip output")?;
            let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
                .ok_or_else(|| anyhow!("ffmpeg was built without an MPEG-4 encoder"))?;
            let global_header = output
                .format()
                .flags()
                .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

            let rate = ffmpeg::Rational::from(fps);
            let encoder_time_base = rate.invert();

            let mut stream = output.add_stream(codec).context("add clip stream")?;
            let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
                .encoder()
                .video()
                .context("create clip encoder")?;
            encoder.set_width(width);
            encoder.set_height(height);
            encoder.set_format(ffmpeg::format::Pixel::YUV420P);
            encoder.set_time_base(encoder_time_base);
            encoder.set_frame_rate(Some(rate));
            if global_header {
                encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
            }
            let encoder = encoder.open_as(codec).context("open clip encoder")?;
            stream.set_parameters(&encoder);
            stream.set_time_base(encoder_time_base);

            output.write_header().context("write clip header")?;
            let stream_time_base = output
                .stream(0)
                .map(|stream| stream.time_base())
                .ok_or_else(|| anyhow!("clip stream disappeared after header"))?;

            let scaler = ffmpeg::software::scaling::context::Context::get(
                ffmpeg::format::Pixel::RGB24,
                width,
                height,
                ffmpeg::format::Pixel::YUV420P,
                width,
                height,
                ffmpeg::software::scaling::flag::Flags::BILINEAR,
            )
            .context("create clip scaler")?;

            Ok(Self {
                output,
                encoder,
                scaler,
                encoder_time_base,
                stream_time_base,
                width,
                height,
            })
        }

        pub(super) fn write(&mut self, frame: &Frame, pts: i64) -> Result<()> {
            let mut rgb = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, self.width, self.height);
            let row_bytes = self.width as usize * 3;
            let stride = rgb.stride(0);
            let data = rgb.data_mut(0);
            for (y, row) in frame.as_rgb().chunks_exact(row_bytes).enumerate() {
                data[y * stride..y * stride + row_bytes].copy_from_slice(row);
            }

            let mut yuv = ffmpeg::frame::Video::empty();
            self.scaler.run(&rgb, &mut yuv).context("convert frame to YUV")?;
            yuv.set_pts(Some(pts));
            self.encoder.send_frame(&yuv).context("encode clip frame")?;
            self.drain()
        }

        pub(super) fn finish(&mut self) -> Result<()> {
            self.encoder.send_eof().context("flush clip encoder")?;
            self.drain()?;
            self.output.write_trailer().context("write clip trailer")?;
            Ok(())
        }

        fn drain(&mut self) -> Result<()> {
            let mut packet = ffmpeg::Packet::empty();
            while self.encoder.receive_packet(&mut packet).is_ok() {
                packet.set_stream(0);
                packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
                packet
                    .write_interleaved(&mut self.output)
                    .context("write clip packet")?;
            }
            Ok(())
        }
    }
}
