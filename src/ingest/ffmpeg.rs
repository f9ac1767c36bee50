//! FFmpeg-backed decode shared by the file, RTSP and screen adapters.
//!
//! The adapters differ only in how the input context is opened (container path,
//! network URL with options, or capture device); decoding to packed RGB24 is the same.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use crate::frame::Frame;

pub(crate) struct FfmpegCapture {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    reported_fps: f64,
    eof_sent: bool,
    frame_count: u64,
}

impl FfmpegCapture {
    /// Open a local container.
    pub(crate) fn open_file(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", path))?;
        Self::from_input(input)
    }

    /// Open a network stream; `display` is the credential-free form used in errors.
    pub(crate) fn open_url(url: &str, display: &str, options: &[(&str, &str)]) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input_with_dictionary(&url, dictionary(options))
            .with_context(|| format!("failed to open stream '{}' with ffmpeg", display))?;
        Self::from_input(input)
    }

    /// Open a capture device through an ffmpeg input device format (x11grab, gdigrab, ...).
    pub(crate) fn open_device(
        format_name: &str,
        device: &str,
        options: &[(&str, &str)],
    ) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        ffmpeg::device::register_all();
        let format = ffmpeg::device::input::video()
            .find(|format| format.name() == format_name)
            .ok_or_else(|| anyhow!("ffmpeg input device '{}' is not available", format_name))?;
        let context = ffmpeg::format::open_with(
            &device,
            &ffmpeg::format::Format::Input(format),
            dictionary(options),
        )
        .with_context(|| format!("failed to open {} device '{}'", format_name, device))?;
        match context {
            ffmpeg::format::context::Context::Input(input) => Self::from_input(input),
            ffmpeg::format::context::Context::Output(_) => {
                Err(anyhow!("{} device '{}' opened as output", format_name, device))
            }
        }
    }

    fn from_input(input: ffmpeg::format::context::Input) -> Result<Self> {
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("input has no video track"))?;
        let stream_index = stream.index();
        let reported_fps = rational_to_f64(stream.avg_frame_rate())
            .or_else(|| rational_to_f64(stream.rate()))
            .unwrap_or(0.0);

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;
        if decoder.width() == 0 || decoder.height() == 0 {
            return Err(anyhow!("video track reports no frame size"));
        }

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            reported_fps,
            eof_sent: false,
            frame_count: 0,
        })
    }

    pub(crate) fn reported_fps(&self) -> f64 {
        self.reported_fps
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.decoder.width(), self.decoder.height())
    }

    pub(crate) fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    /// Decode the next frame; `Ok(None)` once the input and the decoder are drained.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let frame = frame_to_rgb(&rgb_frame)?;
                self.frame_count += 1;
                return Ok(Some(frame));
            }
            if self.eof_sent {
                return Ok(None);
            }

            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    self.decoder
                        .send_eof()
                        .context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }
}

fn dictionary<'a>(options: &[(&str, &str)]) -> ffmpeg::Dictionary<'a> {
    let mut dict = ffmpeg::Dictionary::new();
    for (key, value) in options {
        dict.set(key, value);
    }
    dict
}

fn rational_to_f64(rate: ffmpeg::Rational) -> Option<f64> {
    if rate.numerator() <= 0 || rate.denominator() <= 0 {
        return None;
    }
    Some(f64::from(rate))
}

fn frame_to_rgb(frame: &ffmpeg::frame::Video) -> Result<Frame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Frame::from_rgb(width, height, pixels.to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Frame::from_rgb(width, height, pixels)
}
