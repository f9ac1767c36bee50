//! RTSP decode through GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink`.
//! The first sample is pulled while connecting so the frame rate and size are known
//! before the run sizes its segments; it is handed out as the first frame.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use crate::frame::Frame;

/// How long the initial connection may take to deliver its first frame.
const PREROLL_TIMEOUT_SECS: u64 = 10;

pub(crate) struct GstreamerRtsp {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    pending: Option<Frame>,
    reported_fps: f64,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl GstreamerRtsp {
    pub(crate) fn connect(url: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let (location, credentials) = split_credentials(url)?;
        let pipeline_description = format!(
            "rtspsrc name=src location=\"{}\" latency=200 ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=8",
            location
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        if let Some((user, password)) = credentials {
            let src = pipeline
                .by_name("src")
                .context("rtspsrc element missing from pipeline")?;
            src.set_property("user-id", user);
            src.set_property("user-pw", password);
        }

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let playing = pipeline
            .set_state(gstreamer::State::Playing)
            .map(|_| ())
            .context("set RTSP pipeline to Playing");
        reset_on_error(&pipeline, playing)?;

        let preroll = appsink
            .try_pull_sample(gstreamer::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS))
            .ok_or_else(|| {
                anyhow!(
                    "no frames received within {}s of connecting",
                    PREROLL_TIMEOUT_SECS
                )
            })
            .and_then(|sample| sample_to_frame(&sample));
        let (frame, reported_fps) = reset_on_error(&pipeline, preroll)?;
        let (width, height) = frame.dimensions();

        Ok(Self {
            pipeline,
            appsink,
            pending: Some(frame),
            reported_fps,
            width,
            height,
            frame_count: 0,
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

    /// Blocks until the next decoded frame; `Ok(None)` once the stream reports EOS.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.pending.take() {
            self.frame_count += 1;
            return Ok(Some(frame));
        }
        match self.appsink.pull_sample() {
            Ok(sample) => {
                let (frame, _) = sample_to_frame(&sample)?;
                self.frame_count += 1;
                Ok(Some(frame))
            }
            Err(_) if self.appsink.is_eos() => Ok(None),
            Err(err) => Err(anyhow!("pull RTSP sample: {}", err)),
        }
    }
}

impl Drop for GstreamerRtsp {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop RTSP pipeline: {}", err);
        }
    }
}

/// Return the pipeline to `Null` when connecting fails after it started playing.
fn reset_on_error<T>(pipeline: &gstreamer::Pipeline, result: Result<T>) -> Result<T> {
    if result.is_err() {
        if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop RTSP pipeline: {}", err);
        }
    }
    result
}

/// Split `user:password@` out of the URL; rtspsrc takes them, decoded, as properties.
fn split_credentials(url: &str) -> Result<(String, Option<(String, String)>)> {
    let mut parsed = url::Url::parse(url).with_context(|| "parse RTSP URL".to_string())?;
    if parsed.username().is_empty() {
        return Ok((url.to_string(), None));
    }
    let user = decode_userinfo(parsed.username()).context("decode RTSP user name")?;
    let password =
        decode_userinfo(parsed.password().unwrap_or_default()).context("decode RTSP password")?;
    parsed
        .set_username("")
        .map_err(|_| anyhow!("cannot strip user from RTSP URL"))?;
    parsed
        .set_password(None)
        .map_err(|_| anyhow!("cannot strip password from RTSP URL"))?;
    Ok((parsed.to_string(), Some((user, password))))
}

fn decode_userinfo(encoded: &str) -> Result<String> {
    Ok(percent_encoding::percent_decode_str(encoded)
        .decode_utf8()?
        .into_owned())
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<(Frame, f64)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let fps = info.fps();
    let reported_fps = if fps.denom() > 0 {
        f64::from(fps.numer()) / f64::from(fps.denom())
    } else {
        0.0
    };
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((Frame::from_rgb(width, height, pixels)?, reported_fps))
}
