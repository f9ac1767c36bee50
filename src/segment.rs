//! Segment accumulation.
//!
//! The accumulator buffers frames until it holds one segment's worth
//! (`segment_length_sec × fps`, floored, at least one frame), then hands the whole
//! buffer off and starts over. A non-empty remainder is retrieved with `flush` once the
//! source is exhausted.

use crate::frame::Frame;

/// Frames per segment for a segment length and effective frame rate.
pub fn segment_capacity(segment_length_sec: f64, fps: f64) -> usize {
    let frames = (segment_length_sec * fps).floor();
    if frames.is_finite() && frames >= 1.0 {
        frames as usize
    } else {
        1
    }
}

/// An ordered run of same-sized frames.
#[derive(Debug)]
pub struct Segment {
    frames: Vec<Frame>,
}

impl Segment {
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

/// Fixed-capacity frame buffer that emits completed segments.
pub struct SegmentAccumulator {
    capacity: usize,
    buffer: Vec<Frame>,
}

impl SegmentAccumulator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append a frame; returns the completed segment when the buffer reaches capacity.
    pub fn push(&mut self, frame: Frame) -> Option<Segment> {
        self.buffer.push(frame);
        if self.buffer.len() >= self.capacity {
            let frames = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity));
            Some(Segment { frames })
        } else {
            None
        }
    }

    /// Hand off whatever is buffered as a final, possibly short, segment.
    pub fn flush(&mut self) -> Option<Segment> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(Segment {
            frames: std::mem::take(&mut self.buffer),
        })
    }
}
