//! Line-scan reducer.
//!
//! Collapses a segment into one composite image: the same pixel row is sampled from
//! every frame, shrunk to a fixed width with area averaging, and the strips are stacked
//! top-to-bottom in capture order. Row `i` of the composite is frame `i` of the segment.

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::error::ScanError;
use crate::frame::{Frame, CHANNELS};

/// The sampled row sits at one quarter of the frame height.
pub const SAMPLE_ROW_DIVISOR: u32 = 4;

/// Per-run sampling geometry, fixed from the first frame the run observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineScan {
    pub sample_row: u32,
    pub target_width: u32,
}

impl LineScan {
    pub fn new(sample_row: u32, target_width: u32) -> Result<Self> {
        if target_width == 0 {
            return Err(anyhow!("line-scan target width must be positive"));
        }
        Ok(Self {
            sample_row,
            target_width,
        })
    }

    /// Geometry for frames of `width`x`height` whose strips shrink by `width_divisor`.
    pub fn for_frame(width: u32, height: u32, width_divisor: u32) -> Self {
        Self {
            sample_row: height / SAMPLE_ROW_DIVISOR,
            target_width: (width / width_divisor.max(1)).max(1),
        }
    }

    pub fn reduce(&self, frames: &[Frame]) -> Result<RgbImage> {
        reduce(frames, self.sample_row, self.target_width)
    }
}

/// Build the composite for `frames`.
///
/// Fails with `ScanError::EmptyInput` when `frames` is empty, and with a plain error when
/// the frames disagree on size or `sample_row` is outside the frame.
pub fn reduce(frames: &[Frame], sample_row: u32, target_width: u32) -> Result<RgbImage> {
    let first = frames.first().ok_or(ScanError::EmptyInput)?;
    if target_width == 0 {
        return Err(anyhow!("line-scan target width must be positive"));
    }
    let (width, height) = first.dimensions();
    if sample_row >= height {
        return Err(anyhow!(
            "sample row {} is outside frame height {}",
            sample_row,
            height
        ));
    }

    let strip_len = target_width as usize * CHANNELS;
    let mut pixels = vec![0u8; strip_len * frames.len()];
    for (i, (frame, strip)) in frames.iter().zip(pixels.chunks_exact_mut(strip_len)).enumerate() {
        if frame.dimensions() != (width, height) {
            return Err(anyhow!(
                "frame {} is {}x{}, segment frames are {}x{}",
                i,
                frame.width,
                frame.height,
                width,
                height
            ));
        }
        let row = frame
            .row(sample_row)
            .ok_or_else(|| anyhow!("frame {} has no row {}", i, sample_row))?;
        resize_row_area(row, strip);
    }

    let rows = u32::try_from(frames.len()).map_err(|_| anyhow!("segment too long"))?;
    RgbImage::from_raw(target_width, rows, pixels)
        .ok_or_else(|| anyhow!("composite buffer does not match {}x{}", target_width, rows))
}

/// Area-averaging resample of one packed RGB row into `dst`.
///
/// Each destination pixel covers `src_w / dst_w` source pixels; partially covered source
/// pixels contribute in proportion to the overlap.
fn resize_row_area(src: &[u8], dst: &mut [u8]) {
    let src_w = src.len() / CHANNELS;
    let dst_w = dst.len() / CHANNELS;
    if src_w == 0 || dst_w == 0 {
        return;
    }
    let scale = src_w as f64 / dst_w as f64;

    for x in 0..dst_w {
        let start = x as f64 * scale;
        let end = start + scale;
        let first = start.floor() as usize;
        let last = (end.ceil() as usize).min(src_w);

        let mut acc = [0f64; CHANNELS];
        let mut covered = 0f64;
        for sx in first..last {
            let weight = end.min(sx as f64 + 1.0) - start.max(sx as f64);
            if weight <= 0.0 {
                continue;
            }
            covered += weight;
            for (c, total) in acc.iter_mut().enumerate() {
                *total += weight * f64::from(src[sx * CHANNELS + c]);
            }
        }

        let out = &mut dst[x * CHANNELS..(x + 1) * CHANNELS];
        for (px, total) in out.iter_mut().zip(acc) {
            *px = if covered > 0.0 {
                (total / covered).round().clamp(0.0, 255.0) as u8
            } else {
                0
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32, seed: u8) -> Frame {
        let mut data = Vec::with_capacity((width * height) as usize * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                let v = (x as u8).wrapping_mul(7).wrapping_add(y as u8).wrapping_add(seed);
                data.extend_from_slice(&[v, v / 2, 255 - v]);
            }
        }
        Frame::from_rgb(width, height, data).unwrap()
    }

    #[test]
    fn composite_has_one_row_per_frame() -> Result<()> {
        let frames: Vec<Frame> = (0..7).map(|i| gradient_frame(64, 48, i)).collect();
        let scan = LineScan::for_frame(64, 48, 8);

        let composite = scan.reduce(&frames)?;
        assert_eq!(composite.height(), 7);
        assert_eq!(composite.width(), 8);
        Ok(())
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = reduce(&[], 0, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::EmptyInput)
        ));
    }

    #[test]
    fn geometry_uses_quarter_height() {
        let scan = LineScan::for_frame(640, 480, 16);
        assert_eq!(scan.sample_row, 120);
        assert_eq!(scan.target_width, 40);

        let tiny = LineScan::for_frame(3, 3, 16);
        assert_eq!(tiny.sample_row, 0);
        assert_eq!(tiny.target_width, 1);
    }

    #[test]
    fn rows_follow_frame_order() -> Result<()> {
        let frames = vec![
            Frame::filled(4, 4, [10, 10, 10])?,
            Frame::filled(4, 4, [200, 100, 50])?,
        ];
        let composite = reduce(&frames, 1, 2)?;
        assert_eq!(composite.get_pixel(0, 0).0, [10, 10, 10]);
        assert_eq!(composite.get_pixel(1, 1).0, [200, 100, 50]);
        Ok(())
    }

    #[test]
    fn area_average_weights_partial_pixels() {
        let src = [0, 0, 0, 90, 90, 90, 180, 180, 180];
        let mut dst = [0u8; 6];
        resize_row_area(&src, &mut dst);
        assert_eq!(dst, [30, 30, 30, 150, 150, 150]);

        let src = [0, 0, 0, 255, 255, 255];
        let mut dst = [0u8; 3];
        resize_row_area(&src, &mut dst);
        assert_eq!(dst, [128, 128, 128]);
    }

    #[test]
    fn sample_row_must_be_inside_frame() -> Result<()> {
        let frames = vec![Frame::filled(4, 4, [1, 2, 3])?];
        assert!(reduce(&frames, 4, 2).is_err());
        Ok(())
    }

    #[test]
    fn mixed_frame_sizes_are_rejected() -> Result<()> {
        let frames = vec![Frame::filled(4, 4, [1, 2, 3])?, Frame::filled(8, 4, [1, 2, 3])?];
        assert!(reduce(&frames, 0, 2).is_err());
        Ok(())
    }
}
