use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::result::Detection;

const PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
];

/// Color used for a class id.
pub fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

/// Copy of `image` with one outline per detection, clipped to the image.
pub fn draw_detections(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut annotated = image.clone();
    let (width, height) = image.dimensions();
    for detection in detections {
        let left = detection.x.max(0.0).min(width.saturating_sub(1) as f32) as i32;
        let top = detection.y.max(0.0).min(height.saturating_sub(1) as f32) as i32;
        let right = (detection.x + detection.w).min(width as f32) as i32;
        let bottom = (detection.y + detection.h).min(height as f32) as i32;
        let box_w = (right - left).max(1) as u32;
        let box_h = (bottom - top).max(1) as u32;
        let rect = Rect::at(left, top).of_size(box_w, box_h);
        draw_hollow_rect_mut(&mut annotated, rect, class_color(detection.class_id));
    }
    annotated
}
