//! Face crop geometry: padding, clamping and resize to the embedder input.

use crate::types::{CropRegion, DetectionBox};
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Margin added on every side of a detection before cropping.
pub const DEFAULT_FACE_PADDING: u32 = 20;

impl DetectionBox {
    /// Expand the box by `padding` pixels on all sides and clamp it to the frame.
    ///
    /// Returns `None` when nothing of the padded box lies inside the frame.
    pub fn padded_region(&self, padding: u32, frame_width: u32, frame_height: u32) -> Option<CropRegion> {
        let pad = padding as f32;
        let x1 = (self.x - pad).floor().max(0.0);
        let y1 = (self.y - pad).floor().max(0.0);
        let x2 = (self.x + self.width + pad).ceil().min(frame_width as f32);
        let y2 = (self.y + self.height + pad).ceil().min(frame_height as f32);

        if !(x2 > x1 && y2 > y1) {
            return None;
        }

        Some(CropRegion {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }
}

/// Cut `region` out of `frame` and resize it to a `size`×`size` square.
///
/// `region` must come from [`DetectionBox::padded_region`] for the same frame.
pub fn crop_face(frame: &RgbImage, region: CropRegion, size: u32) -> RgbImage {
    let face = imageops::crop_imm(frame, region.x, region.y, region.width, region.height).to_image();
    imageops::resize(&face, size, size, FilterType::Triangle)
}
