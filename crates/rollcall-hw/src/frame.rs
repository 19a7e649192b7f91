//! Frame type and pixel-format conversion to packed RGB.

use image::RgbImage;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("YUYV frame of {width}x{height} has an odd pixel count")]
    OddPixelCount { width: u32, height: u32 },
    #[error("{width}x{height} frame cannot hold {len} RGB bytes")]
    SizeMismatch { width: u32, height: u32, len: usize },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn into_image(width: u32, height: u32, rgb: Vec<u8>) -> Result<RgbImage, FrameError> {
    let len = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::SizeMismatch { width, height, len })
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    [
        (y + 1.402 * v).round().clamp(0.0, 255.0) as u8,
        (y - 0.344 * u - 0.714 * v).round().clamp(0.0, 255.0) as u8,
        (y + 1.772 * u).round().clamp(0.0, 255.0) as u8,
    ]
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V], sharing chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    if pixels % 2 != 0 {
        return Err(FrameError::OddPixelCount { width, height });
    }
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..pixels * 2].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        rgb.extend_from_slice(&yuv_to_rgb(chunk[0] as f32, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(chunk[2] as f32, u, v));
    }
    into_image(width, height, rgb)
}

/// Replicate 8-bit grayscale into all three channels.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", gray, pixels)?;
    let rgb = gray[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    into_image(width, height, rgb)
}

/// Downscale 16-bit little-endian grayscale to 8 bits and replicate.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("Y16", buf, pixels * 2)?;
    let rgb = buf[..pixels * 2]
        .chunks_exact(2)
        .flat_map(|px| {
            let g = (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8;
            [g, g, g]
        })
        .collect();
    into_image(width, height, rgb)
}

/// Copy packed 24-bit RGB, dropping any trailing driver padding.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let len = (width * height * 3) as usize;
    check_len("RGB3", buf, len)?;
    into_image(width, height, buf[..len].to_vec())
}
