//! Webcam capture for the attendance scanner, via the `v4l` crate.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;
const MAX_PROBED_DEVICES: u32 = 16;
/// errno for a device held open elsewhere.
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    Missing(String),
    #[error("camera {0} is in use by another process")]
    Busy(String),
    #[error("cannot open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("{0} cannot capture video")]
    NotCapture(String),
    #[error("format negotiation failed: {0}")]
    Negotiation(String),
    #[error("camera delivers {0}; supported formats are YUYV, GREY, Y16 and RGB3")]
    UnsupportedFormat(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
}

/// A capture-capable device found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera may hand back after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2, requested by default.
    Yuyv,
    Grey,
    /// Little-endian 16-bit luma.
    Y16,
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            b"RGB3" => Some(Self::Rgb3),
            _ => None,
        }
    }

    fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, frame::FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
            Self::Y16 => frame::y16_to_rgb(buf, width, height),
            Self::Rgb3 => frame::rgb24_to_rgb(buf, width, height),
        }
    }
}

/// An open webcam. Dropping it releases the device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and ask for `width`×`height` YUYV. The driver may
    /// answer with a different size or another supported layout; the
    /// negotiated values are what the camera reports afterwards.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let device = open_capture_device(device_path)?;

        let mut requested = device
            .format()
            .map_err(|e| CameraError::Negotiation(format!("reading current format: {e}")))?;
        requested.fourcc = FourCC::new(b"YUYV");
        requested.width = width;
        requested.height = height;

        let granted = device
            .set_format(&requested)
            .map_err(|e| CameraError::Negotiation(format!("requesting {width}x{height} YUYV: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(granted.fourcc)
            .ok_or_else(|| CameraError::UnsupportedFormat(granted.fourcc.to_string()))?;

        if (granted.width, granted.height) != (width, height) {
            tracing::warn!(
                requested = %format!("{width}x{height}"),
                granted = %format!("{}x{}", granted.width, granted.height),
                "camera substituted the frame size"
            );
        }
        tracing::info!(
            device = device_path,
            width = granted.width,
            height = granted.height,
            format = ?pixel_format,
            "camera ready"
        );

        Ok(Self {
            device,
            width: granted.width,
            height: granted.height,
            device_path: device_path.to_string(),
            fourcc: granted.fourcc,
            pixel_format,
        })
    }

    /// Start memory-mapped streaming.
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::Stream(format!("mapping buffers: {e}")))?;
        Ok(FrameStream { camera: self, stream })
    }

    /// Capture-capable devices among `/dev/video0` .. `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_PROBED_DEVICES)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

fn open_capture_device(path: &str) -> Result<Device, CameraError> {
    if !Path::new(path).exists() {
        return Err(CameraError::Missing(path.to_string()));
    }

    let device = Device::with_path(path).map_err(|e| match e.raw_os_error() {
        Some(code) if code == EBUSY => CameraError::Busy(path.to_string()),
        _ => CameraError::Open {
            path: path.to_string(),
            reason: e.to_string(),
        },
    })?;

    let caps = device.query_caps().map_err(|e| CameraError::Open {
        path: path.to_string(),
        reason: format!("querying capabilities: {e}"),
    })?;
    tracing::debug!(device = path, driver = %caps.driver, card = %caps.card, "opened device");

    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return Err(CameraError::NotCapture(path.to_string()));
    }
    Ok(device)
}

/// Frames from a streaming [`Camera`], converted to RGB.
pub struct FrameStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameStream<'_> {
    /// Block until the driver hands over the next frame.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::Stream(format!("dequeueing buffer: {e}")))?;
        let image = self
            .camera
            .pixel_format
            .decode(buf, self.camera.width, self.camera.height)?;

        Ok(Frame {
            image,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Read and drop `count` frames while exposure settles.
    pub fn discard(&mut self, count: usize) -> Result<(), CameraError> {
        (0..count).try_for_each(|_| self.next_frame().map(drop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"RGB3")), Some(PixelFormat::Rgb3));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_decode_dispatches_on_format() {
        let grey = PixelFormat::Grey.decode(&[10, 20], 2, 1).unwrap();
        assert_eq!(grey.get_pixel(1, 0), &image::Rgb([20, 20, 20]));

        let rgb = PixelFormat::Rgb3.decode(&[1, 2, 3], 1, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &image::Rgb([1, 2, 3]));

        assert!(PixelFormat::Yuyv.decode(&[0; 3], 2, 1).is_err());
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-rollcall-missing", 640, 480).err().unwrap();
        assert!(matches!(err, CameraError::Missing(_)));
    }
}
