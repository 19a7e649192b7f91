//! rollcall-hw: Webcam capture for the attendance scanner.
//!
//! Opens a V4L2 device and delivers frames as RGB images regardless of the
//! pixel format the driver negotiates.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
