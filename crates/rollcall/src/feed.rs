//! Live camera feed for the capture loop.

use image::RgbImage;
use rollcall_core::FrameSource;
use rollcall_hw::{CameraError, FrameStream};

pub struct LiveFeed<'a> {
    stream: FrameStream<'a>,
    last_sequence: Option<u32>,
}

impl<'a> LiveFeed<'a> {
    pub fn new(stream: FrameStream<'a>) -> Self {
        Self {
            stream,
            last_sequence: None,
        }
    }
}

impl FrameSource for LiveFeed<'_> {
    type Error = CameraError;

    fn next_frame(&mut self) -> Result<RgbImage, CameraError> {
        let frame = self.stream.next_frame()?;
        if let Some(last) = self.last_sequence {
            let dropped = frame.sequence.wrapping_sub(last).saturating_sub(1);
            if dropped > 0 {
                tracing::trace!(dropped, sequence = frame.sequence, "driver dropped frames");
            }
        }
        self.last_sequence = Some(frame.sequence);
        Ok(frame.image)
    }
}
