//! Capability seams between the scan logic and the outside world.
//!
//! Inference runtimes, cameras, terminals and HTTP clients live behind these
//! traits so the matching core never touches their types.

use crate::crop::crop_face;
use crate::types::{AttendanceRecord, DetectionBox, Embedding};
use image::RgbImage;
use thiserror::Error;

/// Pretrained face detector.
pub trait FaceDetector {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Detect faces, sorted by confidence (highest first).
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectionBox>, Self::Error>;
}

/// Pretrained face embedding model.
pub trait FaceEmbedder {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Side length of the square RGB input the model expects.
    fn input_size(&self) -> u32;

    /// Embed a face crop of exactly `input_size() × input_size()` pixels.
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, Self::Error>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("attendance service answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
}

/// Outbound attendance notification.
pub trait AttendanceReporter {
    fn report(&self, record: &AttendanceRecord) -> Result<(), ReportError>;
}

/// Live frame feed.
pub trait FrameSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn next_frame(&mut self) -> Result<RgbImage, Self::Error>;
}

/// Operator commands on the live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Scan,
    Quit,
}

/// Non-blocking source of operator commands.
pub trait CommandSource {
    fn poll(&mut self) -> Option<Command>;
}

/// Detect the primary face in `frame` and return it padded, cropped and
/// resized to `size`×`size`.
///
/// `Ok(None)` means no usable face was found. Only the highest-confidence
/// detection is considered.
pub fn extract_face<D: FaceDetector>(
    detector: &mut D,
    frame: &RgbImage,
    padding: u32,
    size: u32,
) -> Result<Option<RgbImage>, D::Error> {
    let faces = detector.detect(frame)?;
    let Some(face) = faces.first() else {
        return Ok(None);
    };
    if faces.len() > 1 {
        tracing::debug!(count = faces.len(), "multiple faces detected, using the most confident");
    }

    let (width, height) = frame.dimensions();
    let Some(region) = face.padded_region(padding, width, height) else {
        tracing::debug!(?face, "detection lies outside the frame");
        return Ok(None);
    };

    tracing::debug!(confidence = face.confidence, ?region, "face located");
    Ok(Some(crop_face(frame, region, size)))
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    fn make_box(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> DetectionBox {
        DetectionBox { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_extract_face_no_detection() {
        let frame = RgbImage::new(64, 48);
        let mut detector = FakeDetector::with_faces(vec![]);
        let face = extract_face(&mut detector, &frame, 20, 16).unwrap();
        assert!(face.is_none());
    }

    #[test]
    fn test_extract_face_uses_primary_detection() {
        // Left half red, right half blue; the primary box sits on the blue side.
        let frame = RgbImage::from_fn(200, 100, |x, _| {
            if x < 100 { image::Rgb([255, 0, 0]) } else { image::Rgb([0, 0, 255]) }
        });
        let mut detector = FakeDetector::with_faces(vec![
            make_box(140.0, 40.0, 20.0, 20.0, 0.95),
            make_box(30.0, 40.0, 20.0, 20.0, 0.60),
        ]);

        let face = extract_face(&mut detector, &frame, 5, 16).unwrap().unwrap();
        assert_eq!(face.dimensions(), (16, 16));
        assert_eq!(face.get_pixel(8, 8), &image::Rgb([0, 0, 255]));
    }

    #[test]
    fn test_extract_face_box_outside_frame() {
        let frame = RgbImage::new(64, 48);
        let mut detector = FakeDetector::with_faces(vec![make_box(500.0, 500.0, 10.0, 10.0, 0.9)]);
        assert!(extract_face(&mut detector, &frame, 20, 16).unwrap().is_none());
    }

    #[test]
    fn test_extract_face_propagates_detector_error() {
        let frame = RgbImage::new(64, 48);
        let mut detector = FakeDetector::with_faces(vec![]);
        detector.fail = true;
        assert!(extract_face(&mut detector, &frame, 20, 16).is_err());
    }
}
