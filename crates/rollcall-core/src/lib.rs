//! rollcall-core: Face matching and scheduling logic for attendance scans.
//!
//! Detection and embedding models, the camera and the attendance service
//! are reached only through the traits in [`pipeline`].

pub mod crop;
pub mod gallery;
pub mod pipeline;
pub mod scanner;
pub mod schedule;
pub mod types;

pub use gallery::{load_gallery, Gallery, GalleryError};
pub use pipeline::{
    AttendanceReporter, Command, CommandSource, FaceDetector, FaceEmbedder, FrameSource, ReportError,
};
pub use scanner::{CaptureError, CaptureLoop, LoopState, LoopSummary, ScanError, ScanOutcome, ScanSettings, Scanner};
pub use schedule::{Clock, LocalClock, Timetable, TimetableEntry, TimetableError};
pub use types::{
    AttendanceRecord, CropRegion, DetectionBox, Embedding, FirstAboveThreshold, GalleryEntry, MatchResult, Matcher,
};
