use serde::Serialize;
use std::path::PathBuf;

/// Bounding box for a detected face, in pixel coordinates of the source frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Integer crop rectangle guaranteed to lie inside its source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Face embedding vector (128-dimensional for the stock FaceNet export).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1].
    ///
    /// Returns `None` when the score is undefined: either vector has zero
    /// magnitude, the dimensions differ, or the arithmetic is not finite.
    pub fn similarity(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 && denom.is_finite() {
            let sim = dot / denom;
            sim.is_finite().then_some(sim)
        } else {
            None
        }
    }
}

/// One known identity in the gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    /// Registration number, taken verbatim from the reference image's file stem.
    pub identity: String,
    pub embedding: Embedding,
    /// Reference image this entry was built from.
    pub source: PathBuf,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Matched identity, or the best-scoring identity when nothing cleared the threshold.
    pub identity: Option<String>,
    /// Cosine similarity of `identity` (0.0 when no comparison was defined).
    pub similarity: f32,
}

impl MatchResult {
    pub fn none() -> Self {
        Self {
            matched: false,
            identity: None,
            similarity: 0.0,
        }
    }
}

/// Payload posted to the attendance service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub reg_no: String,
    pub subject: String,
}

/// Strategy for comparing a probe embedding against a gallery of known faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Linear scan in gallery order that stops at the first entry whose
/// similarity strictly exceeds the threshold.
///
/// The first qualifying entry wins even when a later entry would score higher.
pub struct FirstAboveThreshold;

impl Matcher for FirstAboveThreshold {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let Some(sim) = probe.similarity(&entry.embedding) else {
                tracing::debug!(identity = %entry.identity, "similarity undefined, skipping");
                continue;
            };
            tracing::debug!(identity = %entry.identity, similarity = sim, "compared");

            if sim > threshold {
                return MatchResult {
                    matched: true,
                    identity: Some(entry.identity.clone()),
                    similarity: sim,
                };
            }

            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((i, sim));
            }
        }

        match best {
            Some((idx, sim)) => MatchResult {
                matched: false,
                identity: Some(gallery[idx].identity.clone()),
                similarity: sim,
            },
            None => MatchResult::none(),
        }
    }
}
