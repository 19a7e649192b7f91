//! Face detection with an SCRFD ONNX export.
//!
//! Frames are letterboxed onto a 640×640 canvas, the score and distance heads
//! of strides 8/16/32 are decoded, and overlapping boxes are suppressed.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{DetectionBox, FaceDetector};
use std::path::{Path, PathBuf};
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 128.0;
const NMS_IOU: f32 = 0.4;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Minimum score for a candidate box.
pub const SCRFD_DEFAULT_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model {0} does not exist")]
    ModelNotFound(PathBuf),
    #[error("detector model has {0} outputs; need score and bbox heads for three strides")]
    TooFewOutputs(usize),
    #[error("reading {head} output for stride {stride}: {source}")]
    Head {
        head: &'static str,
        stride: u32,
        #[source]
        source: ort::Error,
    },
    #[error("onnx runtime: {0}")]
    Ort(#[from] ort::Error),
}

/// Where the scaled frame sits on the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(frame_width: u32, frame_height: u32) -> Self {
        let side = INPUT_SIZE as f32;
        let scale = (side / frame_width as f32).min(side / frame_height as f32);
        let width = ((frame_width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let height = ((frame_height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            offset_x: (INPUT_SIZE - width) / 2,
            offset_y: (INPUT_SIZE - height) / 2,
            width,
            height,
        }
    }

    /// Model-input coordinates back to frame pixels.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Output positions of one stride's score and bbox tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    stride: u32,
    score: usize,
    bbox: usize,
}

pub struct ScrfdDetector {
    session: Session,
    confidence: f32,
    heads: [StrideHead; 3],
}

impl ScrfdDetector {
    /// Load an SCRFD model. Exports with or without keypoint heads work;
    /// keypoints are ignored.
    pub fn load(model_path: &Path, confidence: f32) -> Result<Self, DetectorError> {
        if !model_path.is_file() {
            return Err(DetectorError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 2 * STRIDES.len() {
            return Err(DetectorError::TooFewOutputs(names.len()));
        }
        let heads = locate_heads(&names);

        tracing::info!(
            path = %model_path.display(),
            outputs = names.len(),
            ?heads,
            confidence,
            "face detector loaded"
        );

        Ok(Self {
            session,
            confidence,
            heads,
        })
    }

    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<DetectionBox>, DetectorError> {
        let (input, letterbox) = to_input_tensor(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for head in &self.heads {
            let (_, scores) = outputs[head.score]
                .try_extract_tensor::<f32>()
                .map_err(|source| DetectorError::Head {
                    head: "score",
                    stride: head.stride,
                    source,
                })?;
            let (_, deltas) = outputs[head.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|source| DetectorError::Head {
                    head: "bbox",
                    stride: head.stride,
                    source,
                })?;
            candidates.extend(decode_head(scores, deltas, head.stride, &letterbox, self.confidence));
        }

        Ok(suppress_overlaps(candidates, NMS_IOU))
    }
}

impl FaceDetector for ScrfdDetector {
    type Error = DetectorError;

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectionBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let faces = self.infer(image)?;
        tracing::debug!(count = faces.len(), "faces detected");
        Ok(faces)
    }
}

/// Scale `frame` onto the centre of a zeroed 1×3×640×640 tensor,
/// normalised as `(p - 127.5) / 128`. Zero is also the normalised value of
/// the mean grey, so the border needs no fill.
fn to_input_tensor(frame: &RgbImage) -> (Array4<f32>, Letterbox) {
    let fit = Letterbox::fit(frame.width(), frame.height());
    let scaled = imageops::resize(frame, fit.width, fit.height, FilterType::Triangle);

    let side = INPUT_SIZE as usize;
    let (ox, oy) = (fit.offset_x as usize, fit.offset_y as usize);
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in scaled.enumerate_pixels() {
        for (c, &v) in px.0.iter().enumerate() {
            input[[0, c, oy + y as usize, ox + x as usize]] = (v as f32 - PIXEL_MEAN) / PIXEL_SCALE;
        }
    }
    (input, fit)
}

/// Find `score_<stride>` / `bbox_<stride>` outputs by name, or assume the
/// usual export order (three score tensors, then three bbox tensors).
fn locate_heads(names: &[String]) -> [StrideHead; 3] {
    let position = |name: String| names.iter().position(|n| *n == name);
    let named = STRIDES.map(|stride| {
        Some(StrideHead {
            stride,
            score: position(format!("score_{stride}"))?,
            bbox: position(format!("bbox_{stride}"))?,
        })
    });

    if let [Some(s8), Some(s16), Some(s32)] = named {
        return [s8, s16, s32];
    }
    tracing::debug!(?names, "unnamed detector outputs, assuming positional order");
    [0, 1, 2].map(|i| StrideHead {
        stride: STRIDES[i],
        score: i,
        bbox: i + STRIDES.len(),
    })
}

/// Boxes from one stride whose score exceeds `threshold`. Each grid cell
/// carries two anchors; distances are to the left, top, right and bottom
/// edges in stride units.
fn decode_head(
    scores: &[f32],
    deltas: &[f32],
    stride: u32,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<DetectionBox> {
    let cols = (INPUT_SIZE / stride) as usize;
    let anchors = cols * cols * ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .zip(deltas.chunks_exact(4))
        .take(anchors)
        .enumerate()
        .filter(|&(_, (&score, _))| score > threshold)
        .map(|(i, (&score, d))| {
            let cell = i / ANCHORS_PER_CELL;
            let cx = (cell % cols) as f32 * step;
            let cy = (cell / cols) as f32 * step;
            let (left, top) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
            let (right, bottom) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);
            DetectionBox {
                x: left,
                y: top,
                width: right - left,
                height: bottom - top,
                confidence: score,
            }
        })
        .collect()
}

/// Greedy NMS. The survivors come back ordered by confidence, highest first.
fn suppress_overlaps(mut boxes: Vec<DetectionBox>, max_iou: f32) -> Vec<DetectionBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<DetectionBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| overlap(k, &candidate) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union.
fn overlap(a: &DetectionBox, b: &DetectionBox) -> f32 {
    let w = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
    let h = (a.y + a.height).min(b.y + b.height) - a.y.max(b.y);
    let shared = w.max(0.0) * h.max(0.0);
    let union = a.width * a.height + b.width * b.height - shared;
    if union > 0.0 {
        shared / union
    } else {
        0.0
    }
}
