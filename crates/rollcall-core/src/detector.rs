//! SCRFD face detector via ONNX Runtime.
//!
//! The model sees a 640×640 letterboxed copy of the frame. Each of its three
//! stride heads emits per-anchor scores, box distances and five landmarks;
//! those are decoded back into frame coordinates and de-duplicated with NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const LANDMARK_COUNT: usize = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame has zero width or height")]
    EmptyFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Post-processing knobs for the detector.
#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    /// Minimum anchor score kept before NMS.
    pub score_threshold: f32,
    /// IoU above which the weaker of two boxes is dropped.
    pub nms_iou: f32,
    /// Faces narrower than this (in frame pixels) are discarded; too small to
    /// produce a useful embedding.
    pub min_face_px: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_iou: 0.4,
            min_face_px: 24.0,
        }
    }
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    stride: usize,
    scores: usize,
    boxes: usize,
    landmarks: usize,
}

/// Mapping between frame coordinates and the letterboxed model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    scaled_width: u32,
    scaled_height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            pad_x: (INPUT_SIZE - scaled_width) as f32 / 2.0,
            pad_y: (INPUT_SIZE - scaled_height) as f32 / 2.0,
            scaled_width,
            scaled_height,
        }
    }

    /// Model-input point back to frame coordinates.
    fn to_frame(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [StrideHead; 3],
    options: DetectorOptions,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, options: DetectorOptions) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < STRIDES.len() * 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                output_names.len()
            )));
        }

        let heads = map_stride_heads(&output_names);
        tracing::debug!(?heads, "SCRFD output mapping");

        Ok(Self {
            session,
            heads,
            options,
        })
    }

    /// Detect faces, strongest first.
    pub fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyFrame);
        }

        let letterbox = Letterbox::fit(image.width(), image.height());
        let input = input_tensor(image, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for head in &self.heads {
            let extract = |index: usize, what: &str| {
                outputs[index]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {}: {e}", head.stride))
                    })
            };
            let scores = extract(head.scores, "scores")?;
            let boxes = extract(head.boxes, "boxes")?;
            let landmarks = extract(head.landmarks, "landmarks")?;

            candidates.extend(decode_head(
                head.stride,
                scores,
                boxes,
                landmarks,
                &letterbox,
                self.options.score_threshold,
            ));
        }

        let min_face = self.options.min_face_px;
        let faces: Vec<BoundingBox> = suppress_overlaps(candidates, self.options.nms_iou)
            .into_iter()
            .filter(|face| face.width >= min_face)
            .collect();

        tracing::trace!(faces = faces.len(), "SCRFD detect");
        Ok(faces)
    }
}

/// Letterbox the frame into a normalized 1×3×640×640 tensor.
///
/// Padding holds the mean, which normalizes to 0.0; the gray channel is
/// replicated into R, G and B.
fn input_tensor(image: &GrayImage, letterbox: &Letterbox) -> Array4<f32> {
    let resized = imageops::resize(
        image,
        letterbox.scaled_width,
        letterbox.scaled_height,
        FilterType::Triangle,
    );
    let off_x = letterbox.pad_x.floor() as usize;
    let off_y = letterbox.pad_y.floor() as usize;
    let side = INPUT_SIZE as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let (tx, ty) = (x as usize + off_x, y as usize + off_y);
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = value;
        }
    }
    tensor
}

/// Locate each stride's tensors by name ("score_8", "bbox_16", "kps_32", ...).
///
/// Exports with numeric names use the standard positional layout:
/// scores at 0..3, boxes at 3..6, landmarks at 6..9.
fn map_stride_heads(names: &[String]) -> [StrideHead; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideHead>> = STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideHead {
                stride,
                scores: position("score", stride)?,
                boxes: position("bbox", stride)?,
                landmarks: position("kps", stride)?,
            })
        })
        .collect();

    if let Some(heads) = named {
        return [heads[0], heads[1], heads[2]];
    }

    tracing::info!(?names, "SCRFD outputs unnamed; using positional layout");
    std::array::from_fn(|i| StrideHead {
        stride: STRIDES[i],
        scores: i,
        boxes: i + 3,
        landmarks: i + 6,
    })
}

/// Turn one stride head's raw outputs into candidate boxes in frame space.
fn decode_head(
    stride: usize,
    scores: &[f32],
    boxes: &[f32],
    landmarks: &[f32],
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells_x = INPUT_SIZE as usize / stride;
    let cells_y = INPUT_SIZE as usize / stride;
    let anchors = cells_x * cells_y * ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(anchor, &score)| {
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cells_x) as f32 * step;
            let cy = (cell / cells_x) as f32 * step;

            let dist = boxes.get(anchor * 4..anchor * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame((cx - dist[0] * step, cy - dist[1] * step));
            let (x2, y2) = letterbox.to_frame((cx + dist[2] * step, cy + dist[3] * step));

            let points = landmarks
                .get(anchor * 2 * LANDMARK_COUNT..(anchor + 1) * 2 * LANDMARK_COUNT)
                .map(|kps| {
                    std::array::from_fn(|i| {
                        letterbox.to_frame((cx + kps[i * 2] * step, cy + kps[i * 2 + 1] * step))
                    })
                });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks: points,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; returns survivors strongest first.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
