//! Face detection: the detector capability, the candidate filter, and an
//! SCRFD-style ONNX implementation.
//!
//! The pipeline only ever forwards one face per frame: the highest-scoring
//! candidate that survives the score threshold and the geometry check.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- SCRFD constants ---
const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_FLOOR: f32 = 0.3;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can find faces in an RGB frame.
///
/// Implementations return zero or more candidates. A model that cannot run
/// must return an error, never an empty list.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Candidate filter applied before recognition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Candidates scoring at or below this are dropped.
    pub min_score: f32,
    /// Allowed height/width ratio.
    pub min_aspect: f32,
    pub max_aspect: f32,
    /// Allowed face area as a fraction of the frame area.
    pub min_area_fraction: f32,
    pub max_area_fraction: f32,
    /// Minimum width and height in pixels.
    pub min_side_px: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_score: 0.4,
            min_aspect: 0.6,
            max_aspect: 1.6,
            min_area_fraction: 0.004,
            max_area_fraction: 0.85,
            min_side_px: 30.0,
        }
    }
}

impl DetectionConfig {
    /// Cheap shape check that rejects hands, arms and other non-facial boxes.
    pub fn is_plausible_face(&self, face: &BoundingBox, frame_width: u32, frame_height: u32) -> bool {
        let aspect = face.height / face.width.max(1.0);
        if aspect < self.min_aspect || aspect > self.max_aspect {
            return false;
        }

        let frame_area = (frame_width as f32 * frame_height as f32).max(1.0);
        let fraction = face.area() / frame_area;
        if fraction < self.min_area_fraction || fraction > self.max_area_fraction {
            return false;
        }

        face.width >= self.min_side_px && face.height >= self.min_side_px
    }

    /// Clamp every candidate to the frame, drop weak or implausible ones,
    /// and return the highest-scoring survivor.
    pub fn select_best(
        &self,
        candidates: Vec<BoundingBox>,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<BoundingBox> {
        candidates
            .into_iter()
            .filter(|c| c.confidence > self.min_score)
            .filter_map(|c| c.clamp_to(frame_width, frame_height))
            .filter(|c| self.is_plausible_face(c, frame_width, frame_height))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// Scale and padding applied when letterboxing a frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Map a point from model-input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD-style detector (three strides, two anchors per cell, five landmarks).
pub struct OnnxDetector {
    session: Session,
    /// Per-stride output indices (score, bbox, kps) for strides 8/16/32.
    outputs: [(usize, usize, usize); 3],
}

impl OnnxDetector {
    /// Load the ONNX model from `model_path`.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = output_layout(&names);

        tracing::info!(path = model_path, outputs = ?names, layout = ?outputs, "loaded face detector");

        Ok(Self { session, outputs })
    }

    fn preprocess(frame: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (width, height) = frame.dimensions();
        let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let new_w = ((width as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let size = SCRFD_INPUT_SIZE as usize;
        // Zero after normalisation is the padding value.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, px) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + ox, y as usize + oy);
            if tx >= size || ty >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (f32::from(px.0[c]) - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetector for OnnxDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&(score_idx, bbox_idx, kps_idx), &stride) in self.outputs.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data.to_vec())
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let level = StrideOutputs {
                stride,
                scores: extract(score_idx, "scores")?,
                boxes: extract(bbox_idx, "boxes")?,
                landmarks: extract(kps_idx, "landmarks")?,
            };
            candidates.extend(level.decode(&letterbox, SCRFD_SCORE_FLOOR));
        }

        let kept = suppress_overlaps(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(count = kept.len(), "detector candidates");
        Ok(kept)
    }
}

/// Resolve which output tensor holds what. Named exports (`score_8`,
/// `bbox_16`, `kps_32`, ...) are matched by name; anything else is assumed
/// to use the conventional order: scores, then boxes, then landmarks.
fn output_layout(names: &[String]) -> [(usize, usize, usize); 3] {
    let position = |kind: &str, stride: u32| names.iter().position(|n| *n == format!("{kind}_{stride}"));

    let named: Option<Vec<(usize, usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

/// Raw tensors for one stride level.
struct StrideOutputs {
    stride: u32,
    scores: Vec<f32>,
    boxes: Vec<f32>,
    landmarks: Vec<f32>,
}

impl StrideOutputs {
    fn decode(&self, letterbox: &Letterbox, floor: f32) -> Vec<BoundingBox> {
        let cells = (SCRFD_INPUT_SIZE / self.stride) as usize;
        let step = self.stride as f32;

        self.scores
            .iter()
            .enumerate()
            .take(cells * cells * SCRFD_ANCHORS_PER_CELL)
            .filter(|(_, &score)| score > floor)
            .filter_map(|(idx, &score)| {
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let ax = (cell % cells) as f32 * step;
                let ay = (cell / cells) as f32 * step;

                let d = self.boxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
                let (x2, y2) = letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

                let landmarks = self.landmarks.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression, highest score first.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_geometry_accepts_face_shaped_box() {
        let cfg = DetectionConfig::default();
        assert!(cfg.is_plausible_face(&make_bbox(100.0, 100.0, 100.0, 120.0, 0.9), 640, 480));
    }

    #[test]
    fn test_geometry_rejects_bad_aspect() {
        let cfg = DetectionConfig::default();
        // Tall forearm: h/w = 2.0
        assert!(!cfg.is_plausible_face(&make_bbox(0.0, 0.0, 60.0, 120.0, 0.9), 640, 480));
        // Flat box: h/w = 0.5
        assert!(!cfg.is_plausible_face(&make_bbox(0.0, 0.0, 120.0, 60.0, 0.9), 640, 480));
    }

    #[test]
    fn test_geometry_aspect_bounds_inclusive() {
        let cfg = DetectionConfig::default();
        assert!(cfg.is_plausible_face(&make_bbox(0.0, 0.0, 100.0, 60.0, 0.9), 640, 480));
        assert!(cfg.is_plausible_face(&make_bbox(0.0, 0.0, 100.0, 160.0, 0.9), 640, 480));
    }

    #[test]
    fn test_geometry_rejects_area_extremes() {
        let cfg = DetectionConfig::default();
        // 31x31 in 1920x1080 is ~0.046% of the frame
        assert!(!cfg.is_plausible_face(&make_bbox(0.0, 0.0, 31.0, 31.0, 0.9), 1920, 1080));
        // 95% of a 100x100 frame
        assert!(!cfg.is_plausible_face(&make_bbox(0.0, 0.0, 97.0, 98.0, 0.9), 100, 100));
    }

    #[test]
    fn test_geometry_area_bounds_inclusive() {
        let cfg = DetectionConfig::default();
        // 50x80 in 1000x1000 is exactly 0.4% of the frame
        assert!(cfg.is_plausible_face(&make_bbox(0.0, 0.0, 50.0, 80.0, 0.9), 1000, 1000));
        assert!(!cfg.is_plausible_face(&make_bbox(0.0, 0.0, 50.0, 79.0, 0.9), 1000, 1000));
        // 85x100 in 100x100 is exactly 85%
        assert!(cfg.is_plausible_face(&make_bbox(0.0, 0.0, 85.0, 100.0, 0.9), 100, 100));
        assert!(!cfg.is_plausible_face(&make_bbox(0.0, 0.0, 86.0, 100.0, 0.9), 100, 100));
    }

    #[test]
    fn test_geometry_rejects_small_sides() {
        let cfg = DetectionConfig::default();
        // Area fraction fine for a tiny frame, but under 30px.
        assert!(!cfg.is_plausible_face(&make_bbox(0.0, 0.0, 25.0, 25.0, 0.9), 100, 100));
    }

    #[test]
    fn test_select_best_prefers_highest_valid_score() {
        let cfg = DetectionConfig::default();
        let candidates = vec![
            make_bbox(10.0, 10.0, 100.0, 110.0, 0.7),
            make_bbox(300.0, 10.0, 40.0, 200.0, 0.99), // arm-shaped
            make_bbox(200.0, 200.0, 90.0, 100.0, 0.85),
            make_bbox(400.0, 200.0, 90.0, 100.0, 0.35), // under score threshold
        ];
        let best = cfg.select_best(candidates, 640, 480).unwrap();
        assert!((best.confidence - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_select_best_score_threshold_is_exclusive() {
        let cfg = DetectionConfig::default();
        assert!(cfg.select_best(vec![make_bbox(10.0, 10.0, 100.0, 110.0, 0.4)], 640, 480).is_none());
    }

    #[test]
    fn test_select_best_clamps_boxes() {
        let cfg = DetectionConfig::default();
        let best = cfg
            .select_best(vec![make_bbox(-20.0, 10.0, 120.0, 110.0, 0.9)], 640, 480)
            .unwrap();
        assert_eq!(best.x, 0.0);
        assert_eq!(best.width, 100.0);
    }

    #[test]
    fn test_select_best_empty() {
        assert!(DetectionConfig::default().select_best(vec![], 640, 480).is_none());
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        let b = make_bbox(200.0, 200.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_overlaps() {
        let kept = suppress_overlaps(
            vec![
                make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        let (x, y) = (100.0f32, 50.0f32);
        let (rx, ry) = lb.unmap(x * lb.scale + lb.pad_x, y * lb.scale + lb.pad_y);
        assert!((rx - x).abs() < 1e-3 && (ry - y).abs() < 1e-3);
    }

    #[test]
    fn test_output_layout_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();
        assert_eq!(output_layout(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_output_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(output_layout(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_single_anchor() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let cells = (SCRFD_INPUT_SIZE / 32) as usize;
        let anchors = cells * cells * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        // Cell (row 1, col 2), first anchor.
        let idx = (cells + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        let mut boxes = vec![0.0; anchors * 4];
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let level = StrideOutputs { stride: 32, scores, boxes, landmarks: vec![0.0; anchors * 10] };

        let out = level.decode(&lb, 0.5);
        assert_eq!(out.len(), 1);
        let b = &out[0];
        assert_eq!((b.x, b.y, b.width, b.height), (32.0, 0.0, 64.0, 64.0));
        assert_eq!(b.landmarks.unwrap()[0], (64.0, 32.0));
    }
}
