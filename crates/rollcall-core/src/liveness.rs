//! Presentation-attack screening for a single face crop.
//!
//! Four cheap image heuristics are combined with an optional learned score:
//!
//! - **texture**: Laplacian variance. Prints and screens are flatter than skin.
//! - **color**: spread of hue and saturation. Backlit displays are chromatically narrow.
//! - **brightness**: spread of luminance. Screen backlight is uniform.
//! - **screen**: starts at 1.0, penalised for glow, washed-out colour and hard edges.
//!
//! When no learned model is configured its weight is spread across the
//! heuristics in proportion to their own weights.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::edges::canny;
use imageproc::filter::laplacian_filter;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const TEXTURE_SCALE: f64 = 500.0;
const COLOR_SCALE: f64 = 100.0;
const BRIGHTNESS_SCALE: f64 = 50.0;

const GLOW_VALUE: u8 = 180;
const GLOW_FRACTION: f64 = 0.20;
const GLOW_PENALTY: f32 = 0.4;
const DESATURATED_VALUE: u8 = 50;
const DESATURATED_FRACTION: f64 = 0.40;
const DESATURATED_PENALTY: f32 = 0.3;
const EDGE_LOW: f32 = 30.0;
const EDGE_HIGH: f32 = 120.0;
const EDGE_FRACTION: f64 = 0.10;
const EDGE_PENALTY: f32 = 0.3;

// --- Learned model constants ---
const MODEL_INPUT_SIZE: u32 = 128;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("liveness model failed: {0}")]
    Model(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// What to report when scoring itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Treat the face as live (score 0.5).
    #[default]
    FailOpen,
    /// Treat the face as a spoof (score 0.0).
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessWeights {
    pub texture: f32,
    pub color: f32,
    pub brightness: f32,
    pub screen: f32,
    pub model: f32,
}

impl Default for LivenessWeights {
    fn default() -> Self {
        Self { texture: 0.25, color: 0.20, brightness: 0.20, screen: 0.25, model: 0.10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub fail_policy: FailPolicy,
    pub weights: LivenessWeights,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.42,
            fail_policy: FailPolicy::FailOpen,
            weights: LivenessWeights::default(),
        }
    }
}

/// Per-signal scores, each in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessBreakdown {
    pub texture: f32,
    pub color: f32,
    pub brightness: f32,
    pub screen: f32,
    pub model: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    pub score: f32,
    /// Absent when scoring was disabled or failed.
    pub breakdown: Option<LivenessBreakdown>,
    /// Error text when the fail policy decided the verdict.
    pub failure: Option<String>,
}

/// Optional learned liveness estimator. Returns P(live) in [0, 1].
pub trait LivenessModel: Send {
    fn live_probability(&mut self, face: &RgbImage) -> Result<f32, LivenessError>;
}

/// Binary `[spoof, live]` classifier on 128×128 RGB input.
pub struct OnnxLivenessModel {
    session: Session,
}

impl OnnxLivenessModel {
    pub fn load(model_path: &str) -> Result<Self, LivenessError> {
        if !Path::new(model_path).exists() {
            return Err(LivenessError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded liveness model");
        Ok(Self { session })
    }

    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let resized = imageops::resize(face, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, FilterType::Triangle);
        let size = MODEL_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, px) in resized.enumerate_pixels() {
            for c in 0..3 {
                let v = f32::from(px.0[c]) / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
        tensor
    }
}

impl LivenessModel for OnnxLivenessModel {
    fn live_probability(&mut self, face: &RgbImage) -> Result<f32, LivenessError> {
        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LivenessError::Model(format!("logit extraction: {e}")))?;

        match logits {
            [spoof, live, ..] => Ok(softmax_live(*spoof, *live)),
            _ => Err(LivenessError::Model(format!("expected 2 logits, got {}", logits.len()))),
        }
    }
}

fn softmax_live(spoof: f32, live: f32) -> f32 {
    let m = spoof.max(live);
    let (es, el) = ((spoof - m).exp(), (live - m).exp());
    el / (es + el)
}

/// Combines the heuristics (and optional model) into a live/spoof decision.
pub struct LivenessScorer {
    config: LivenessConfig,
    model: Option<Box<dyn LivenessModel>>,
}

impl LivenessScorer {
    pub fn new(config: LivenessConfig, model: Option<Box<dyn LivenessModel>>) -> Self {
        Self { config, model }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Score a face crop. Never fails: internal errors are resolved by the
    /// configured [`FailPolicy`].
    pub fn assess(&mut self, face: &RgbImage) -> LivenessVerdict {
        if !self.config.enabled {
            return LivenessVerdict { is_live: true, score: 1.0, breakdown: None, failure: None };
        }

        match self.score(face) {
            Ok((score, breakdown)) => LivenessVerdict {
                is_live: score >= self.config.threshold,
                score,
                breakdown: Some(breakdown),
                failure: None,
            },
            Err(e) => {
                let (is_live, score) = match self.config.fail_policy {
                    FailPolicy::FailOpen => (true, 0.5),
                    FailPolicy::FailClosed => (false, 0.0),
                };
                tracing::warn!(error = %e, policy = ?self.config.fail_policy, "liveness scoring failed");
                LivenessVerdict { is_live, score, breakdown: None, failure: Some(e.to_string()) }
            }
        }
    }

    fn score(&mut self, face: &RgbImage) -> Result<(f32, LivenessBreakdown), LivenessError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(LivenessError::EmptyCrop);
        }

        let gray = imageops::grayscale(face);
        let hsv = HsvPlanes::from_rgb(face);

        let model = match self.model.as_mut() {
            Some(m) => Some(m.live_probability(face)?.clamp(0.0, 1.0)),
            None => None,
        };

        let breakdown = LivenessBreakdown {
            texture: texture_score(&gray),
            color: color_score(&hsv),
            brightness: brightness_score(&gray),
            screen: screen_score(&gray, &hsv),
            model,
        };

        let w = &self.config.weights;
        let heuristic_sum = w.texture * breakdown.texture
            + w.color * breakdown.color
            + w.brightness * breakdown.brightness
            + w.screen * breakdown.screen;

        let score = match breakdown.model {
            Some(m) => heuristic_sum + w.model * m,
            None => {
                let heuristic_weight = w.texture + w.color + w.brightness + w.screen;
                if heuristic_weight > 0.0 {
                    heuristic_sum * (heuristic_weight + w.model) / heuristic_weight
                } else {
                    0.0
                }
            }
        };

        tracing::trace!(?breakdown, score, "liveness scored");
        Ok((score.clamp(0.0, 1.0), breakdown))
    }
}

/// Hue, saturation and value planes on the 8-bit OpenCV scale
/// (H in 0..180, S and V in 0..=255).
struct HsvPlanes {
    hue: Vec<u8>,
    saturation: Vec<u8>,
    value: Vec<u8>,
}

impl HsvPlanes {
    fn from_rgb(image: &RgbImage) -> Self {
        let n = (image.width() * image.height()) as usize;
        let mut planes = Self {
            hue: Vec::with_capacity(n),
            saturation: Vec::with_capacity(n),
            value: Vec::with_capacity(n),
        };
        for px in image.pixels() {
            let (h, s, v) = rgb_to_hsv(px.0);
            planes.hue.push(h);
            planes.saturation.push(s);
            planes.value.push(v);
        }
        planes
    }
}

fn rgb_to_hsv([r, g, b]: [u8; 3]) -> (u8, u8, u8) {
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = f32::from(v - min);
    if v == 0 || diff == 0.0 {
        return (0, 0, v);
    }

    let s = (diff * 255.0 / f32::from(v)).round() as u8;
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let mut h = if v as f32 == r {
        60.0 * (g - b) / diff
    } else if v as f32 == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    ((h / 2.0).round().min(179.0) as u8, s, v)
}

fn mean_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (mut n, mut sum, mut sum_sq) = (0.0f64, 0.0f64, 0.0f64);
    for v in values {
        n += 1.0;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = sum / n;
    (mean, (sum_sq / n - mean * mean).max(0.0).sqrt())
}

fn fraction(values: &[u8], pred: impl Fn(u8) -> bool) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|&&v| pred(v)).count() as f64 / values.len() as f64
}

fn texture_score(gray: &GrayImage) -> f32 {
    let lap = laplacian_filter(gray);
    let (_, std) = mean_std(lap.pixels().map(|p| f64::from(p.0[0])));
    (std * std / TEXTURE_SCALE).min(1.0) as f32
}

fn color_score(hsv: &HsvPlanes) -> f32 {
    let (_, h_std) = mean_std(hsv.hue.iter().map(|&v| f64::from(v)));
    let (_, s_std) = mean_std(hsv.saturation.iter().map(|&v| f64::from(v)));
    ((h_std + s_std) / COLOR_SCALE).min(1.0) as f32
}

fn brightness_score(gray: &GrayImage) -> f32 {
    let (_, std) = mean_std(gray.pixels().map(|p| f64::from(p.0[0])));
    (std / BRIGHTNESS_SCALE).min(1.0) as f32
}

fn screen_score(gray: &GrayImage, hsv: &HsvPlanes) -> f32 {
    let mut score = 1.0f32;

    if fraction(&hsv.value, |v| v > GLOW_VALUE) > GLOW_FRACTION {
        score -= GLOW_PENALTY;
    }
    if fraction(&hsv.saturation, |s| s < DESATURATED_VALUE) > DESATURATED_FRACTION {
        score -= DESATURATED_PENALTY;
    }

    let edges = canny(gray, EDGE_LOW, EDGE_HIGH);
    if fraction(edges.as_raw(), |e| e > 0) > EDGE_FRACTION {
        score -= EDGE_PENALTY;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct FixedModel(f32);

    impl LivenessModel for FixedModel {
        fn live_probability(&mut self, _face: &RgbImage) -> Result<f32, LivenessError> {
            Ok(self.0)
        }
    }

    struct BrokenModel;

    impl LivenessModel for BrokenModel {
        fn live_probability(&mut self, _face: &RgbImage) -> Result<f32, LivenessError> {
            Err(LivenessError::Model("session lost".into()))
        }
    }

    fn flat_patch() -> RgbImage {
        RgbImage::from_pixel(96, 96, Rgb([128, 128, 128]))
    }

    /// Deterministic high-frequency colour noise.
    fn noisy_patch() -> RgbImage {
        let mut state = 0x2545_f491u32;
        RgbImage::from_fn(96, 96, |_, _| {
            let mut next = || {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            };
            Rgb([next(), next(), next()])
        })
    }

    #[test]
    fn test_rgb_to_hsv_matches_opencv_scale() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), (0, 255, 255));
        assert_eq!(rgb_to_hsv([0, 255, 0]), (60, 255, 255));
        assert_eq!(rgb_to_hsv([0, 0, 255]), (120, 255, 255));
        assert_eq!(rgb_to_hsv([90, 90, 90]), (0, 0, 90));
    }

    #[test]
    fn test_flat_patch_heuristics() {
        let img = flat_patch();
        let gray = imageops::grayscale(&img);
        let hsv = HsvPlanes::from_rgb(&img);
        assert_eq!(texture_score(&gray), 0.0);
        assert_eq!(color_score(&hsv), 0.0);
        assert_eq!(brightness_score(&gray), 0.0);
        // Fully desaturated: only the saturation penalty applies.
        assert!((screen_score(&gray, &hsv) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_bright_flat_patch_gets_glow_penalty() {
        let img = RgbImage::from_pixel(64, 64, Rgb([240, 240, 240]));
        let gray = imageops::grayscale(&img);
        let hsv = HsvPlanes::from_rgb(&img);
        assert!((screen_score(&gray, &hsv) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_flat_patch_is_spoof() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), None);
        let verdict = scorer.assess(&flat_patch());
        assert!(!verdict.is_live);
        // 0.7 * 0.25 redistributed by 1/0.9
        assert!((verdict.score - 0.7 * 0.25 / 0.9).abs() < 1e-4, "score = {}", verdict.score);
        assert!(verdict.breakdown.unwrap().model.is_none());
    }

    #[test]
    fn test_textured_colourful_patch_is_live() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), None);
        let verdict = scorer.assess(&noisy_patch());
        assert!(verdict.is_live, "score = {}", verdict.score);
        let b = verdict.breakdown.unwrap();
        assert!(b.texture > 0.9 && b.brightness > 0.9);
    }

    #[test]
    fn test_model_weight_used_when_present() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), Some(Box::new(FixedModel(1.0))));
        let verdict = scorer.assess(&flat_patch());
        assert!((verdict.score - (0.7 * 0.25 + 0.1)).abs() < 1e-4, "score = {}", verdict.score);
        assert_eq!(verdict.breakdown.unwrap().model, Some(1.0));
    }

    #[test]
    fn test_disabled_is_always_live() {
        let config = LivenessConfig { enabled: false, ..Default::default() };
        let mut scorer = LivenessScorer::new(config, None);
        let verdict = scorer.assess(&flat_patch());
        assert!(verdict.is_live);
        assert_eq!(verdict.score, 1.0);
    }

    #[test]
    fn test_fail_open_on_error() {
        let mut scorer = LivenessScorer::new(LivenessConfig::default(), Some(Box::new(BrokenModel)));
        let verdict = scorer.assess(&flat_patch());
        assert!(verdict.is_live);
        assert_eq!(verdict.score, 0.5);
        assert!(verdict.failure.is_some());
    }

    #[test]
    fn test_fail_closed_on_error() {
        let config = LivenessConfig { fail_policy: FailPolicy::FailClosed, ..Default::default() };
        let mut scorer = LivenessScorer::new(config, None);
        let verdict = scorer.assess(&RgbImage::new(0, 0));
        assert!(!verdict.is_live);
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn test_softmax_live() {
        assert!((softmax_live(0.0, 0.0) - 0.5).abs() < 1e-6);
        assert!(softmax_live(-5.0, 5.0) > 0.99);
        assert!(softmax_live(1000.0, 0.0) < 1e-6);
    }

    #[test]
    fn test_fail_policy_parses_snake_case() {
        let cfg: LivenessConfig = toml::from_str("fail_policy = \"fail_closed\"\nthreshold = 0.5").unwrap();
        assert_eq!(cfg.fail_policy, FailPolicy::FailClosed);
        assert_eq!(cfg.threshold, 0.5);
        assert!(cfg.enabled);
    }
}
