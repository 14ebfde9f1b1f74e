//! Face descriptor extraction.
//!
//! [`FaceEmbedder`] is the raw model seam: an aligned 112×112 RGB crop in,
//! an unnormalised vector out. [`Recognizer`] wraps any embedder and owns the
//! contract the rest of the crate relies on: align, equalise luminance,
//! embed, L2-normalise.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::enhance;
use crate::types::{BoundingBox, Descriptor};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Embedder constants ---
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedder produced a zero or non-finite descriptor")]
    DegenerateDescriptor,
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Raw descriptor model. Input is always a 112×112 RGB face crop.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, RecognizerError>;
}

/// ArcFace/SFace-style embedder. The descriptor dimension is whatever the
/// model emits (128 for SFace, 512 for ArcFace r50).
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face embedder"
        );

        Ok(Self { session })
    }

    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, px) in aligned.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (f32::from(px.0[c]) - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }
        tensor
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let input = Self::preprocess(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(RecognizerError::InferenceFailed("model returned an empty embedding".into()));
        }
        Ok(raw.to_vec())
    }
}

/// Descriptor extractor with a guaranteed unit-norm output.
pub struct Recognizer {
    embedder: Box<dyn FaceEmbedder>,
}

impl Recognizer {
    pub fn new(embedder: Box<dyn FaceEmbedder>) -> Self {
        Self { embedder }
    }

    /// Extract a descriptor for `face` inside a full camera frame.
    pub fn extract(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Descriptor, RecognizerError> {
        let aligned = alignment::prepare_face(frame, face);
        self.describe(aligned)
    }

    /// Extract a descriptor from an already-cropped face (enrollment photos).
    pub fn extract_from_crop(&mut self, crop: &RgbImage) -> Result<Descriptor, RecognizerError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(RecognizerError::EmptyCrop);
        }
        self.describe(alignment::resize_to_aligned(crop))
    }

    fn describe(&mut self, mut aligned: RgbImage) -> Result<Descriptor, RecognizerError> {
        enhance::equalize_luma(&mut aligned);
        let raw = self.embedder.embed(&aligned)?;
        Descriptor::from_raw(raw).ok_or(RecognizerError::DegenerateDescriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Embeds the mean colour of the crop plus a constant so the output is
    /// never normalised already.
    struct ColorEmbedder;

    impl FaceEmbedder for ColorEmbedder {
        fn embed(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
            assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
            let n = (aligned.width() * aligned.height()) as f32;
            let mut sum = [0.0f32; 3];
            for px in aligned.pixels() {
                for c in 0..3 {
                    sum[c] += f32::from(px.0[c]);
                }
            }
            Ok(vec![sum[0] / n + 1.0, sum[1] / n + 2.0, sum[2] / n + 3.0, 10.0])
        }
    }

    struct ZeroEmbedder;

    impl FaceEmbedder for ZeroEmbedder {
        fn embed(&mut self, _aligned: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
            Ok(vec![0.0; 128])
        }
    }

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 128, 128]));
        let tensor = OnnxEmbedder::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        let expected = (128.0 - EMBEDDER_MEAN) / EMBEDDER_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_extract_is_unit_norm() {
        let mut recognizer = Recognizer::new(Box::new(ColorEmbedder));
        let frame = RgbImage::from_fn(320, 240, |x, y| Rgb([(x % 200) as u8, (y % 180) as u8, 90]));
        let face = BoundingBox { x: 40.0, y: 30.0, width: 100.0, height: 120.0, confidence: 0.9, landmarks: None };
        let d = recognizer.extract(&frame, &face).unwrap();
        assert!((d.norm() - 1.0).abs() < 1e-6);
        assert_eq!(d.dim(), 4);
    }

    #[test]
    fn test_extract_from_crop_resizes_any_size() {
        let mut recognizer = Recognizer::new(Box::new(ColorEmbedder));
        let crop = RgbImage::from_pixel(57, 93, Rgb([20, 140, 60]));
        let d = recognizer.extract_from_crop(&crop).unwrap();
        assert!((d.norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_extract_from_empty_crop_fails() {
        let mut recognizer = Recognizer::new(Box::new(ColorEmbedder));
        let err = recognizer.extract_from_crop(&RgbImage::new(0, 0)).unwrap_err();
        assert!(matches!(err, RecognizerError::EmptyCrop));
    }

    #[test]
    fn test_zero_descriptor_is_rejected() {
        let mut recognizer = Recognizer::new(Box::new(ZeroEmbedder));
        let crop = RgbImage::from_pixel(112, 112, Rgb([100, 100, 100]));
        let err = recognizer.extract_from_crop(&crop).unwrap_err();
        assert!(matches!(err, RecognizerError::DegenerateDescriptor));
    }
}
