use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detection score reported by the detector.
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersect the box with the frame rectangle.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<BoundingBox> {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = (self.x + self.width).min(frame_width as f32);
        let y2 = (self.y + self.height).min(frame_height as f32);

        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }

        Some(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: self.confidence,
            landmarks: self.landmarks,
        })
    }
}

/// L2-normalise `values` in place. Returns false (leaving the slice untouched)
/// when the norm is zero or not finite.
pub fn l2_normalize(values: &mut [f32]) -> bool {
    let norm = values
        .iter()
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt();

    if !norm.is_finite() || norm <= f64::EPSILON {
        return false;
    }

    for v in values.iter_mut() {
        *v = (f64::from(*v) / norm) as f32;
    }
    true
}

/// Cosine similarity of two vectors in [-1, 1]. Zero vectors and length
/// mismatches compare as 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom) as f32
    } else {
        0.0
    }
}

/// Unit-length face descriptor.
///
/// The only way to build one is through [`Descriptor::from_raw`] or
/// [`Descriptor::mean`], both of which normalise, so every value of this type
/// satisfies ‖v‖₂ = 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// Normalise a raw model output. `None` for empty, zero or non-finite vectors.
    pub fn from_raw(mut values: Vec<f32>) -> Option<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        l2_normalize(&mut values).then_some(Self { values })
    }

    /// Component-wise mean of `samples`, re-normalised.
    ///
    /// `None` when there are no samples, the dimensions disagree, or the
    /// samples cancel out to a zero vector.
    pub fn mean(samples: &[Descriptor]) -> Option<Self> {
        let first = samples.first()?;
        let dim = first.dim();
        if samples.iter().any(|s| s.dim() != dim) {
            return None;
        }

        let mut sum = vec![0.0f64; dim];
        for sample in samples {
            for (acc, &v) in sum.iter_mut().zip(&sample.values) {
                *acc += f64::from(v);
            }
        }
        let count = samples.len() as f64;
        Self::from_raw(sum.into_iter().map(|v| (v / count) as f32).collect())
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt() as f32
    }

    /// Cosine similarity against another descriptor in [-1, 1].
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_normalizes() {
        let d = Descriptor::from_raw(vec![3.0, 4.0]).unwrap();
        assert!((d.values()[0] - 0.6).abs() < 1e-6);
        assert!((d.values()[1] - 0.8).abs() < 1e-6);
        assert!((d.norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_from_raw_rejects_degenerate() {
        assert!(Descriptor::from_raw(vec![]).is_none());
        assert!(Descriptor::from_raw(vec![0.0, 0.0, 0.0]).is_none());
        assert!(Descriptor::from_raw(vec![f32::NAN, 1.0]).is_none());
    }

    #[test]
    fn test_normalization_holds_for_large_dim() {
        let raw: Vec<f32> = (0..128).map(|i| ((i * 37 % 17) as f32 - 8.0) * 0.31).collect();
        let d = Descriptor::from_raw(raw).unwrap();
        assert!((d.norm() - 1.0).abs() < 1e-6, "norm = {}", d.norm());
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Descriptor::from_raw(vec![1.0, 0.0, 0.0]).unwrap();
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_and_opposite() {
        let a = Descriptor::from_raw(vec![1.0, 0.0]).unwrap();
        let b = Descriptor::from_raw(vec![0.0, 1.0]).unwrap();
        let c = Descriptor::from_raw(vec![-1.0, 0.0]).unwrap();
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.similarity(&c) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_and_mismatched() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_mean_renormalizes() {
        let a = Descriptor::from_raw(vec![1.0, 0.0]).unwrap();
        let b = Descriptor::from_raw(vec![0.0, 1.0]).unwrap();
        let m = Descriptor::mean(&[a, b]).unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((m.values()[0] - expected).abs() < 1e-6);
        assert!((m.values()[1] - expected).abs() < 1e-6);
        assert!((m.norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_rejects_cancellation_and_mismatch() {
        let a = Descriptor::from_raw(vec![1.0, 0.0]).unwrap();
        let b = Descriptor::from_raw(vec![-1.0, 0.0]).unwrap();
        assert!(Descriptor::mean(&[a.clone(), b]).is_none());

        let c = Descriptor::from_raw(vec![1.0, 0.0, 0.0]).unwrap();
        assert!(Descriptor::mean(&[a, c]).is_none());
        assert!(Descriptor::mean(&[]).is_none());
    }

    #[test]
    fn test_clamp_to_frame() {
        let b = BoundingBox {
            x: -10.0, y: 20.0, width: 50.0, height: 500.0,
            confidence: 0.9, landmarks: None,
        };
        let c = b.clamp_to(100, 200).unwrap();
        assert_eq!((c.x, c.y, c.width, c.height), (0.0, 20.0, 40.0, 180.0));
    }

    #[test]
    fn test_clamp_outside_frame() {
        let b = BoundingBox {
            x: 150.0, y: 0.0, width: 20.0, height: 20.0,
            confidence: 0.9, landmarks: None,
        };
        assert!(b.clamp_to(100, 100).is_none());
    }
}
