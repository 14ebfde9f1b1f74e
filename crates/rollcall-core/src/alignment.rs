//! Face alignment to the canonical 112×112 recognizer input.
//!
//! With landmarks, the face is warped by the least-squares 4-DOF similarity
//! transform (scale, rotation, translation) that maps the detected five
//! points onto the reference template. Without landmarks the box is cropped
//! and resized.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// Side length of an aligned face crop.
pub const ALIGNED_SIZE: u32 = 112;

/// Reference landmark positions for a 112×112 crop.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Closed-form least-squares similarity transform from `src` to `dst`.
///
/// Returns `(a, b, tx, ty)` for
/// ```text
/// x' = a·x − b·y + tx
/// y' = b·x + a·y + ty
/// ```
/// Degenerate input (all source points coincide) yields the identity.
fn similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> (f32, f32, f32, f32) {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (msx, msy) = mean(src);
    let (mdx, mdy) = mean(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut energy = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let (sx, sy) = (sx - msx, sy - msy);
        let (dx, dy) = (dx - mdx, dy - mdy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        energy += sx * sx + sy * sy;
    }

    if energy < 1e-9 {
        return (1.0, 0.0, 0.0, 0.0);
    }

    let a = dot / energy;
    let b = cross / energy;
    let tx = mdx - (a * msx - b * msy);
    let ty = mdy - (b * msx + a * msy);
    (a, b, tx, ty)
}

/// Warp a face into the canonical 112×112 position using its landmarks.
///
/// Pixels that map outside the frame are black.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let (a, b, tx, ty) = similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    let mut out = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);

    match Projection::from_matrix([a, -b, tx, b, a, ty, 0.0, 0.0, 1.0]) {
        Some(projection) => {
            warp_into(frame, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
            out
        }
        None => out,
    }
}

/// Crop `face` out of `frame` and resize it to 112×112.
///
/// The box is clamped to the frame first; a box with no overlap yields a
/// black crop.
pub fn crop_face(frame: &RgbImage, face: &BoundingBox) -> RgbImage {
    match face.clamp_to(frame.width(), frame.height()) {
        Some(b) => {
            let crop = imageops::crop_imm(frame, b.x as u32, b.y as u32, b.width as u32, b.height as u32).to_image();
            resize_to_aligned(&crop)
        }
        None => RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE),
    }
}

/// Resize a pre-cropped face to the recognizer input size.
pub fn resize_to_aligned(face: &RgbImage) -> RgbImage {
    if face.dimensions() == (ALIGNED_SIZE, ALIGNED_SIZE) {
        return face.clone();
    }
    imageops::resize(face, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
}

/// Align with landmarks when available, otherwise crop and resize.
pub fn prepare_face(frame: &RgbImage, face: &BoundingBox) -> RgbImage {
    match &face.landmarks {
        Some(landmarks) => align_face(frame, landmarks),
        None => crop_face(frame, face),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let (a, b, tx, ty) = similarity_transform(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!((a - 1.0).abs() < 1e-4, "a = {a}");
        assert!(b.abs() < 1e-4, "b = {b}");
        assert!(tx.abs() < 1e-3, "tx = {tx}");
        assert!(ty.abs() < 1e-3, "ty = {ty}");
    }

    #[test]
    fn test_scaled_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 + 4.0));
        let (a, b, _, _) = similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((a - 0.5).abs() < 1e-3, "a = {a}");
        assert!(b.abs() < 1e-3, "b = {b}");
    }

    #[test]
    fn test_rotated_transform_maps_points() {
        // Rotate the template 90° about the origin; the inverse must map it back.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (-y + 200.0, x));
        let (a, b, tx, ty) = similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let x = a * sx - b * sy + tx;
            let y = b * sx + a * sy + ty;
            assert!((x - dx).abs() < 1e-2 && (y - dy).abs() < 1e-2, "({x},{y}) vs ({dx},{dy})");
        }
    }

    #[test]
    fn test_degenerate_landmarks_fall_back_to_identity() {
        let src = [(5.0, 5.0); 5];
        assert_eq!(similarity_transform(&src, &REFERENCE_LANDMARKS_112), (1.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_align_face_carries_pixels() {
        // Frame is the template scaled 2×; the aligned interior should be the frame colour.
        let frame = RgbImage::from_pixel(300, 300, Rgb([200, 10, 10]));
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let aligned = align_face(&frame, &src);
        assert_eq!(aligned.get_pixel(56, 56).0, [200, 10, 10]);
    }

    #[test]
    fn test_crop_face_resizes() {
        let frame = RgbImage::from_pixel(320, 240, Rgb([1, 2, 3]));
        let face = BoundingBox {
            x: 100.0, y: 50.0, width: 60.0, height: 80.0,
            confidence: 0.9, landmarks: None,
        };
        let crop = crop_face(&frame, &face);
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(crop.get_pixel(10, 10).0, [1, 2, 3]);
    }
}
