//! Frame type and pixel conversions: YUYV/GREY/Y16 to RGB, dark detection.

use image::{Rgb, RgbImage};

/// A captured camera frame in RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let n = (self.image.width() * self.image.height()) as f32;
        if n == 0.0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p.0)).sum::<f32>() / n
    }
}

fn luma([r, g, b]: [u8; 3]) -> f32 {
    0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }

    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (f32::from(chunk[1]) - 128.0, f32::from(chunk[3]) - 128.0);
        for y in [chunk[0], chunk[2]] {
            let y = f32::from(y);
            data.push(clamp_u8(y + 1.402 * v));
            data.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            data.push(clamp_u8(y + 1.772 * u));
        }
    }

    RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength { expected, actual: yuyv.len() })
}

/// Replicate an 8-bit grey plane into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: grey.len() });
    }
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let v = grey[(y * width + x) as usize];
        Rgb([v, v, v])
    }))
}

/// 16-bit little-endian grey, keeping the high byte.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    if buf.len() < pixels * 2 {
        return Err(FrameError::InvalidLength { expected: pixels * 2, actual: buf.len() });
    }
    let grey: Vec<u8> = buf[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect();
    grey_to_rgb(&grey, width, height)
}

/// True if more than `threshold_pct` of pixels have luma under 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = (image.width() * image.height()) as usize;
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| luma(p.0) < 32.0).count();
    (dark as f32 / total as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
