//! Illumination normalisation ahead of descriptor extraction.
//!
//! Faces are converted to YCbCr, the luma plane gets contrast-limited
//! adaptive histogram equalisation (CLAHE), and the chroma planes are left
//! alone so skin tone survives.

use image::RgbImage;

/// Tile grid used for face crops (8×8, matching a 112×112 crop into 14px tiles).
pub const FACE_TILES: u32 = 8;
/// Clip limit as a multiple of the mean histogram bin height.
pub const FACE_CLIP_LIMIT: f32 = 2.0;

/// Equalise the luminance of an RGB image in place.
pub fn equalize_luma(image: &mut RgbImage) {
    let (width, height) = image.dimensions();
    let mut luma = Vec::with_capacity((width * height) as usize);
    let mut chroma = Vec::with_capacity((width * height) as usize);

    for px in image.pixels() {
        let [r, g, b] = px.0;
        let (y, cb, cr) = rgb_to_ycbcr(r, g, b);
        luma.push(y.round().clamp(0.0, 255.0) as u8);
        chroma.push((cb, cr));
    }

    clahe(&mut luma, width, height, FACE_TILES, FACE_CLIP_LIMIT);

    for ((px, &y), &(cb, cr)) in image.pixels_mut().zip(&luma).zip(&chroma) {
        px.0 = ycbcr_to_rgb(f32::from(y), cb, cr);
    }
}

/// BT.601 full-range conversion.
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (y, cb, cr)
}

fn ycbcr_to_rgb(y: f32, cb: f32, cr: f32) -> [u8; 3] {
    let r = y + 1.402 * (cr - 128.0);
    let g = y - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0);
    let b = y + 1.772 * (cb - 128.0);
    [to_u8(r), to_u8(g), to_u8(b)]
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Contrast-limited adaptive histogram equalisation on an 8-bit plane.
///
/// The plane is split into a `tiles × tiles` grid. Each tile's histogram is
/// clipped at `clip_limit × (tile_pixels / 256)` with the excess spread
/// evenly over all bins, then turned into a lookup table. Pixels are mapped
/// by bilinear interpolation between the four nearest tile tables.
/// Planes smaller than one pixel per tile are left untouched.
pub fn clahe(plane: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let (w, h, n) = (width as usize, height as usize, tiles as usize);
    if n == 0 || w < n || h < n || plane.len() < w * h {
        return;
    }

    let tile_w = w / n;
    let tile_h = h / n;
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0).ceil() as u32).max(1);

    let luts: Vec<[u8; 256]> = (0..n * n)
        .map(|t| {
            let (row, col) = (t / n, t % n);
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for &p in &plane[y * w + col * tile_w..y * w + (col + 1) * tile_w] {
                    hist[p as usize] += 1;
                }
            }
            tile_lut(&mut hist, clip, tile_pixels)
        })
        .collect();

    // Tile-centre coordinates, clamped so the border regions reuse edge tiles.
    let locate = |pos: usize, tile: usize| -> (usize, usize, f32) {
        let f = (pos as f32 + 0.5) / tile as f32 - 0.5;
        let f = f.clamp(0.0, (n - 1) as f32);
        let lo = f.floor() as usize;
        let hi = (lo + 1).min(n - 1);
        (lo, hi, f - lo as f32)
    };

    for y in 0..h {
        let (r0, r1, dy) = locate(y, tile_h);
        for x in 0..w {
            let (c0, c1, dx) = locate(x, tile_w);
            let p = plane[y * w + x] as usize;

            let top = f32::from(luts[r0 * n + c0][p]) * (1.0 - dx) + f32::from(luts[r0 * n + c1][p]) * dx;
            let bottom = f32::from(luts[r1 * n + c0][p]) * (1.0 - dx) + f32::from(luts[r1 * n + c1][p]) * dx;
            plane[y * w + x] = to_u8(top * (1.0 - dy) + bottom * dy);
        }
    }
}

fn tile_lut(hist: &mut [u32; 256], clip: u32, tile_pixels: usize) -> [u8; 256] {
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let scale = 255.0 / tile_pixels.max(1) as f32;
    let mut lut = [0u8; 256];
    let mut running = 0u32;
    for (slot, &count) in lut.iter_mut().zip(hist.iter()) {
        running += count;
        *slot = to_u8(running as f32 * scale);
    }
    lut
}
