//! Photograph → binarized, deskewed grayscale image ready for OCR.
//!
//! Stages run in a fixed order: decode, grayscale, upscale, denoise,
//! contrast enhancement, binarization, deskew. Every stage takes the
//! previous stage's output and returns a freshly allocated buffer.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::filter::separable_filter_equal;
use imageproc::geometry::min_area_rect;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Failed to load image: {0}")]
    Load(#[from] image::ImageError),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
}

/// Pixels darker than this count as foreground (ink) when measuring skew.
const FOREGROUND_MAX: u8 = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Images narrower or shorter than this are upscaled.
    pub min_dimension: u32,
    /// Non-local means filter strength.
    pub denoise_strength: f32,
    pub denoise_template_window: u32,
    pub denoise_search_window: u32,
    pub clahe_clip_limit: f32,
    /// Tile grid is `clahe_tiles × clahe_tiles`.
    pub clahe_tiles: u32,
    /// Gaussian neighbourhood for adaptive thresholding; must be odd.
    pub threshold_block_size: u32,
    pub threshold_offset: i16,
    /// Below this many foreground pixels deskew is skipped.
    pub deskew_min_points: usize,
    /// Corrections smaller than this (degrees) are not applied.
    pub deskew_min_angle: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            min_dimension: 1000,
            denoise_strength: 10.0,
            denoise_template_window: 7,
            denoise_search_window: 21,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            threshold_block_size: 11,
            threshold_offset: 2,
            deskew_min_points: 50,
            deskew_min_angle: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Base64 payload, optionally prefixed with `data:<mime>;base64,`.
    pub fn preprocess_base64(&self, payload: &str) -> Result<GrayImage, PreprocessError> {
        let bytes = decode_payload(payload)?;
        self.preprocess(&bytes)
    }

    /// Encoded image bytes (JPEG / PNG / WEBP / …).
    pub fn preprocess(&self, data: &[u8]) -> Result<GrayImage, PreprocessError> {
        let rgb = image::load_from_memory(data)?.to_rgb8();
        debug!("Decoded image: {}x{}px", rgb.width(), rgb.height());
        Ok(self.normalize(imageops::grayscale(&rgb)))
    }

    /// Run every stage after decoding on a grayscale image.
    pub fn normalize(&self, gray: GrayImage) -> GrayImage {
        let c = &self.config;
        let img = upscale(gray, c.min_dimension);
        let img = denoise(
            &img,
            c.denoise_strength,
            c.denoise_template_window,
            c.denoise_search_window,
        );
        let img = enhance_contrast(&img, c.clahe_clip_limit, c.clahe_tiles);
        let img = binarize(&img, c.threshold_block_size, c.threshold_offset);
        deskew(img, c.deskew_min_points, c.deskew_min_angle).0
    }
}

/// Strip an optional data-URI header and decode the base64 body.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, PreprocessError> {
    let body = match payload.split_once(',') {
        Some((_header, body)) => body,
        None => payload,
    };
    let body: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(STANDARD.decode(body)?)
}

pub fn encode_png(img: &GrayImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

// ── Upscale ───────────────────────────────────────────────────────────────────

/// Scale uniformly so both sides reach `min_dimension`. Images already at or
/// above it on both sides pass through untouched.
pub fn upscale(img: GrayImage, min_dimension: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || (w >= min_dimension && h >= min_dimension) {
        return img;
    }
    let scale = (f64::from(min_dimension) / f64::from(w)).max(f64::from(min_dimension) / f64::from(h));
    let new_w = ((f64::from(w) * scale).round() as u32).max(1);
    let new_h = ((f64::from(h) * scale).round() as u32).max(1);
    debug!("Scaled up: {w}x{h} → {new_w}x{new_h}");
    imageops::resize(&img, new_w, new_h, FilterType::CatmullRom)
}

// ── Denoise ───────────────────────────────────────────────────────────────────

/// Non-local means denoising.
///
/// Each pixel becomes a weighted mean of the pixels in its search window,
/// weighted by how similar their surrounding patches are:
/// `w = exp(-d / h²)` with `d` the mean squared patch difference. Patch
/// distances are computed per displacement with an integral image, so the
/// cost is independent of the patch size.
pub fn denoise(img: &GrayImage, strength: f32, template_window: u32, search_window: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || strength <= 0.0 {
        return img.clone();
    }
    let (w, h) = (w as usize, h as usize);
    let n = w * h;
    let src = img.as_raw();
    let tr = (template_window / 2) as isize;
    let sr = (search_window / 2) as isize;

    // Weights below exp(-7) are treated as zero.
    let h2 = strength * strength;
    let max_dist = (h2 * 7.0).ceil() as usize;
    let weights: Vec<f32> = (0..=max_dist).map(|d| (-(d as f32) / h2).exp()).collect();

    let mut weight_sum = vec![0f32; n];
    let mut value_sum = vec![0f32; n];
    let mut diff = vec![0u32; n];
    let mut integral = vec![0u64; (w + 1) * (h + 1)];

    let clamp = |v: isize, len: usize| v.clamp(0, len as isize - 1) as usize;

    for dy in -sr..=sr {
        for dx in -sr..=sr {
            for y in 0..h {
                let sy = clamp(y as isize + dy, h);
                for x in 0..w {
                    let sx = clamp(x as isize + dx, w);
                    let d = i32::from(src[y * w + x]) - i32::from(src[sy * w + sx]);
                    diff[y * w + x] = (d * d) as u32;
                }
            }

            for y in 0..h {
                let mut row = 0u64;
                for x in 0..w {
                    row += u64::from(diff[y * w + x]);
                    integral[(y + 1) * (w + 1) + x + 1] = integral[y * (w + 1) + x + 1] + row;
                }
            }

            for y in 0..h {
                let y0 = clamp(y as isize - tr, h);
                let y1 = clamp(y as isize + tr, h);
                let sy = clamp(y as isize + dy, h);
                for x in 0..w {
                    let x0 = clamp(x as isize - tr, w);
                    let x1 = clamp(x as isize + tr, w);
                    let sum = integral[(y1 + 1) * (w + 1) + x1 + 1] + integral[y0 * (w + 1) + x0]
                        - integral[y0 * (w + 1) + x1 + 1]
                        - integral[(y1 + 1) * (w + 1) + x0];
                    let count = ((y1 - y0 + 1) * (x1 - x0 + 1)) as f32;
                    let dist = (sum as f32 / count).round() as usize;
                    if let Some(&wgt) = weights.get(dist) {
                        let sx = clamp(x as isize + dx, w);
                        weight_sum[y * w + x] += wgt;
                        value_sum[y * w + x] += wgt * f32::from(src[sy * w + sx]);
                    }
                }
            }
        }
    }

    // The zero displacement always contributes weight 1, so weight_sum >= 1.
    let out: Vec<u8> = value_sum
        .iter()
        .zip(&weight_sum)
        .map(|(v, w)| (v / w).round().clamp(0.0, 255.0) as u8)
        .collect();
    GrayImage::from_raw(w as u32, h as u32, out).unwrap_or_else(|| img.clone())
}

// ── Contrast (CLAHE) ──────────────────────────────────────────────────────────

/// Contrast-limited adaptive histogram equalization over a `tiles × tiles`
/// grid, with bilinear blending between neighbouring tile mappings.
pub fn enhance_contrast(img: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let tile_w = w.div_ceil(tiles.clamp(1, w));
    let tile_h = h.div_ceil(tiles.clamp(1, h));
    let tiles_x = w.div_ceil(tile_w);
    let tiles_y = h.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let (x0, y0) = (tx * tile_w, ty * tile_h);
            let (x1, y1) = ((x0 + tile_w).min(w), (y0 + tile_h).min(h));
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            luts.push(tile_lut(hist, (x1 - x0) * (y1 - y0), clip_limit));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];
    let inv_tw = 1.0 / tile_w as f32;
    let inv_th = 1.0 / tile_h as f32;

    GrayImage::from_fn(w, h, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;

        let tyf = y as f32 * inv_th - 0.5;
        let ty1 = tyf.floor();
        let ya = tyf - ty1;
        let ty2 = ((ty1 as i64 + 1).min(i64::from(tiles_y) - 1)).max(0) as u32;
        let ty1 = (ty1 as i64).max(0) as u32;

        let txf = x as f32 * inv_tw - 0.5;
        let tx1 = txf.floor();
        let xa = txf - tx1;
        let tx2 = ((tx1 as i64 + 1).min(i64::from(tiles_x) - 1)).max(0) as u32;
        let tx1 = (tx1 as i64).max(0) as u32;

        let top = f32::from(lut_at(tx1, ty1)[v]) * (1.0 - xa) + f32::from(lut_at(tx2, ty1)[v]) * xa;
        let bottom = f32::from(lut_at(tx1, ty2)[v]) * (1.0 - xa) + f32::from(lut_at(tx2, ty2)[v]) * xa;
        Luma([(top * (1.0 - ya) + bottom * ya).round().clamp(0.0, 255.0) as u8])
    })
}

/// Clipped, redistributed histogram → cumulative mapping for one tile.
fn tile_lut(mut hist: [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    if clip_limit > 0.0 {
        let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut clipped = 0u32;
        for bin in hist.iter_mut() {
            if *bin > clip {
                clipped += *bin - clip;
                *bin = clip;
            }
        }
        let batch = clipped / 256;
        let mut residual = clipped % 256;
        hist.iter_mut().for_each(|bin| *bin += batch);
        if residual > 0 {
            let step = (256 / residual).max(1) as usize;
            for bin in hist.iter_mut().step_by(step) {
                if residual == 0 {
                    break;
                }
                *bin += 1;
                residual -= 1;
            }
        }
    }

    let scale = 255.0 / area.max(1) as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (v, count) in hist.iter().enumerate() {
        cdf += count;
        lut[v] = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

// ── Binarize ──────────────────────────────────────────────────────────────────

/// Adaptive threshold against a Gaussian-weighted local mean: a pixel turns
/// white when it is brighter than `mean - offset`, black otherwise.
pub fn binarize(img: &GrayImage, block_size: u32, offset: i16) -> GrayImage {
    let kernel = gaussian_kernel(block_size.max(3) | 1);
    let mean: GrayImage = separable_filter_equal(img, &kernel);
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let src = i16::from(img.get_pixel(x, y)[0]);
        let local = i16::from(mean.get_pixel(x, y)[0]);
        Luma([if src > local - offset { 255 } else { 0 }])
    })
}

/// Normalized Gaussian taps; sigma derived from the size the usual way
/// (`0.3 * ((size - 1) / 2 - 1) + 0.8`).
fn gaussian_kernel(size: u32) -> Vec<f32> {
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (size / 2) as i32;
    let taps: Vec<f32> = (-half..=half)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = taps.iter().sum();
    taps.into_iter().map(|t| t / sum).collect()
}

// ── Deskew ────────────────────────────────────────────────────────────────────

/// Map the angle of a minimum-area rectangle, measured in `[-90, 0)` degrees
/// with the y axis pointing up, to the counter-clockwise rotation that levels
/// it. The result always lies in `[-45, 45]`.
pub fn normalize_skew_angle(raw: f64) -> f64 {
    let folded = if raw < -45.0 { raw + 90.0 } else { raw };
    -folded
}

/// Angle of a rectangle given by its corners, in `[-90, 0)`.
fn rect_angle(corners: &[Point<i32>; 4]) -> f64 {
    let edge = corners
        .windows(2)
        .map(|e| (e[1].x - e[0].x, e[1].y - e[0].y))
        .find(|&(dx, dy)| dx != 0 || dy != 0);
    let Some((dx, dy)) = edge else {
        return -90.0;
    };
    let theta = f64::from(-dy).atan2(f64::from(dx)).to_degrees();
    let folded = theta.rem_euclid(90.0);
    // rem_euclid may round up to exactly 90 for tiny negative inputs
    let folded = if folded >= 90.0 { 0.0 } else { folded };
    folded - 90.0
}

/// Counter-clockwise correction (degrees) that levels the foreground, or
/// `None` when fewer than `min_points` foreground pixels exist.
pub fn skew_angle(img: &GrayImage, min_points: usize) -> Option<f64> {
    let (w, h) = img.dimensions();
    let raw = img.as_raw();
    let mut count = 0usize;
    // The hull of all foreground pixels equals the hull of each row's extremes.
    let mut extremes: Vec<Point<i32>> = Vec::new();
    for y in 0..h as usize {
        let row = &raw[y * w as usize..(y + 1) * w as usize];
        let mut first = None;
        let mut last = 0usize;
        for (x, &v) in row.iter().enumerate() {
            if v < FOREGROUND_MAX {
                count += 1;
                first.get_or_insert(x);
                last = x;
            }
        }
        if let Some(first) = first {
            extremes.push(Point::new(first as i32, y as i32));
            if last != first {
                extremes.push(Point::new(last as i32, y as i32));
            }
        }
    }

    if count < min_points.max(1) {
        debug!("Not enough points for deskew ({count}), skipping");
        return None;
    }

    if is_collinear(&extremes) {
        debug!("Foreground is a single line, skipping deskew");
        return None;
    }

    let rect = min_area_rect(&extremes);
    Some(normalize_skew_angle(rect_angle(&rect)))
}

fn is_collinear(points: &[Point<i32>]) -> bool {
    let Some((&a, rest)) = points.split_first() else {
        return true;
    };
    let Some(&b) = rest.iter().find(|p| **p != a) else {
        return true;
    };
    rest.iter().all(|p| {
        let cross = i64::from(b.x - a.x) * i64::from(p.y - a.y) - i64::from(b.y - a.y) * i64::from(p.x - a.x);
        cross == 0
    })
}

/// Level the image. Returns the image and the applied correction in degrees
/// (0.0 when nothing was rotated).
pub fn deskew(img: GrayImage, min_points: usize, min_angle: f64) -> (GrayImage, f64) {
    let Some(angle) = skew_angle(&img, min_points) else {
        return (img, 0.0);
    };
    if angle.abs() < min_angle {
        debug!("Skew angle {angle:.2}° is negligible, skipping");
        return (img, 0.0);
    }
    debug!("Correcting skew angle: {angle:.2}°");
    (rotate_about_center(&img, angle), angle)
}

/// Rotate counter-clockwise by `degrees` about the image centre, keeping the
/// canvas size. Bicubic sampling; out-of-range samples replicate the edge.
pub fn rotate_about_center(img: &GrayImage, degrees: f64) -> GrayImage {
    let (w, h) = img.dimensions();
    let (cx, cy) = (f64::from(w / 2), f64::from(h / 2));
    let (sin, cos) = degrees.to_radians().sin_cos();
    GrayImage::from_fn(w, h, |x, y| {
        let dx = f64::from(x) - cx;
        let dy = f64::from(y) - cy;
        let sx = cx + dx * cos - dy * sin;
        let sy = cy + dx * sin + dy * cos;
        Luma([sample_bicubic(img, sx, sy)])
    })
}

fn sample_bicubic(img: &GrayImage, x: f64, y: f64) -> u8 {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    let (x0, y0) = (x.floor(), y.floor());
    let wx = cubic_weights(x - x0);
    let wy = cubic_weights(y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let mut acc = 0.0;
    for (j, wyj) in wy.iter().enumerate() {
        let sy = (y0 - 1 + j as i64).clamp(0, h - 1) as u32;
        for (i, wxi) in wx.iter().enumerate() {
            let sx = (x0 - 1 + i as i64).clamp(0, w - 1) as u32;
            acc += wxi * wyj * f64::from(img.get_pixel(sx, sy)[0]);
        }
    }
    acc.round().clamp(0.0, 255.0) as u8
}

/// Cubic convolution weights (a = -0.75) for the four taps around `t`.
fn cubic_weights(t: f64) -> [f64; 4] {
    const A: f64 = -0.75;
    let w0 = ((A * (t + 1.0) - 5.0 * A) * (t + 1.0) + 8.0 * A) * (t + 1.0) - 4.0 * A;
    let w1 = ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0;
    let w2 = ((A + 2.0) * (1.0 - t) - (A + 3.0)) * (1.0 - t) * (1.0 - t) + 1.0;
    [w0, w1, w2, 1.0 - w0 - w1 - w2]
}
