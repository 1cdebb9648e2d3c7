//! Image-side half of the pipeline: payload resolution, decode, ROI crop
//! and the configuration-gated enhancement stages.
//!
//! Stage order is fixed: resize, denoise, contrast, binarize. Binarization
//! is always last and produces a single-channel image.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use image::{DynamicImage, GrayImage, ImageFormat};

use hony_pool_core::PreprocessConfig;

use crate::api::{ImagePayload, Roi};
use crate::error::TaskError;

/// Images whose largest side is below this are upscaled to it; no other
/// up-scaling happens.
const MIN_BOUND: u32 = 32;

#[derive(Debug)]
pub(crate) struct PreprocessOutput {
    pub(crate) image: DynamicImage,
    pub(crate) applied: Vec<String>,
    pub(crate) quality_score: f64,
    pub(crate) roi_applied: bool,
}

/// Turn a typed payload into encoded image bytes. Routing is by variant.
pub(crate) fn resolve_payload(payload: &ImagePayload) -> Result<Vec<u8>, TaskError> {
    let bytes = match payload {
        ImagePayload::Bytes(bytes) => bytes.clone(),
        ImagePayload::Base64(encoded) => B64
            .decode(encoded.trim().as_bytes())
            .map_err(|err| TaskError::BadImage(format!("invalid base64: {err}")))?,
        ImagePayload::Path(path) => std::fs::read(path)
            .map_err(|err| TaskError::BadImage(format!("unreadable image path: {err}")))?,
    };
    if bytes.is_empty() {
        return Err(TaskError::BadImage("empty image payload".to_string()));
    }
    Ok(bytes)
}

/// Decode, crop and enhance. Fails fast with `BadImage` on anything that is
/// not a decodable PNG or JPEG.
pub(crate) fn run(
    bytes: &[u8],
    roi: Option<Roi>,
    cfg: &PreprocessConfig,
) -> Result<PreprocessOutput, TaskError> {
    let mut image = decode(bytes)?;
    let mut applied = Vec::new();

    let roi_applied = match roi {
        Some(roi) => {
            image = crop_roi(&image, roi)?;
            true
        }
        None => false,
    };

    if let Some(resized) = resize_to_bound(&image, cfg.resize_max_w, cfg.resize_max_h) {
        image = resized;
        applied.push("resize".to_string());
    }

    if cfg.denoise {
        image = image.blur(0.8);
        applied.push("denoise".to_string());
    }

    if cfg.contrast {
        image = DynamicImage::ImageLuma8(enhance_contrast(&image.to_luma8()));
        applied.push("contrast".to_string());
    }

    if cfg.binarize {
        image = DynamicImage::ImageLuma8(binarize_adaptive(&image.to_luma8()));
        applied.push("binarize".to_string());
    }

    let quality_score = quality_score(&image.to_luma8());

    Ok(PreprocessOutput {
        image,
        applied,
        quality_score,
        roi_applied,
    })
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, TaskError> {
    let format = image::guess_format(bytes)
        .map_err(|_| TaskError::BadImage("unrecognized image encoding".to_string()))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(TaskError::BadImage(format!(
            "unsupported image encoding: {format:?}"
        )));
    }
    image::load_from_memory_with_format(bytes, format)
        .map_err(|err| TaskError::BadImage(format!("image decode failed: {err}")))
}

fn crop_roi(image: &DynamicImage, roi: Roi) -> Result<DynamicImage, TaskError> {
    let (width, height) = (image.width(), image.height());
    if roi.x >= width || roi.y >= height || roi.w == 0 || roi.h == 0 {
        return Err(TaskError::BadImage("roi outside image bounds".to_string()));
    }
    let w = roi.w.min(width - roi.x);
    let h = roi.h.min(height - roi.y);
    Ok(image.crop_imm(roi.x, roi.y, w, h))
}

/// Downscale into `(max_w, max_h)` preserving aspect ratio; tiny inputs are
/// upscaled to [`MIN_BOUND`]. `None` when the image is left untouched.
fn resize_to_bound(image: &DynamicImage, max_w: u32, max_h: u32) -> Option<DynamicImage> {
    let (width, height) = (image.width(), image.height());

    if width > max_w || height > max_h {
        return Some(image.resize(max_w, max_h, image::imageops::FilterType::CatmullRom));
    }

    let largest = width.max(height);
    if largest < MIN_BOUND {
        let scale = MIN_BOUND as f64 / largest as f64;
        let w = ((width as f64 * scale).round() as u32).max(1);
        let h = ((height as f64 * scale).round() as u32).max(1);
        return Some(image.resize(w, h, image::imageops::FilterType::CatmullRom));
    }

    None
}

/// Tiled, clip-limited histogram equalization on the luma channel.
fn enhance_contrast(gray: &GrayImage) -> GrayImage {
    const TILES: u32 = 8;
    const CLIP_LIMIT: f64 = 2.0;

    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }

    let tiles_x = TILES.min(width).max(1);
    let tiles_y = TILES.min(height).max(1);
    let tile_w = width.div_ceil(tiles_x);
    let tile_h = height.div_ceil(tiles_y);

    let mut out = gray.clone();
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);

            let mut hist = [0u32; 256];
            let mut count = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y).0[0] as usize] += 1;
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }

            // Clip the histogram and spread the excess evenly.
            let clip = ((CLIP_LIMIT * count as f64 / 256.0).ceil() as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let bonus = excess / 256;
            for bin in hist.iter_mut() {
                *bin += bonus;
            }

            let mut lut = [0u8; 256];
            let mut cumulative = 0u32;
            for (value, bin) in hist.iter().enumerate() {
                cumulative += *bin;
                lut[value] = ((cumulative as f64 / count as f64) * 255.0).round() as u8;
            }

            for y in y0..y1 {
                for x in x0..x1 {
                    let value = out.get_pixel(x, y).0[0];
                    out.put_pixel(x, y, image::Luma([lut[value as usize]]));
                }
            }
        }
    }
    out
}

/// Mean-of-window adaptive threshold over an integral image.
fn binarize_adaptive(gray: &GrayImage) -> GrayImage {
    const RADIUS: i64 = 7;
    const OFFSET: f64 = 10.0;

    let (width, height) = gray.dimensions();
    let (w, h) = (width as i64, height as i64);
    if w == 0 || h == 0 {
        return gray.clone();
    }

    // integral[y][x] = sum of pixels above-left of (x, y), exclusive.
    let stride = (w + 1) as usize;
    let mut integral = vec![0u64; stride * (h + 1) as usize];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += gray.get_pixel(x as u32, y as u32).0[0] as u64;
            let idx = (y + 1) as usize * stride + (x + 1) as usize;
            integral[idx] = integral[idx - stride] + row_sum;
        }
    }

    let mut out = GrayImage::new(width, height);
    for y in 0..h {
        for x in 0..w {
            let x0 = (x - RADIUS).max(0) as usize;
            let y0 = (y - RADIUS).max(0) as usize;
            let x1 = (x + RADIUS + 1).min(w) as usize;
            let y1 = (y + RADIUS + 1).min(h) as usize;

            let sum = integral[y1 * stride + x1] + integral[y0 * stride + x0]
                - integral[y0 * stride + x1]
                - integral[y1 * stride + x0];
            let count = ((x1 - x0) * (y1 - y0)) as f64;
            let mean = sum as f64 / count;

            let px = gray.get_pixel(x as u32, y as u32).0[0] as f64;
            let value = if px > mean - OFFSET { 255 } else { 0 };
            out.put_pixel(x as u32, y as u32, image::Luma([value]));
        }
    }
    out
}

/// Normalized variance of the Laplacian: a `[0, 1]` sharpness estimate.
pub(crate) fn quality_score(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as f64;
    let mut values = Vec::with_capacity(((width - 2) * (height - 2)) as usize);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = 4.0 * px(x, y) - px(x - 1, y) - px(x + 1, y) - px(x, y - 1) - px(x, y + 1);
            values.push(lap);
        }
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (variance / 1000.0).clamp(0.0, 1.0)
}
