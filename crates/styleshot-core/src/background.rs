//! Background removal: matting models, mask post-processing, halo check

use crate::config::MaskConfig;
use crate::error::Result;
use crate::models::MattingModel;
use image::{DynamicImage, GrayImage, RgbaImage};
use rayon::prelude::*;
use tracing::warn;

/// Mask values above this are foreground in the raw matting output
const FOREGROUND_THRESHOLD: u8 = 128;

/// Color distance past which a pixel is foreground for the border-color model
const BORDER_COLOR_TAU: f32 = 48.0;

/// Luminance distance past which a pixel is foreground for the luminance model
const LUMA_TAU: f32 = 32.0;

/// Fraction of bright semi-transparent edge pixels that flags a halo
const HALO_BRIGHT_FRACTION: f32 = 0.5;

/// Result of the background-removal stage
#[derive(Debug, Clone)]
pub struct CutoutResult {
    /// RGBA cutout with the post-processed mask composited as alpha
    pub cutout: RgbaImage,
    /// The post-processed alpha mask on its own
    pub mask: GrayImage,
    /// Set when halo validation found suspicious edges; observability only
    pub halo_flagged: bool,
}

/// Produce an RGBA cutout and alpha mask for the subject.
///
/// The raw model mask is eroded by the configured pixel radius, feathered by
/// blurring, then composited as the alpha channel. Halo validation inspects
/// the result's edge band and flags suspicious bright fringes without
/// failing the stage.
pub fn remove_background(
    img: &DynamicImage,
    model: MattingModel,
    config: &MaskConfig,
) -> Result<CutoutResult> {
    let rgba = img.to_rgba8();

    let raw_mask = match model {
        MattingModel::BorderColor => border_color_mask(&rgba),
        MattingModel::Luminance => luminance_mask(&rgba),
    };

    let eroded = erode(&raw_mask, config.erode_radius);
    let feathered = if config.feather_sigma > 0.0 {
        image::imageops::blur(&eroded, config.feather_sigma)
    } else {
        eroded
    };

    let cutout = composite_alpha(&rgba, &feathered);
    let halo_flagged = validate_halo(&cutout);

    Ok(CutoutResult {
        cutout,
        mask: feathered,
        halo_flagged,
    })
}

/// Average color of the 1-pixel border frame, used as the background estimate
fn border_average(rgba: &RgbaImage) -> [f32; 3] {
    let (width, height) = rgba.dimensions();
    let mut sum = [0f64; 3];
    let mut count = 0u64;

    for x in 0..width {
        for y in [0, height.saturating_sub(1)] {
            let p = rgba.get_pixel(x, y);
            sum[0] += p[0] as f64;
            sum[1] += p[1] as f64;
            sum[2] += p[2] as f64;
            count += 1;
        }
    }
    for y in 0..height {
        for x in [0, width.saturating_sub(1)] {
            let p = rgba.get_pixel(x, y);
            sum[0] += p[0] as f64;
            sum[1] += p[1] as f64;
            sum[2] += p[2] as f64;
            count += 1;
        }
    }

    let count = count.max(1) as f64;
    [
        (sum[0] / count) as f32,
        (sum[1] / count) as f32,
        (sum[2] / count) as f32,
    ]
}

fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Border-color model: foreground is whatever sits far from the estimated
/// background color
fn border_color_mask(rgba: &RgbaImage) -> GrayImage {
    let background = border_average(rgba);
    let (width, height) = rgba.dimensions();

    GrayImage::from_fn(width, height, |x, y| {
        let p = rgba.get_pixel(x, y);
        let dr = p[0] as f32 - background[0];
        let dg = p[1] as f32 - background[1];
        let db = p[2] as f32 - background[2];
        let distance = (dr * dr + dg * dg + db * db).sqrt();
        if distance > BORDER_COLOR_TAU {
            image::Luma([255])
        } else {
            image::Luma([0])
        }
    })
}

/// Luminance model: foreground is whatever splits away from the border's
/// average brightness
fn luminance_mask(rgba: &RgbaImage) -> GrayImage {
    let background = border_average(rgba);
    let background_luma = luma(
        background[0] as u8,
        background[1] as u8,
        background[2] as u8,
    );
    let (width, height) = rgba.dimensions();

    GrayImage::from_fn(width, height, |x, y| {
        let p = rgba.get_pixel(x, y);
        if (luma(p[0], p[1], p[2]) - background_luma).abs() > LUMA_TAU {
            image::Luma([255])
        } else {
            image::Luma([0])
        }
    })
}

/// Morphological erosion: each output pixel is the minimum over a square
/// neighborhood of the given radius, shrinking mask edges inward.
fn erode(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }

    let (width, height) = mask.dimensions();
    let src = mask.as_raw();
    let r = radius as i64;

    let mut out = GrayImage::new(width, height);
    let rows: &mut [u8] = &mut out;
    rows.par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i64;
            for x in 0..width as i64 {
                let mut min = u8::MAX;
                for dy in -r..=r {
                    let ny = y + dy;
                    if ny < 0 || ny >= height as i64 {
                        min = 0;
                        break;
                    }
                    for dx in -r..=r {
                        let nx = x + dx;
                        if nx < 0 || nx >= width as i64 {
                            min = 0;
                            break;
                        }
                        let value = src[(ny as usize) * width as usize + nx as usize];
                        if value < min {
                            min = value;
                        }
                    }
                    if min == 0 {
                        break;
                    }
                }
                row[x as usize] = min;
            }
        });

    out
}

/// Composite the mask into the alpha channel of the cutout
fn composite_alpha(rgba: &RgbaImage, mask: &GrayImage) -> RgbaImage {
    let mut out = rgba.clone();

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        pixel[3] = mask.get_pixel(x, y)[0];
    }

    out
}

/// Inspect the semi-transparent edge band for bright fringes.
///
/// A mostly-bright edge band usually means the mask kept a rim of the old
/// background. Observability only; the stage never fails on it.
fn validate_halo(cutout: &RgbaImage) -> bool {
    let mut edge_pixels = 0u64;
    let mut bright_edge_pixels = 0u64;

    for pixel in cutout.pixels() {
        let alpha = pixel[3];
        if alpha > 16 && alpha < 240 {
            edge_pixels += 1;
            if luma(pixel[0], pixel[1], pixel[2]) > 220.0 {
                bright_edge_pixels += 1;
            }
        }
    }

    if edge_pixels == 0 {
        return false;
    }

    let fraction = bright_edge_pixels as f32 / edge_pixels as f32;
    let flagged = fraction > HALO_BRIGHT_FRACTION;
    if flagged {
        warn!(
            edge_pixels,
            bright_fraction = fraction,
            "halo validation flagged suspicious cutout edges"
        );
    }
    flagged
}
