//! Template composition onto fixed-aspect canvases

use crate::error::Result;
use crate::models::Layout;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};

/// Fraction of the canvas the subject is fitted into
const SUBJECT_FIT: f32 = 0.92;

/// Canvas fill behind the subject
const CANVAS_BACKGROUND: Rgba<u8> = Rgba([248, 248, 246, 255]);

/// Lay the transformed subject into the layout's canvas, scaled to fit and
/// centered.
pub fn compose(subject: &DynamicImage, layout: Layout) -> Result<DynamicImage> {
    let (canvas_width, canvas_height) = layout.canvas();
    let mut canvas = RgbaImage::from_pixel(canvas_width, canvas_height, CANVAS_BACKGROUND);

    let fit_width = (canvas_width as f32 * SUBJECT_FIT) as u32;
    let fit_height = (canvas_height as f32 * SUBJECT_FIT) as u32;

    let scale = (fit_width as f32 / subject.width() as f32)
        .min(fit_height as f32 / subject.height() as f32);
    let scaled_width = ((subject.width() as f32 * scale) as u32).max(1);
    let scaled_height = ((subject.height() as f32 * scale) as u32).max(1);

    let scaled = subject.resize_exact(scaled_width, scaled_height, FilterType::Lanczos3);

    let x = (canvas_width.saturating_sub(scaled_width)) / 2;
    let y = (canvas_height.saturating_sub(scaled_height)) / 2;
    image::imageops::overlay(&mut canvas, &scaled.to_rgba8(), x as i64, y as i64);

    Ok(DynamicImage::ImageRgba8(canvas))
}
