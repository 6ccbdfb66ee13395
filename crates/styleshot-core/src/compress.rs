//! Size-budget compression: bounded linear quality search over two codecs

use crate::config::CompressionConfig;
use crate::error::{PipelineError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::{WebPEncoder, WebPQuality};
use image::{ColorType, DynamicImage};
use tracing::debug;

/// Candidate output codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Jpeg,
    WebP,
}

impl Codec {
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Jpeg => "jpg",
            Codec::WebP => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Jpeg => "image/jpeg",
            Codec::WebP => "image/webp",
        }
    }
}

/// Result of the compression search
#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub bytes: Vec<u8>,
    pub codec: Codec,
    pub quality: u8,
    /// True when the search had to drop below the starting quality
    pub forced: bool,
}

/// Step encoder quality down from the starting value until the smaller codec
/// candidate fits the byte budget or the quality floor is reached.
///
/// Each codec candidate is computed exactly once per step and the smaller
/// one compared against the budget, so the search terminates in at most
/// `(start - min) / step + 1` iterations.
pub fn compress_to_budget(
    img: &DynamicImage,
    config: &CompressionConfig,
) -> Result<CompressedImage> {
    let start = config.start_quality.clamp(1, 100);
    let floor = config.min_quality.clamp(1, start);
    let step = config.quality_step.max(1);

    let mut quality = start;

    loop {
        let jpeg = encode_jpeg(img, quality)?;
        let webp = encode_webp(img, quality)?;

        let (bytes, codec) = if webp.len() < jpeg.len() {
            (webp, Codec::WebP)
        } else {
            (jpeg, Codec::Jpeg)
        };

        debug!(
            quality,
            codec = ?codec,
            size = bytes.len(),
            target = config.target_bytes,
            "compression candidate"
        );

        if bytes.len() <= config.target_bytes || quality <= floor {
            return Ok(CompressedImage {
                bytes,
                codec,
                quality,
                forced: quality < start,
            });
        }

        quality = quality.saturating_sub(step).max(floor);
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| PipelineError::internal(format!("JPEG encode failed: {}", e)))?;
    Ok(buffer)
}

fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut buffer = Vec::new();
    let encoder = WebPEncoder::new_with_quality(&mut buffer, WebPQuality::lossy(quality));
    encoder
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| PipelineError::internal(format!("WebP encode failed: {}", e)))?;
    Ok(buffer)
}
