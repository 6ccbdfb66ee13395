//! Source image normalization: decode, orient, downscale, denoise

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use image::imageops::FilterType;
use image::DynamicImage;

/// Normalize a source image into the pipeline's working envelope.
///
/// Square and landscape sources are capped at the configured max dimension;
/// portrait sources are fixed to the configured aspect ratio by center crop
/// before capping. Images are never upscaled.
pub fn run(bytes: &[u8], config: &PipelineConfig) -> Result<DynamicImage> {
    let decoded = image::load_from_memory(bytes).map_err(|e| PipelineError::BadImage {
        message: format!("Failed to decode source image: {}", e),
    })?;

    let oriented = match exif_orientation(bytes) {
        Some(tag) => apply_orientation(decoded, tag),
        None => decoded,
    };

    let shaped = shape_to_envelope(oriented, config);

    if config.denoise {
        Ok(DynamicImage::ImageRgba8(image::imageops::blur(
            &shaped.to_rgba8(),
            0.6,
        )))
    } else {
        Ok(shaped)
    }
}

fn shape_to_envelope(img: DynamicImage, config: &PipelineConfig) -> DynamicImage {
    let (width, height) = (img.width(), img.height());
    let max = config.max_dimension;

    if height > width {
        // Portrait: fix the aspect ratio by center crop, then cap the width
        let (aspect_w, aspect_h) = config.portrait_aspect;
        let target_height = width.saturating_mul(aspect_h) / aspect_w.max(1);

        let cropped = if height > target_height {
            let top = (height - target_height) / 2;
            img.crop_imm(0, top, width, target_height)
        } else {
            // Taller than square but shorter than the target ratio: trim the
            // sides instead
            let target_width = (height.saturating_mul(aspect_w) / aspect_h.max(1)).max(1);
            let left = (width - target_width.min(width)) / 2;
            img.crop_imm(left, 0, target_width.min(width), height)
        };

        if cropped.width() > max {
            let scale = max as f32 / cropped.width() as f32;
            let new_height = (cropped.height() as f32 * scale).round() as u32;
            cropped.resize_exact(max, new_height.max(1), FilterType::Lanczos3)
        } else {
            cropped
        }
    } else if width > max || height > max {
        // Never upscale: resize only shrinks
        img.resize(max, max, FilterType::Lanczos3)
    } else {
        img
    }
}

fn apply_orientation(img: DynamicImage, tag: u8) -> DynamicImage {
    match tag {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Extract the EXIF orientation tag (0x0112) from a JPEG buffer.
///
/// Walks the JPEG segment list to the Exif APP1 payload and reads IFD0
/// directly; only the orientation entry is needed, so a full EXIF parse is
/// not warranted.
fn exif_orientation(bytes: &[u8]) -> Option<u8> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }

    let mut offset = 2usize;
    while offset + 4 <= bytes.len() {
        if bytes[offset] != 0xFF {
            return None;
        }
        let marker = bytes[offset + 1];
        // Standalone markers without a length field
        if (0xD0..=0xD9).contains(&marker) {
            offset += 2;
            continue;
        }
        let length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        if length < 2 || offset + 2 + length > bytes.len() {
            return None;
        }
        if marker == 0xE1 {
            let payload = &bytes[offset + 4..offset + 2 + length];
            if let Some(tag) = orientation_from_exif_payload(payload) {
                return Some(tag);
            }
        }
        // Entropy-coded data follows SOS; no further APP segments appear
        if marker == 0xDA {
            return None;
        }
        offset += 2 + length;
    }

    None
}

fn orientation_from_exif_payload(payload: &[u8]) -> Option<u8> {
    let tiff = payload.strip_prefix(b"Exif\0\0")?;
    if tiff.len() < 8 {
        return None;
    }

    let big_endian = match &tiff[0..2] {
        b"MM" => true,
        b"II" => false,
        _ => return None,
    };

    let ifd_offset = read_u32(tiff, 4, big_endian)? as usize;
    let entry_count = read_u16(tiff, ifd_offset, big_endian)? as usize;

    for i in 0..entry_count {
        let entry = ifd_offset + 2 + i * 12;
        let tag = read_u16(tiff, entry, big_endian)?;
        if tag == 0x0112 {
            let value = read_u16(tiff, entry + 8, big_endian)?;
            return u8::try_from(value).ok().filter(|v| (1..=8).contains(v));
        }
    }

    None
}

fn read_u16(buf: &[u8], offset: usize, big_endian: bool) -> Option<u16> {
    let bytes: [u8; 2] = buf.get(offset..offset + 2)?.try_into().ok()?;
    Some(if big_endian {
        u16::from_be_bytes(bytes)
    } else {
        u16::from_le_bytes(bytes)
    })
}

fn read_u32(buf: &[u8], offset: usize, big_endian: bool) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(offset..offset + 4)?.try_into().ok()?;
    Some(if big_endian {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([120, 80, 200, 255]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buffer, ImageOutputFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            denoise: false,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_undecodable_source_is_bad_image() {
        let error = run(b"definitely not an image", &test_config()).unwrap_err();
        assert_eq!(error.error_code(), "bad_image");
    }

    #[test]
    fn test_never_upscales() {
        let output = run(&png_bytes(400, 400), &test_config()).unwrap();
        assert_eq!((output.width(), output.height()), (400, 400));
    }

    #[test]
    fn test_large_landscape_capped_at_max_dimension() {
        let output = run(&png_bytes(2048, 1536), &test_config()).unwrap();
        assert_eq!(output.width(), 1024);
        assert!(output.height() <= 1024);
    }

    #[test]
    fn test_portrait_fixed_to_aspect() {
        let output = run(&png_bytes(800, 2000), &test_config()).unwrap();
        // 4:5 aspect from an 800px-wide source
        assert_eq!((output.width(), output.height()), (800, 1000));
    }

    #[test]
    fn test_slightly_tall_portrait_trims_sides() {
        let output = run(&png_bytes(800, 900), &test_config()).unwrap();
        // 900 tall at 4:5 means 720 wide
        assert_eq!((output.width(), output.height()), (720, 900));
    }

    #[test]
    fn test_denoise_preserves_dimensions() {
        let config = PipelineConfig {
            denoise: true,
            ..PipelineConfig::default()
        };
        let output = run(&png_bytes(400, 400), &config).unwrap();
        assert_eq!((output.width(), output.height()), (400, 400));
    }

    #[test]
    fn test_orientation_tag_parsing() {
        // Minimal JPEG: SOI + APP1 Exif (big endian, orientation = 6) + EOI
        let tiff: Vec<u8> = [
            b"MM\0*".to_vec(),
            0x0008u32.to_be_bytes().to_vec(),
            0x0001u16.to_be_bytes().to_vec(),
            0x0112u16.to_be_bytes().to_vec(),
            0x0003u16.to_be_bytes().to_vec(),
            0x00000001u32.to_be_bytes().to_vec(),
            0x0006u16.to_be_bytes().to_vec(),
            vec![0, 0],
        ]
        .concat();

        let mut payload = b"Exif\0\0".to_vec();
        payload.extend_from_slice(&tiff);

        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE1];
        jpeg.extend_from_slice(&((payload.len() as u16 + 2).to_be_bytes()));
        jpeg.extend_from_slice(&payload);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);

        assert_eq!(exif_orientation(&jpeg), Some(6));
    }

    #[test]
    fn test_orientation_absent_for_png() {
        assert_eq!(exif_orientation(&png_bytes(8, 8)), None);
    }
}
