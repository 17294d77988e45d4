//! 图片预处理
//!
//! 1. 校验类型和大小
//! 2. 等比缩放，最长边不超过 `max_side`
//! 3. 透明背景铺白
//! 4. 重新编码为 JPEG（同时丢弃 EXIF 等元数据）

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::{content_hash, ImageBlob, RenderError, Result, MIME_JPEG, MIME_PNG, MIME_SVG, MIME_WEBP};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreprocessOptions {
    pub max_side: u32,
    pub jpeg_quality: u8,
    pub max_bytes: usize,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            max_side: 1600,
            jpeg_quality: 80,
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    pub blob: ImageBlob,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub content_hash: String,
}

/// 校验图片类型和大小
pub fn validate(blob: &ImageBlob, options: &PreprocessOptions) -> Result<()> {
    let content_type = blob.content_type.to_ascii_lowercase();
    if content_type == MIME_SVG {
        return Err(RenderError::SvgNotSupported);
    }
    if ![MIME_JPEG, MIME_PNG, MIME_WEBP].contains(&content_type.as_str()) {
        return Err(RenderError::UnsupportedType(blob.content_type.clone()));
    }
    if blob.bytes.len() > options.max_bytes {
        return Err(RenderError::TooLarge {
            size: blob.bytes.len(),
            limit: options.max_bytes,
        });
    }
    Ok(())
}

pub fn preprocess(blob: &ImageBlob, options: &PreprocessOptions) -> Result<PreprocessedImage> {
    validate(blob, options)?;

    let img = image::load_from_memory(&blob.bytes).map_err(RenderError::Decode)?;
    let (original_width, original_height) = (img.width(), img.height());

    let (width, height) = fit_within(original_width, original_height, options.max_side);
    let rgba = img.to_rgba8();
    let rgba = if (width, height) != (original_width, original_height) {
        image::imageops::resize(&rgba, width, height, FilterType::Lanczos3)
    } else {
        rgba
    };

    let rgb = flatten_on_white(&rgba);
    let bytes = encode_jpeg(&rgb, options.jpeg_quality)?;

    log::debug!(
        "[Preprocess] {}: {}x{} -> {}x{}, {} -> {} bytes",
        blob.name,
        original_width,
        original_height,
        width,
        height,
        blob.bytes.len(),
        bytes.len()
    );

    let content_hash = content_hash(&bytes);
    Ok(PreprocessedImage {
        blob: ImageBlob::new(blob.name.clone(), MIME_JPEG, bytes),
        width,
        height,
        original_width,
        original_height,
        content_hash,
    })
}

/// 等比缩放后的尺寸，最长边不超过 `max_side`
fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if max_side == 0 || longest <= max_side {
        return (width, height);
    }
    let scale = max_side as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

fn flatten_on_white(rgba: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y).0;
        let alpha = p[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(p[0]), blend(p[1]), blend(p[2])])
    })
}

pub(crate) fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode_image(rgb).map_err(RenderError::Encode)?;
    Ok(buf)
}

pub(crate) fn encode_as(img: &DynamicImage, content_type: &str, quality: u8) -> Result<Vec<u8>> {
    let format = match content_type {
        MIME_PNG => ImageFormat::Png,
        MIME_WEBP => ImageFormat::WebP,
        _ => return encode_jpeg(&img.to_rgb8(), quality),
    };
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, format).map_err(RenderError::Encode)?;
    Ok(cursor.into_inner())
}
