use image::Rgb;
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use crate::preprocess::encode_as;
use crate::{BBox, ImageBlob, RenderError, Result};

const MASK_JPEG_QUALITY: u8 = 90;

/// 在图片上涂黑给定的矩形区域
///
/// 坐标是图片像素坐标；超出边界的部分会被裁掉，面积为零的矩形忽略。
/// 输出保持源图的格式，文件名加 `masked_` 前缀。
pub fn apply_masks(blob: &ImageBlob, boxes: &[BBox]) -> Result<ImageBlob> {
    let img = image::load_from_memory(&blob.bytes).map_err(RenderError::Decode)?;
    let mut rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let black = Rgb([0u8, 0u8, 0u8]);

    let mut painted = 0usize;
    for bbox in boxes {
        let Some(rect) = clip_rect(bbox, width, height) else {
            continue;
        };
        draw_filled_rect_mut(&mut rgb, rect, black);
        painted += 1;
    }

    log::debug!("[Mask] {}: 绘制 {}/{} 个遮罩", blob.name, painted, boxes.len());

    let out = image::DynamicImage::ImageRgb8(rgb);
    let bytes = encode_as(&out, &blob.content_type, MASK_JPEG_QUALITY)?;
    Ok(ImageBlob::new(
        format!("masked_{}", blob.name),
        blob.content_type.clone(),
        bytes,
    ))
}

fn clip_rect(bbox: &BBox, width: u32, height: u32) -> Option<Rect> {
    if !(bbox.x.is_finite() && bbox.y.is_finite() && bbox.w.is_finite() && bbox.h.is_finite()) {
        return None;
    }
    let x0 = bbox.x.floor().max(0.0) as u32;
    let y0 = bbox.y.floor().max(0.0) as u32;
    let x1 = (bbox.right().ceil().max(0.0) as u32).min(width);
    let y1 = (bbox.bottom().ceil().max(0.0) as u32).min(height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Rect::at(x0 as i32, y0 as i32).of_size(x1 - x0, y1 - y0))
}
