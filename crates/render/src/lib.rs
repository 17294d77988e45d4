//! Image handling for outbound chat attachments.
//!
//! Validation, downscale / re-encode, content hashing and redaction painting.

mod mask;
mod preprocess;

pub use mask::apply_masks;
pub use preprocess::{preprocess, validate, PreprocessOptions, PreprocessedImage};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("不支持 SVG 图片，请使用 JPEG、PNG 或 WebP")]
    SvgNotSupported,

    #[error("不支持的图片类型: {0}")]
    UnsupportedType(String),

    #[error("图片过大: {size} 字节 (上限 {limit} 字节)")]
    TooLarge { size: usize, limit: usize },

    #[error("图片解码失败: {0}")]
    Decode(#[source] image::ImageError),

    #[error("图片编码失败: {0}")]
    Encode(#[source] image::ImageError),
}

pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";
pub const MIME_WEBP: &str = "image/webp";
pub const MIME_SVG: &str = "image/svg+xml";

/// 一张图片的原始字节和元数据
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBlob {
    pub name: String,
    pub content_type: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for ImageBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBlob")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImageBlob {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// 按文件扩展名推断 MIME 类型
    pub fn from_path_bytes(path: &std::path::Path, bytes: Vec<u8>) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let content_type = match ext.as_str() {
            "jpg" | "jpeg" => MIME_JPEG,
            "png" => MIME_PNG,
            "webp" => MIME_WEBP,
            "svg" => MIME_SVG,
            _ => "application/octet-stream",
        };
        Self::new(name, content_type, bytes)
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        to_data_url(&self.content_type, &self.bytes)
    }
}

/// SHA-256 内容哈希（小写十六进制）
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `data:<mime>;base64,<payload>`
pub fn to_data_url(content_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        content_type,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// 像素坐标系下的矩形
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    /// 包含两个矩形的最小外接矩形
    pub fn union(&self, other: &BBox) -> BBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BBox {
            x,
            y,
            w: self.right().max(other.right()) - x,
            h: self.bottom().max(other.bottom()) - y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_data_url() {
        assert_eq!(to_data_url(MIME_PNG, b"hi"), "data:image/png;base64,aGk=");
    }

    #[test]
    fn test_bbox_union() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 10.0, 10.0);
        assert_eq!(a.union(&b), BBox::new(0.0, 0.0, 15.0, 15.0));
    }

    #[test]
    fn test_blob_from_path() {
        let blob = ImageBlob::from_path_bytes(std::path::Path::new("/tmp/shot.PNG"), vec![1, 2]);
        assert_eq!(blob.name, "shot.PNG");
        assert_eq!(blob.content_type, MIME_PNG);
    }

    #[test]
    fn test_blob_serde_skips_bytes() {
        let blob = ImageBlob::new("a.jpg", MIME_JPEG, vec![1, 2, 3]);
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"name":"a.jpg","contentType":"image/jpeg"}"#);
    }
}
