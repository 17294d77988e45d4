//! OCR 集成与几何映射
//!
//! OCR 引擎是黑盒：输入一张图片，输出按阅读顺序排列的单词（文本、像素框、置信度）。
//! 几何映射把全文上的敏感信息匹配还原为像素空间的遮罩矩形。

mod error;
pub mod geometry;
mod tesseract;

pub use assist_render::BBox;
pub use error::{GeometryError, OcrError};
pub use geometry::{
    index_words, map_regions, match_spans, merge_boxes, reconstruct_text, span_to_boxes,
    MappedRegion, MatchedSpan, WordIndex, WEAK_CONFIDENCE_FACTOR,
};
pub use tesseract::{get_tesseract_version, TesseractConfig, TesseractEngine};

use assist_render::ImageBlob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, OcrError>;

/// OCR 识别出的单词
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedWord {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// 置信度 (0-1)
    pub confidence: f32,
}

impl RecognizedWord {
    pub fn new(text: impl Into<String>, bbox: BBox, confidence: f32) -> Self {
        Self {
            text: text.into(),
            x: bbox.x,
            y: bbox.y,
            width: bbox.w,
            height: bbox.h,
            confidence,
        }
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(self.x, self.y, self.width, self.height)
    }
}

/// 单张图片的识别结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recognition {
    pub words: Vec<RecognizedWord>,
}

/// OCR 引擎接口
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// 识别图片中的文字，坐标为该图片的像素坐标
    async fn recognize(&self, image: &ImageBlob) -> Result<Recognition>;

    /// 引擎名称，用于日志
    fn name(&self) -> &str;
}
