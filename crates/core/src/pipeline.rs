//! 图片处理流水线
//!
//! 会话只通过 `ImagePipeline` 调用预处理、检测和遮罩，测试可以替换为假实现。

use std::sync::Arc;
use std::time::Instant;

use assist_ocr::OcrEngine;
use assist_render::{ImageBlob, PreprocessOptions, PreprocessedImage};
use async_trait::async_trait;
use futures::future::try_join_all;

use crate::detector::{DetectedRegion, DetectorConfig, PiiDetector};
use crate::{CoreError, Result};

#[async_trait]
pub trait ImagePipeline: Send + Sync {
    /// 校验、缩放并重新编码
    async fn preprocess(&self, images: Vec<ImageBlob>) -> Result<Vec<PreprocessedImage>>;

    /// 对每张图片做 OCR 和 PII 检测，区域带来源图片下标
    async fn detect(&self, images: Vec<ImageBlob>) -> Result<Vec<DetectedRegion>>;

    /// 按区域涂黑，返回与输入一一对应的图片
    async fn mask(&self, images: Vec<ImageBlob>, regions: Vec<DetectedRegion>) -> Result<Vec<ImageBlob>>;
}

pub struct StandardPipeline {
    options: PreprocessOptions,
    ocr: Arc<dyn OcrEngine>,
    detector: Arc<PiiDetector>,
}

impl StandardPipeline {
    pub fn new(options: PreprocessOptions, detector: &DetectorConfig, ocr: Arc<dyn OcrEngine>) -> Result<Self> {
        Ok(Self {
            options,
            ocr,
            detector: Arc::new(PiiDetector::new(detector)?),
        })
    }
}

/// 在阻塞线程池中运行 CPU 密集的图片操作
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoreError::Task(e.to_string()))?
}

#[async_trait]
impl ImagePipeline for StandardPipeline {
    async fn preprocess(&self, images: Vec<ImageBlob>) -> Result<Vec<PreprocessedImage>> {
        let started = Instant::now();
        let mut processed = Vec::with_capacity(images.len());
        for blob in images {
            let options = self.options.clone();
            let image = blocking(move || Ok(assist_render::preprocess(&blob, &options)?)).await?;
            log::info!(
                "[Pipeline] 预处理 {}: {}x{} -> {}x{}, {} bytes",
                image.blob.name,
                image.original_width,
                image.original_height,
                image.width,
                image.height,
                image.blob.bytes.len()
            );
            processed.push(image);
        }
        log::debug!("[Pipeline] 预处理耗时 {:?}", started.elapsed());
        Ok(processed)
    }

    async fn detect(&self, images: Vec<ImageBlob>) -> Result<Vec<DetectedRegion>> {
        log::info!("[Pipeline] 使用 {} 识别 {} 张图片", self.ocr.name(), images.len());

        // 各图片的 OCR 互不依赖，并发执行，全部完成后再合并
        let recognitions = try_join_all(images.iter().map(|image| self.ocr.recognize(image))).await?;

        let mut regions = Vec::new();
        for (index, recognition) in recognitions.iter().enumerate() {
            regions.extend(self.detector.detect(index, &recognition.words)?);
        }
        Ok(regions)
    }

    async fn mask(&self, images: Vec<ImageBlob>, regions: Vec<DetectedRegion>) -> Result<Vec<ImageBlob>> {
        let mut masked = Vec::with_capacity(images.len());
        for (index, blob) in images.into_iter().enumerate() {
            let boxes: Vec<_> = regions
                .iter()
                .filter(|r| r.image_index == index)
                .map(|r| r.bbox)
                .collect();
            if boxes.is_empty() {
                masked.push(blob);
                continue;
            }
            masked.push(blocking(move || Ok(assist_render::apply_masks(&blob, &boxes)?)).await?);
        }
        Ok(masked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assist_ocr::{BBox, Recognition, RecognizedWord};
    use assist_rules::Strength;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// 按图片名返回预设单词的假 OCR
    struct FakeOcr;

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize(&self, image: &ImageBlob) -> assist_ocr::Result<Recognition> {
            let words = if image.name.contains("mail") {
                vec![
                    RecognizedWord::new("Email:", BBox::new(2.0, 2.0, 20.0, 8.0), 0.95),
                    RecognizedWord::new("taro@example.com", BBox::new(25.0, 2.0, 30.0, 8.0), 0.9),
                ]
            } else if image.name.contains("broken") {
                return Err(assist_ocr::OcrError::Recognition("engine crashed".into()));
            } else {
                vec![RecognizedWord::new("hello", BBox::new(0.0, 0.0, 10.0, 10.0), 0.9)]
            };
            Ok(Recognition { words })
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn png(name: &str, width: u32, height: u32) -> ImageBlob {
        let img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        ImageBlob::new(name, "image/png", bytes)
    }

    fn pipeline() -> StandardPipeline {
        StandardPipeline::new(PreprocessOptions::default(), &DetectorConfig::default(), Arc::new(FakeOcr)).unwrap()
    }

    #[tokio::test]
    async fn test_preprocess_downscales() {
        let out = pipeline().preprocess(vec![png("a.png", 3200, 100)]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].width, 1600);
        assert_eq!(out[0].height, 50);
        assert_eq!(out[0].blob.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_preprocess_rejects_svg() {
        let svg = ImageBlob::new("a.svg", "image/svg+xml", b"<svg/>".to_vec());
        let err = pipeline().preprocess(vec![svg]).await.unwrap_err();
        assert!(matches!(err, CoreError::Render(_)));
    }

    #[tokio::test]
    async fn test_detect_tags_image_index() {
        let images = vec![png("plain.png", 60, 12), png("mail.png", 60, 12)];
        let regions = pipeline().detect(images).await.unwrap();
        let email = regions.iter().find(|r| r.rule_id == "email").unwrap();
        assert_eq!(email.image_index, 1);
        assert_eq!(email.bbox, BBox::new(25.0, 2.0, 30.0, 8.0));
    }

    #[tokio::test]
    async fn test_detect_propagates_ocr_failure() {
        let err = pipeline().detect(vec![png("broken.png", 10, 10)]).await.unwrap_err();
        assert!(matches!(err, CoreError::Ocr(_)));
    }

    #[tokio::test]
    async fn test_mask_only_touches_flagged_images() {
        let images = vec![png("a.png", 20, 20), png("b.png", 20, 20)];
        let regions = vec![DetectedRegion {
            image_index: 1,
            rule_id: "email".into(),
            category: "EMAIL".into(),
            strength: Strength::Strong,
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            confidence: 0.9,
            snippet: String::new(),
        }];
        let masked = pipeline().mask(images, regions).await.unwrap();
        assert_eq!(masked[0].name, "a.png");
        assert_eq!(masked[1].name, "masked_b.png");

        let img = image::load_from_memory(&masked[1].bytes).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(15, 15), &Rgb([255, 255, 255]));
    }
}
