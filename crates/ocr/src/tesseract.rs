//! Tesseract OCR 引擎实现（CLI 包装）

use std::time::Instant;

use assist_render::ImageBlob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::{OcrEngine, OcrError, Recognition, RecognizedWord, Result};

/// Tesseract 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TesseractConfig {
    /// 可执行文件路径（默认从 PATH 查找）
    pub binary_path: Option<String>,
    /// tessdata 目录
    pub tessdata_path: Option<String>,
    /// 语言
    pub lang: Option<String>,
    /// 页面分割模式 (0-13)
    pub psm: Option<u8>,
    /// OCR 引擎模式 (0-3)
    pub oem: Option<u8>,
}

impl TesseractConfig {
    pub fn binary_or_default(&self) -> &str {
        self.binary_path.as_deref().unwrap_or("tesseract")
    }

    pub fn lang_or_default(&self) -> &str {
        self.lang.as_deref().unwrap_or("eng+jpn")
    }

    pub fn psm_or_default(&self) -> u8 {
        self.psm.unwrap_or(6)
    }

    pub fn oem_or_default(&self) -> u8 {
        self.oem.unwrap_or(1)
    }
}

/// Tesseract OCR 引擎
pub struct TesseractEngine {
    config: TesseractConfig,
    version: String,
}

impl TesseractEngine {
    /// 创建引擎，先确认可执行文件可用
    pub async fn new(config: TesseractConfig) -> Result<Self> {
        let version = get_tesseract_version(config.binary_or_default()).await?;
        log::info!("[Tesseract] 初始化成功，版本: {}", version);
        Ok(Self { config, version })
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    async fn recognize(&self, image: &ImageBlob) -> Result<Recognition> {
        let start = Instant::now();

        let temp = write_temp_image(image).await?;

        let mut cmd = Command::new(self.config.binary_or_default());
        cmd.arg(temp.path())
            .arg("stdout")
            .arg("-l")
            .arg(self.config.lang_or_default())
            .arg("--psm")
            .arg(self.config.psm_or_default().to_string())
            .arg("--oem")
            .arg(self.config.oem_or_default().to_string())
            .arg("tsv");

        if let Some(tessdata_path) = &self.config.tessdata_path {
            cmd.env("TESSDATA_PREFIX", tessdata_path);
        }

        log::debug!(
            "[Tesseract] 执行: {} {} -l {} --psm {} --oem {} tsv",
            self.config.binary_or_default(),
            image.name,
            self.config.lang_or_default(),
            self.config.psm_or_default(),
            self.config.oem_or_default()
        );

        let output = cmd
            .output()
            .await
            .map_err(|e| OcrError::EngineUnavailable(format!("执行 tesseract 失败: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Recognition(format!("Tesseract 执行失败: {}", stderr.trim())));
        }

        let words = parse_tesseract_tsv(&String::from_utf8_lossy(&output.stdout))?;

        log::info!(
            "[Tesseract] {} 识别完成，耗时: {} ms，单词数: {}",
            image.name,
            start.elapsed().as_millis(),
            words.len()
        );

        Ok(Recognition { words })
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}

/// 解析 Tesseract TSV 输出
///
/// TSV 格式：
/// level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
///
/// 只保留单词级别 (level=5)，坐标保持像素值，顺序即阅读顺序。
fn parse_tesseract_tsv(tsv: &str) -> Result<Vec<RecognizedWord>> {
    if tsv.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut lines = tsv.lines();
    match lines.next() {
        Some(header) if header.starts_with("level") => {}
        _ => return Err(OcrError::Parse("缺少 TSV 表头".to_string())),
    }

    let mut words = Vec::new();
    for line in lines {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }

        let level: i32 = cols[0].parse().unwrap_or(-1);
        let conf: f32 = cols[10].trim().parse().unwrap_or(-1.0);
        let text = cols[11].trim();

        if level != 5 || text.is_empty() || conf < 0.0 {
            continue;
        }

        let num = |s: &str| s.trim().parse::<f32>().unwrap_or(0.0);
        words.push(RecognizedWord {
            text: text.to_string(),
            x: num(cols[6]),
            y: num(cols[7]),
            width: num(cols[8]),
            height: num(cols[9]),
            // Tesseract 置信度是 0-100
            confidence: (conf / 100.0).clamp(0.0, 1.0),
        });
    }

    Ok(words)
}

/// 把图片写入临时文件供 CLI 读取，文件随返回值一起删除
async fn write_temp_image(image: &ImageBlob) -> Result<NamedTempFile> {
    let suffix = match image.content_type.as_str() {
        assist_render::MIME_PNG => ".png",
        assist_render::MIME_WEBP => ".webp",
        _ => ".jpg",
    };
    let temp = tempfile::Builder::new()
        .prefix("assist_ocr_")
        .suffix(suffix)
        .tempfile()?;
    tokio::fs::write(temp.path(), &image.bytes).await?;
    Ok(temp)
}

/// 获取 Tesseract 版本
pub async fn get_tesseract_version(binary_path: &str) -> Result<String> {
    let output = Command::new(binary_path)
        .arg("--version")
        .output()
        .await
        .map_err(|e| OcrError::EngineUnavailable(format!("无法执行 {}: {}", binary_path, e)))?;

    if !output.status.success() {
        return Err(OcrError::EngineUnavailable(
            "tesseract --version 执行失败".to_string(),
        ));
    }

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(parse_version(&combined))
}

// 格式通常是 "tesseract 5.3.0" 或 "tesseract v5.3.0"
fn parse_version(text: &str) -> String {
    text.lines()
        .filter(|line| line.contains("tesseract"))
        .find_map(|line| line.split_whitespace().nth(1))
        .map(|v| v.trim_start_matches('v').to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
