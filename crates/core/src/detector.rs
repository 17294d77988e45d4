//! 图片 PII 检测
//!
//! 低置信度单词和界面按钮文字不参与匹配，它们把单词序列切成互不相连的几段，
//! 每段分别交给几何映射得到遮罩区域。

use std::collections::HashSet;

use assist_ocr::{map_regions, BBox, RecognizedWord};
use assist_rules::{mask_snippet, CompiledRule, RuleSet, Strength};
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorConfig {
    /// 低于该置信度的单词不参与匹配 (0-1)
    pub min_word_confidence: f32,
    /// 常见界面文字，整词相等时忽略
    pub ignored_labels: Vec<String>,
    pub rules: RuleSet,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_word_confidence: 0.30,
            ignored_labels: ["Cancel", "OK", "Send", "Upload"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rules: RuleSet::builtin(),
        }
    }
}

/// 一个待遮罩区域
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedRegion {
    /// 来源图片下标
    pub image_index: usize,
    pub rule_id: String,
    pub category: String,
    pub strength: Strength,
    pub bbox: BBox,
    pub confidence: f32,
    /// 脱敏后的命中文本，仅用于展示
    pub snippet: String,
}

impl DetectedRegion {
    /// 去重键：图片下标 + 取整到像素的矩形
    pub fn dedup_key(&self) -> (usize, i64, i64, i64, i64) {
        (
            self.image_index,
            self.bbox.x.round() as i64,
            self.bbox.y.round() as i64,
            self.bbox.w.round() as i64,
            self.bbox.h.round() as i64,
        )
    }
}

/// 按几何键去重，保留首次出现的区域，顺序不变
pub fn dedup_regions(regions: Vec<DetectedRegion>) -> Vec<DetectedRegion> {
    let mut seen = HashSet::new();
    regions
        .into_iter()
        .filter(|r| seen.insert(r.dedup_key()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PiiStats {
    pub detected_count: usize,
    pub confidence_avg: f32,
}

impl PiiStats {
    pub fn from_regions(regions: &[DetectedRegion]) -> Self {
        if regions.is_empty() {
            return Self::default();
        }
        let sum: f32 = regions.iter().map(|r| r.confidence).sum();
        let avg = sum / regions.len() as f32;
        Self {
            detected_count: regions.len(),
            confidence_avg: (avg * 100.0).round() / 100.0,
        }
    }
}

pub struct PiiDetector {
    rules: Vec<CompiledRule>,
    min_word_confidence: f32,
    ignored_labels: Vec<String>,
}

impl PiiDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let rules = config.rules.compile()?;
        log::info!("[Detection] 已加载 {} 条规则", rules.len());
        Ok(Self {
            rules,
            min_word_confidence: config.min_word_confidence,
            ignored_labels: config.ignored_labels.clone(),
        })
    }

    fn keep_word(&self, word: &RecognizedWord) -> bool {
        let text = word.text.trim();
        !text.is_empty()
            && word.confidence >= self.min_word_confidence
            && !self.ignored_labels.iter().any(|label| label == text)
    }

    /// 检测一张图片上的 PII 区域
    ///
    /// 被过滤的单词把单词序列切成若干段，每段单独匹配，命中不会跨过被过滤的单词。
    pub fn detect(&self, image_index: usize, words: &[RecognizedWord]) -> Result<Vec<DetectedRegion>> {
        let filtered = words.iter().filter(|w| !self.keep_word(w)).count();
        if filtered > 0 {
            log::debug!("[Detection] 图片 {}: 过滤 {} 个单词", image_index, filtered);
        }

        let mut regions = Vec::new();
        for run in words.split(|w| !self.keep_word(w)).filter(|run| !run.is_empty()) {
            for region in map_regions(run, &self.rules)? {
                regions.push(DetectedRegion {
                    image_index,
                    rule_id: region.rule_id,
                    category: region.rule_name,
                    strength: region.strength,
                    bbox: region.bbox,
                    confidence: region.confidence,
                    snippet: mask_snippet(&region.span.text),
                });
            }
        }

        for region in &regions {
            log::debug!(
                "[Detection] 图片 {} 命中 {} ({}): {}",
                image_index,
                region.category,
                region.confidence,
                region.snippet
            );
        }
        log::info!("[Detection] 图片 {}: {} 个区域", image_index, regions.len());

        Ok(regions)
    }
}
