//! 文本匹配到像素矩形的映射
//!
//! 全文由所有单词以单个空格连接而成，这就是所有偏移计算共用的坐标系：
//! 第 i 个单词占据 `[offset_i, offset_i + len_i)`，下一个单词从 `offset_i + len_i + 1` 开始。
//! 偏移单位是字符（不是字节）。

use assist_rules::{fold_width, CompiledRule, Pattern, Strength};
use serde::{Deserialize, Serialize};

use crate::{BBox, GeometryError, RecognizedWord};

/// 弱规则匹配区域的置信度系数
pub const WEAK_CONFIDENCE_FACTOR: f32 = 0.5;

/// 单词分隔符
const SEPARATOR: char = ' ';

/// 一段完整解析的匹配
///
/// 起止单词下标都指向真实存在的单词，`start_word_index <= end_word_index`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedSpan {
    pub text: String,
    pub start_word_index: usize,
    pub end_word_index: usize,
    pub start_char_index: usize,
    pub end_char_index: usize,
    pub confidence: f32,
}

/// 单词在全文中的位置表
#[derive(Debug, Clone)]
pub struct WordIndex {
    /// (起始字符偏移, 字符数)
    entries: Vec<(usize, usize)>,
}

impl WordIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 第 i 个单词的字符区间 `[start, end)`
    pub fn char_range(&self, i: usize) -> Option<(usize, usize)> {
        self.entries.get(i).map(|&(start, len)| (start, start + len))
    }

    /// 找到包含 `start` 的第一个单词和包含 `end`（开区间右端）的第一个单词
    fn resolve(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let first = self
            .entries
            .iter()
            .position(|&(offset, len)| start >= offset && start < offset + len)?;
        let last = self
            .entries
            .iter()
            .position(|&(offset, len)| end > offset && end <= offset + len)?;
        (first <= last).then_some((first, last))
    }
}

pub fn index_words(words: &[RecognizedWord]) -> WordIndex {
    let mut entries = Vec::with_capacity(words.len());
    let mut offset = 0usize;
    for word in words {
        let len = word.text.chars().count();
        entries.push((offset, len));
        offset += len + 1;
    }
    WordIndex { entries }
}

pub fn reconstruct_text(words: &[RecognizedWord]) -> String {
    let mut text = String::new();
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            text.push(SEPARATOR);
        }
        text.push_str(&word.text);
    }
    text
}

/// 在全文上执行模式匹配，并把每个匹配还原到单词区间
///
/// `full_text` 必须是 [`reconstruct_text`] 对同一组单词的结果。
/// 起点或终点落在分隔符上的匹配会被丢弃。
pub fn match_spans(full_text: &str, words: &[RecognizedWord], pattern: &Pattern) -> Vec<MatchedSpan> {
    let index = index_words(words);
    let mut spans = Vec::new();

    for m in pattern.find_all(full_text) {
        let start = full_text[..m.start].chars().count();
        let len = m.text.chars().count();
        if len == 0 {
            continue;
        }
        let end = start + len;

        let Some((first, last)) = index.resolve(start, end) else {
            continue;
        };

        let covered = &words[first..=last];
        let mean = covered.iter().map(|w| w.confidence).sum::<f32>() / covered.len() as f32;

        spans.push(MatchedSpan {
            text: m.text,
            start_word_index: first,
            end_word_index: last,
            start_char_index: start,
            end_char_index: end,
            confidence: round2(mean),
        });
    }

    spans
}

/// 匹配区间内每个单词的原始矩形
///
/// 越界下标被跳过；起点大于终点时返回空列表。
pub fn span_to_boxes(span: &MatchedSpan, words: &[RecognizedWord]) -> Vec<BBox> {
    (span.start_word_index..=span.end_word_index)
        .filter_map(|i| words.get(i))
        .map(RecognizedWord::bbox)
        .collect()
}

/// 最小外接矩形
pub fn merge_boxes(boxes: &[BBox]) -> Result<BBox, GeometryError> {
    let (first, rest) = boxes.split_first().ok_or(GeometryError::EmptyInput)?;
    Ok(rest.iter().fold(*first, |acc, b| acc.union(b)))
}

/// 一条规则在一张图片上命中的区域
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRegion {
    pub rule_id: String,
    pub rule_name: String,
    pub strength: Strength,
    pub span: MatchedSpan,
    pub bbox: BBox,
    pub confidence: f32,
}

/// 对一组单词执行全部规则，得到合并后的遮罩区域
///
/// 匹配在宽度折叠后的文本上进行（全角数字也能命中），折叠不改变字符数，偏移不受影响。
/// 不同规则命中同一段文字时各自产生区域，不做去重。
pub fn map_regions(
    words: &[RecognizedWord],
    rules: &[CompiledRule],
) -> Result<Vec<MappedRegion>, GeometryError> {
    let folded: Vec<RecognizedWord> = words
        .iter()
        .map(|w| RecognizedWord {
            text: fold_width(&w.text),
            ..w.clone()
        })
        .collect();
    let full_text = reconstruct_text(&folded);

    let mut regions = Vec::new();
    for rule in rules {
        for span in match_spans(&full_text, &folded, &rule.pattern) {
            let bbox = merge_boxes(&span_to_boxes(&span, words))?;
            let confidence = match rule.strength {
                Strength::Strong => span.confidence,
                Strength::Weak => round2(span.confidence * WEAK_CONFIDENCE_FACTOR),
            };
            regions.push(MappedRegion {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                strength: rule.strength,
                span,
                bbox,
                confidence,
            });
        }
    }

    Ok(regions)
}

fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}
