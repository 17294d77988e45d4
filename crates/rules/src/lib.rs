//! 敏感信息规则字典
//!
//! 定义 PII 类别、内置匹配规则（正则 / 词典），以及文本归一化。
//! 所有函数都是纯函数，规则表在首次使用时编译并只读共享。

mod normalize;
mod patterns;

pub use normalize::{fold_width, normalize};
pub use patterns::{find, PiiCategory, Strength, PREFECTURES};

use regex::Regex;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, RulesError>;

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("规则 {id} 的正则表达式无效: {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("规则 {0} 的词典为空")]
    EmptyDictionary(String),
}

/// 一次原始匹配
///
/// `start` / `end` 是被搜索文本中的字节偏移。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// 可执行的匹配模式
#[derive(Debug, Clone)]
pub enum Pattern {
    /// 正则表达式
    Regex(Regex),
    /// 词典成员匹配
    Lexicon(Vec<String>),
}

impl Pattern {
    /// 返回按起始位置排序的所有匹配
    pub fn find_all(&self, text: &str) -> Vec<RawMatch> {
        let mut matches = Vec::new();

        match self {
            Pattern::Regex(re) => {
                for m in re.find_iter(text) {
                    matches.push(RawMatch {
                        text: m.as_str().to_string(),
                        start: m.start(),
                        end: m.end(),
                    });
                }
            }
            Pattern::Lexicon(words) => {
                for word in words.iter().filter(|w| !w.is_empty()) {
                    for (pos, found) in text.match_indices(word.as_str()) {
                        matches.push(RawMatch {
                            text: found.to_string(),
                            start: pos,
                            end: pos + found.len(),
                        });
                    }
                }
            }
        }

        matches.sort_by_key(|m| (m.start, m.end));
        matches.dedup_by(|a, b| a.start == b.start && a.end == b.end);
        matches
    }
}

/// 规则类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RuleType {
    /// 内置类别
    Builtin(PiiCategory),
    /// 自定义正则
    Regex(String),
    /// 自定义词典
    Dictionary(Vec<String>),
}

/// 检测规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// 唯一标识符
    pub id: String,
    /// 用户可读的名称
    pub name: String,
    /// 是否启用
    pub enabled: bool,
    /// 匹配强度；内置类别忽略此字段，使用类别自身的强度
    #[serde(default)]
    pub strength: Strength,
    pub rule_type: RuleType,
}

impl Rule {
    /// 由内置类别构造规则
    pub fn builtin(category: PiiCategory) -> Self {
        Self {
            id: category.as_str().to_ascii_lowercase(),
            name: category.as_str().to_string(),
            enabled: true,
            strength: category.strength(),
            rule_type: RuleType::Builtin(category),
        }
    }

    fn effective_strength(&self) -> Strength {
        match &self.rule_type {
            RuleType::Builtin(category) => category.strength(),
            _ => self.strength,
        }
    }
}

/// 编译完成、可直接执行的规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub name: String,
    pub strength: Strength,
    pub pattern: Pattern,
}

impl CompiledRule {
    pub fn find_all(&self, text: &str) -> Vec<RawMatch> {
        self.pattern.find_all(text)
    }
}

/// 规则集合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// 创建空规则集
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// 启用全部内置类别的规则集
    pub fn builtin() -> Self {
        Self {
            rules: PiiCategory::ALL.iter().copied().map(Rule::builtin).collect(),
        }
    }

    /// 添加规则
    pub fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// 获取所有启用的规则
    pub fn enabled_rules(&self) -> Vec<&Rule> {
        self.rules.iter().filter(|r| r.enabled).collect()
    }

    /// 编译所有启用的规则
    pub fn compile(&self) -> Result<Vec<CompiledRule>> {
        self.enabled_rules()
            .into_iter()
            .map(|rule| {
                let pattern = match &rule.rule_type {
                    RuleType::Builtin(category) => category.pattern(),
                    RuleType::Regex(source) => Pattern::Regex(Regex::new(source).map_err(|e| {
                        RulesError::InvalidPattern {
                            id: rule.id.clone(),
                            source: e,
                        }
                    })?),
                    RuleType::Dictionary(words) => {
                        let words: Vec<String> = words
                            .iter()
                            .map(|w| w.trim().to_string())
                            .filter(|w| !w.is_empty())
                            .collect();
                        if words.is_empty() {
                            return Err(RulesError::EmptyDictionary(rule.id.clone()));
                        }
                        Pattern::Lexicon(words)
                    }
                };

                Ok(CompiledRule {
                    id: rule.id.clone(),
                    name: rule.name.clone(),
                    strength: rule.effective_strength(),
                    pattern,
                })
            })
            .collect()
    }
}

/// 脱敏显示 snippet，用于日志和审计，避免原文泄露
pub fn mask_snippet(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();

    if len <= 4 {
        "*".repeat(len)
    } else {
        let visible = 4.min(len / 3);
        let prefix: String = chars[..visible].iter().collect();
        let suffix: String = chars[len - visible..].iter().collect();
        format!("{}****{}", prefix, suffix)
    }
}
