use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 最终分流结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    AutoResolve,
    AskClarification,
    Escalate,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::AutoResolve => "AUTO_RESOLVE",
            Disposition::AskClarification => "ASK_CLARIFICATION",
            Disposition::Escalate => "ESCALATE",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTO_RESOLVE" => Ok(Disposition::AutoResolve),
            "ASK_CLARIFICATION" => Ok(Disposition::AskClarification),
            "ESCALATE" => Ok(Disposition::Escalate),
            other => Err(format!("未知的处置结果: {}", other)),
        }
    }
}

/// 归一化输入特征，每项应在 `[0, 1]` 内
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Features {
    /// OCR 文本提取质量
    pub ocr_confidence: f64,
    /// 与已知错误码的匹配度
    pub error_code_match: f64,
    /// 聚类先验
    pub cluster_prior: f64,
    /// 与知识库的相似度
    pub rag_similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    /// 预测的错误码，无法识别时为 `"UNKNOWN"`
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Features {
    pub fn has_nan(&self) -> bool {
        [
            self.ocr_confidence,
            self.error_code_match,
            self.cluster_prior,
            self.rag_similarity,
        ]
        .iter()
        .any(|v| v.is_nan())
    }
}

impl Candidate {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            metadata: None,
        }
    }
}

/// `S_k = w1*ocr + w2*error + w3*prior + w4*rag + b_k`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub w1: f64,
    pub w2: f64,
    pub w3: f64,
    pub w4: f64,
    pub default_bias: f64,
    /// 按候选标签索引的偏置
    #[serde(default)]
    pub per_candidate_biases: HashMap<String, f64>,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            w1: 0.3,
            w2: 0.3,
            w3: 0.2,
            w4: 0.2,
            default_bias: 0.0,
            per_candidate_biases: HashMap::new(),
        }
    }
}

impl Weights {
    pub fn bias_for(&self, label: &str) -> f64 {
        self.per_candidate_biases
            .get(label)
            .copied()
            .unwrap_or(self.default_bias)
    }
}

/// 半开区间：`pMis < auto` 自动解决，`pMis >= escalate` 升级
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub auto: f64,
    pub escalate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto: 0.15,
            escalate: 0.50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureScaling {
    pub temperature: f64,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_calibrated: Option<String>,
}

impl TemperatureScaling {
    /// 需要缩放时返回用于除分数的温度
    pub fn effective(&self) -> Option<f64> {
        (self.enabled && self.temperature.is_finite() && self.temperature > 0.0)
            .then_some(self.temperature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetyFlags {
    /// 知识库相似度低于 0.1
    pub rag_miss: bool,
    /// 最高候选为 `UNKNOWN` 标签
    pub unknown_error: bool,
}

impl SafetyFlags {
    pub fn any(&self) -> bool {
        self.rag_miss || self.unknown_error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterScore {
    pub candidate_id: String,
    pub candidate_label: String,
    pub raw_score: f64,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub decision: Disposition,
    pub top_candidate: Option<Candidate>,
    pub top_score: Option<f64>,
    pub top_probability: Option<f64>,
    pub misclassification_prob: f64,
    /// 按输入顺序排列的各候选分数
    pub scores: Vec<ClusterScore>,
    pub all_scores: BTreeMap<String, f64>,
    pub all_probabilities: BTreeMap<String, f64>,
    pub safety_flags: SafetyFlags,
    /// 截断后的特征
    pub features: Features,
}
