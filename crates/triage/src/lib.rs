//! 分级评分引擎
//!
//! 把归一化特征和候选解释转换成校准后的概率分布，再决定自动解决、追问或升级。
//! 硬性安全规则优先于统计分数。
//!
//! 这里的函数都是纯函数，模型配置只是普通数据。

mod config;
mod scoring;
mod types;

pub use config::{load_model_config, save_model_config, ModelConfig, DEFAULT_MODEL_VERSION};
pub use scoring::{
    check_safety_rules, clamp01, compute_raw_score, decide, misclassification_probability,
    score_clusters, softmax, softmax_with_temperature, validate_and_clamp_features,
    UNKNOWN_LABEL,
};
pub use types::{
    Candidate, ClusterScore, Disposition, Features, SafetyFlags, ScoringResult,
    TemperatureScaling, Thresholds, Weights,
};

pub type Result<T> = std::result::Result<T, TriageError>;

#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("分数向量退化: {0}")]
    DegenerateScores(String),
    #[error("模型配置无效: {0}")]
    InvalidConfig(String),
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}
