use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{TemperatureScaling, Thresholds, Weights};
use crate::{Result, TriageError};

pub const DEFAULT_MODEL_VERSION: &str = "1.0.0";

/// 带版本的评分配置，替换模型只需换文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub version: String,
    pub released_at: String,
    pub weights: Weights,
    pub thresholds: Thresholds,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_scaling: Option<TemperatureScaling>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_MODEL_VERSION.to_string(),
            released_at: String::new(),
            weights: Weights::default(),
            thresholds: Thresholds::default(),
            temperature_scaling: None,
        }
    }
}

impl ModelConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: ModelConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        let named = [
            ("w1", w.w1),
            ("w2", w.w2),
            ("w3", w.w3),
            ("w4", w.w4),
            ("default_bias", w.default_bias),
        ];
        for (name, value) in named {
            if !value.is_finite() {
                return Err(invalid(format!("权重 {} 不是有限数", name)));
            }
        }
        for (label, bias) in &w.per_candidate_biases {
            if !bias.is_finite() {
                return Err(invalid(format!("{} 的偏置不是有限数", label)));
            }
        }

        let t = &self.thresholds;
        for (name, value) in [("auto", t.auto), ("escalate", t.escalate)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("阈值 {} = {} 超出 [0, 1]", name, value)));
            }
        }
        if t.auto > t.escalate {
            return Err(invalid(format!(
                "阈值 auto ({}) 大于 escalate ({})",
                t.auto, t.escalate
            )));
        }

        if let Some(ts) = &self.temperature_scaling {
            if ts.enabled && !(ts.temperature.is_finite() && ts.temperature > 0.0) {
                return Err(invalid(format!(
                    "启用温度缩放时温度必须大于 0，实际为 {}",
                    ts.temperature
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: String) -> TriageError {
    TriageError::InvalidConfig(msg)
}

pub fn load_model_config(path: &Path) -> Result<ModelConfig> {
    let raw = fs::read_to_string(path)?;
    let config = ModelConfig::from_json_str(&raw)?;
    log::info!(
        "[Triage] 已从 {} 加载模型配置 {}",
        path.display(),
        config.version
    );
    Ok(config)
}

pub fn save_model_config(path: &Path, config: &ModelConfig) -> Result<()> {
    config.validate()?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": "1.2.0",
        "released_at": "2025-01-15T00:00:00Z",
        "weights": {
            "w1": 0.25, "w2": 0.35, "w3": 0.2, "w4": 0.2,
            "default_bias": 0.0,
            "per_candidate_biases": { "error_001": 0.1 }
        },
        "thresholds": { "auto": 0.2, "escalate": 0.6 },
        "temperature_scaling": { "temperature": 1.3, "enabled": true, "last_calibrated": "2025-01-10" }
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config = ModelConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.version, "1.2.0");
        assert_eq!(config.weights.bias_for("error_001"), 0.1);
        assert_eq!(config.thresholds.escalate, 0.6);
        assert_eq!(
            config.temperature_scaling.as_ref().and_then(|t| t.effective()),
            Some(1.3)
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = ModelConfig::from_json_str(r#"{"version":"2.0.0"}"#).unwrap();
        assert_eq!(config.weights, Weights::default());
        assert_eq!(config.thresholds, Thresholds::default());
        assert!(config.temperature_scaling.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_thresholds = r#"{"thresholds":{"auto":0.7,"escalate":0.5}}"#;
        assert!(matches!(
            ModelConfig::from_json_str(bad_thresholds),
            Err(TriageError::InvalidConfig(_))
        ));

        let out_of_range = r#"{"thresholds":{"auto":0.1,"escalate":1.5}}"#;
        assert!(ModelConfig::from_json_str(out_of_range).is_err());

        let bad_temp = r#"{"temperature_scaling":{"temperature":0,"enabled":true}}"#;
        assert!(ModelConfig::from_json_str(bad_temp).is_err());

        let disabled_temp = r#"{"temperature_scaling":{"temperature":0,"enabled":false}}"#;
        assert!(ModelConfig::from_json_str(disabled_temp).is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("scoring.json");
        let config = ModelConfig::from_json_str(SAMPLE).unwrap();
        save_model_config(&path, &config).unwrap();
        assert_eq!(load_model_config(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_model_config(&dir.path().join("nope.json"));
        assert!(matches!(result, Err(TriageError::Io(_))));
    }
}
