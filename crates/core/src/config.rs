use std::time::Duration;

use assist_render::PreprocessOptions;
use serde::{Deserialize, Serialize};

use crate::detector::DetectorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// 显示名称，为空时自动生成 `User-xxxxxxxx`
    pub user_name: Option<String>,
    /// 等待后端回复的超时（秒）
    pub response_timeout_secs: u64,
    pub preprocess: PreprocessOptions,
    pub detector: DetectorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_name: None,
            response_timeout_secs: 60,
            preprocess: PreprocessOptions::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"responseTimeoutSecs": 5}"#).unwrap();
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.preprocess.max_side, 1600);
        assert_eq!(config.detector.ignored_labels.len(), 4);
        assert!(config.user_name.is_none());
    }
}
