use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use assist_core::SessionConfig;
use assist_ocr::TesseractConfig;

pub const DEFAULT_CONFIG_PATH: &str = "linch-assist.json";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    // ============ 会话 ============
    /// 预处理、检测规则和回复超时
    pub session: SessionConfig,

    // ============ OCR ============
    pub tesseract: TesseractConfig,

    // ============ 分级模型 ============
    /// 模型配置文件，未设置时使用内置默认值
    pub model_path: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 读取配置，文件不存在时返回默认值
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        log::info!("[Config] {} 不存在，使用默认配置", path.display());
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let raw = serde_json::to_string_pretty(config)?;
    fs::write(path, raw)?;
    log::info!("[Config] 已写入 {}", path.display());
    Ok(())
}
