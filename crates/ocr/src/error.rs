//! OCR 错误类型

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR 引擎不可用: {0}")]
    EngineUnavailable(String),

    #[error("识别失败: {0}")]
    Recognition(String),

    #[error("输出解析失败: {0}")]
    Parse(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 几何映射错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GeometryError {
    #[error("无法合并空的矩形列表")]
    EmptyInput,
}
