//! Chat session orchestration.
//!
//! Drives a support conversation through image preprocessing, PII detection,
//! user review, masking and delivery, then waits for the backend's answer.

pub mod activity;
pub mod config;
pub mod detector;
pub mod events;
pub mod pipeline;
pub mod session;
pub mod state;
pub mod transport;

pub use activity::{parse_disposition, Activity, Answer, Attachment, ChannelAccount};
pub use config::SessionConfig;
pub use detector::{dedup_regions, DetectedRegion, DetectorConfig, PiiDetector, PiiStats};
pub use events::{EventSink, FanoutSink, LogSink, PipelineEvent, RingBufferSink};
pub use pipeline::{ImagePipeline, StandardPipeline};
pub use session::{ChatHandle, ChatSession, StateSnapshot};
pub use state::{Action, ChatState, Effect, PipelineError, PipelineState, Transition, MAX_RETRIES};
pub use transport::{LoopbackReply, LoopbackTransport, Subscription, Transport};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("规则错误: {0}")]
    Rules(#[from] assist_rules::RulesError),

    #[error("几何映射失败: {0}")]
    Geometry(#[from] assist_ocr::GeometryError),

    #[error("OCR 失败: {0}")]
    Ocr(#[from] assist_ocr::OcrError),

    #[error("图片处理失败: {0}")]
    Render(#[from] assist_render::RenderError),

    #[error("分级失败: {0}")]
    Triage(#[from] assist_triage::TriageError),

    #[error("发送失败: {0}")]
    Transport(String),

    #[error("会话已关闭")]
    ChannelClosed,

    #[error("后台任务失败: {0}")]
    Task(String),

    #[error("等待状态超时")]
    WaitTimeout,
}
