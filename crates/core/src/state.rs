//! 会话状态机
//!
//! 纯函数式的状态转移：`PipelineState::apply(action)` 要么应用转移并返回
//! 进入新状态时需要执行的副作用，要么拒绝（状态不变）。
//! 副作用的结果以新的 action 重新派发，状态从不被直接修改。

use assist_render::{ImageBlob, PreprocessedImage};
use assist_triage::Disposition;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::activity::Answer;
use crate::detector::{dedup_regions, DetectedRegion, PiiStats};
use crate::events::PipelineEvent;

/// 重试上限，达到后自动升级为 ESCALATE
pub const MAX_RETRIES: u32 = 3;

pub const PREPROCESS_ERROR_MESSAGE: &str = "An error occurred while processing the image";
pub const DETECTION_ERROR_MESSAGE: &str = "Content analysis failed";
pub const SEND_ERROR_MESSAGE: &str = "Failed to send the message";
pub const TIMEOUT_ERROR_MESSAGE: &str = "No response from the server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatState {
    Idle,
    ImageSelected,
    Preprocessing,
    PiiDetecting,
    PiiReview,
    Sending,
    WaitingResponse,
    AnswerShown,
    End,
    Error,
}

impl ChatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatState::Idle => "IDLE",
            ChatState::ImageSelected => "IMAGE_SELECTED",
            ChatState::Preprocessing => "PREPROCESSING",
            ChatState::PiiDetecting => "PII_DETECTING",
            ChatState::PiiReview => "PII_REVIEW",
            ChatState::Sending => "SENDING",
            ChatState::WaitingResponse => "WAITING_RESPONSE",
            ChatState::AnswerShown => "ANSWER_SHOWN",
            ChatState::End => "END",
            ChatState::Error => "ERROR",
        }
    }

    /// 给用户看的进度提示
    pub fn status_message(&self) -> Option<&'static str> {
        match self {
            ChatState::Preprocessing => Some("Processing image..."),
            ChatState::PiiDetecting => Some("Analyzing content..."),
            ChatState::Sending => Some("Sending..."),
            ChatState::WaitingResponse => Some("Preparing an answer..."),
            _ => None,
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            ChatState::Preprocessing
                | ChatState::PiiDetecting
                | ChatState::Sending
                | ChatState::WaitingResponse
        )
    }
}

impl std::fmt::Display for ChatState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    SelectImages {
        images: Vec<ImageBlob>,
        text: Option<String>,
    },
    RemoveAllImages,
    StartPreprocessing,
    PreprocessingDone {
        images: Vec<PreprocessedImage>,
        elapsed_ms: u64,
    },
    PreprocessingError {
        error: String,
    },
    PiiDetectionDone {
        regions: Vec<DetectedRegion>,
        elapsed_ms: u64,
    },
    PiiDetectionError {
        error: String,
    },
    ConfirmPiiReview {
        masked_images: Vec<ImageBlob>,
    },
    CancelPiiReview,
    SkipPiiReview,
    SendTextOnly {
        text: String,
    },
    StartSending {
        text: Option<String>,
    },
    SendSuccess {
        activity_id: String,
    },
    SendError {
        error: String,
    },
    ResponseReceived {
        answer: Answer,
    },
    ResponseTimeout,
    EndSession {
        reason: Option<String>,
    },
    Retry,
    Reset,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SelectImages { .. } => "SELECT_IMAGE",
            Action::RemoveAllImages => "REMOVE_ALL_IMAGES",
            Action::StartPreprocessing => "START_PREPROCESSING",
            Action::PreprocessingDone { .. } => "PREPROCESSING_DONE",
            Action::PreprocessingError { .. } => "PREPROCESSING_ERROR",
            Action::PiiDetectionDone { .. } => "PII_DETECTION_DONE",
            Action::PiiDetectionError { .. } => "PII_DETECTION_ERROR",
            Action::ConfirmPiiReview { .. } => "CONFIRM_PII_REVIEW",
            Action::CancelPiiReview => "CANCEL_PII_REVIEW",
            Action::SkipPiiReview => "SKIP_PII_REVIEW",
            Action::SendTextOnly { .. } => "SEND_TEXT_ONLY",
            Action::StartSending { .. } => "START_SENDING",
            Action::SendSuccess { .. } => "SEND_SUCCESS",
            Action::SendError { .. } => "SEND_ERROR",
            Action::ResponseReceived { .. } => "RESPONSE_RECEIVED",
            Action::ResponseTimeout => "RESPONSE_TIMEOUT",
            Action::EndSession { .. } => "END_SESSION",
            Action::Retry => "RETRY",
            Action::Reset => "RESET",
        }
    }
}

/// 进入某个状态时需要执行的异步操作
#[derive(Debug, Clone)]
pub enum Effect {
    /// 缩放并重新编码原图
    Preprocess { images: Vec<ImageBlob> },
    /// OCR + 几何映射
    DetectPii { images: Vec<ImageBlob> },
    /// 涂黑确认后的区域
    Mask {
        images: Vec<ImageBlob>,
        regions: Vec<DetectedRegion>,
    },
    /// 发送消息
    Send {
        text: String,
        attachments: Vec<ImageBlob>,
    },
    /// 等待回复超时计时
    ArmResponseTimer,
}

impl Effect {
    pub fn name(&self) -> &'static str {
        match self {
            Effect::Preprocess { .. } => "preprocess",
            Effect::DetectPii { .. } => "detect_pii",
            Effect::Mask { .. } => "mask",
            Effect::Send { .. } => "send",
            Effect::ArmResponseTimer => "response_timer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub preprocessing_time_ms: u64,
    pub pii_detection_time_ms: u64,
}

#[derive(Debug)]
pub enum Transition {
    Applied {
        from: ChatState,
        to: ChatState,
        event: PipelineEvent,
        effects: Vec<Effect>,
    },
    Rejected {
        state: ChatState,
        action: &'static str,
    },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// 单个会话的全部状态，只由会话自己修改
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub session_id: String,
    pub state: ChatState,
    pub previous_state: Option<ChatState>,
    pub images: Vec<ImageBlob>,
    pub processed_images: Vec<PreprocessedImage>,
    pub detected_regions: Vec<DetectedRegion>,
    pub masked_images: Vec<ImageBlob>,
    pub pending_text: String,
    pub retry_count: u32,
    pub error: Option<PipelineError>,
    pub answer: Option<Answer>,
    pub pii_stats: Option<PiiStats>,
    pub stats: ProcessingStats,
    /// 每次成功转移加一，用于识别过期的副作用结果
    pub seq: u64,
}

impl PipelineState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: ChatState::Idle,
            previous_state: None,
            images: Vec::new(),
            processed_images: Vec::new(),
            detected_regions: Vec::new(),
            masked_images: Vec::new(),
            pending_text: String::new(),
            retry_count: 0,
            error: None,
            answer: None,
            pii_stats: None,
            stats: ProcessingStats::default(),
            seq: 0,
        }
    }

    pub fn status_message(&self) -> Option<&'static str> {
        self.state.status_message()
    }

    pub fn is_processing(&self) -> bool {
        self.state.is_processing()
    }

    /// 发送时使用的图片：已遮罩 > 已预处理 > 原图
    pub fn outbound_images(&self) -> Vec<ImageBlob> {
        if !self.masked_images.is_empty() {
            self.masked_images.clone()
        } else if !self.processed_images.is_empty() {
            self.processed_images.iter().map(|p| p.blob.clone()).collect()
        } else {
            self.images.clone()
        }
    }

    pub fn apply(&mut self, action: Action) -> Transition {
        use Action as A;
        use ChatState as S;

        let from = self.state;

        if let A::Reset = action {
            self.clear_session_data();
            self.previous_state = None;
            self.state = S::Idle;
            self.seq += 1;
            return Transition::Applied {
                from,
                to: S::Idle,
                event: PipelineEvent::new("session_reset").with("from", from.as_str()),
                effects: Vec::new(),
            };
        }

        let name = action.name();
        let (to, event) = match (from, action) {
            (S::Idle, A::SelectImages { images, text }) => {
                let event = PipelineEvent::new("image_selected").with("count", images.len());
                if !images.is_empty() {
                    self.images = images;
                }
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    self.pending_text = text;
                }
                (S::ImageSelected, event)
            }
            (S::Idle, A::SendTextOnly { text }) => {
                if !text.is_empty() {
                    self.pending_text = text;
                }
                (S::Sending, PipelineEvent::new("text_message_sending"))
            }
            (S::ImageSelected, A::RemoveAllImages) => {
                self.images.clear();
                self.processed_images.clear();
                (S::Idle, PipelineEvent::new("images_cleared"))
            }
            (S::ImageSelected, A::StartPreprocessing) => {
                (S::Preprocessing, PipelineEvent::new("preprocessing_started"))
            }
            (S::Preprocessing, A::PreprocessingDone { images, elapsed_ms }) => {
                self.processed_images = images;
                self.stats.preprocessing_time_ms = elapsed_ms;
                let event = PipelineEvent::new("preprocessing_completed")
                    .with("processingTimeMs", elapsed_ms)
                    .with("count", self.processed_images.len());
                (S::PiiDetecting, event)
            }
            (S::Preprocessing, A::PreprocessingError { error }) => {
                let event = PipelineEvent::new("preprocessing_failed").with("error", error.as_str());
                self.fail(PREPROCESS_ERROR_MESSAGE, error);
                (S::Error, event)
            }
            (S::PiiDetecting, A::PiiDetectionDone { regions, elapsed_ms }) => {
                let regions = dedup_regions(regions);
                let stats = PiiStats::from_regions(&regions);
                let event = PipelineEvent::new("pii_detection_completed")
                    .with("detectionCount", regions.len())
                    .with("confidenceAvg", stats.confidence_avg)
                    .with("processingTimeMs", elapsed_ms);
                self.stats.pii_detection_time_ms = elapsed_ms;
                self.pii_stats = Some(stats);
                let to = if regions.is_empty() { S::Sending } else { S::PiiReview };
                self.detected_regions = regions;
                (to, event)
            }
            (S::PiiDetecting, A::PiiDetectionError { error }) => {
                let event = PipelineEvent::new("pii_detection_failed").with("error", error.as_str());
                self.fail(DETECTION_ERROR_MESSAGE, error);
                (S::Error, event)
            }
            (S::PiiReview, A::ConfirmPiiReview { masked_images }) => {
                if !masked_images.is_empty() {
                    self.masked_images = masked_images;
                }
                let event = PipelineEvent::new("pii_review_submitted")
                    .with("maskedCount", self.masked_images.len());
                (S::Sending, event)
            }
            (S::PiiReview, A::CancelPiiReview) => {
                self.images.clear();
                self.processed_images.clear();
                self.detected_regions.clear();
                (S::Idle, PipelineEvent::new("pii_review_cancelled"))
            }
            (S::PiiReview, A::SkipPiiReview) => (S::Sending, PipelineEvent::new("pii_review_skipped")),
            (S::Sending, A::SendSuccess { activity_id }) => {
                self.clear_outbound();
                let event = PipelineEvent::new("masked_message_sent").with("activityId", activity_id);
                (S::WaitingResponse, event)
            }
            (S::Sending, A::SendError { error }) => {
                let event = PipelineEvent::new("send_failed").with("error", error.as_str());
                self.fail(SEND_ERROR_MESSAGE, error);
                (S::Error, event)
            }
            (S::WaitingResponse, A::ResponseReceived { answer }) => {
                let event = PipelineEvent::new("response_received")
                    .with("answerType", answer.disposition.as_str());
                self.answer = Some(answer);
                self.retry_count = 0;
                (S::AnswerShown, event)
            }
            (S::WaitingResponse, A::ResponseTimeout) => {
                self.fail_without_detail(TIMEOUT_ERROR_MESSAGE);
                (S::Error, PipelineEvent::new("response_timeout"))
            }
            (S::AnswerShown, A::EndSession { reason }) => {
                let mut event = PipelineEvent::new("session_ended");
                if let Some(reason) = reason {
                    event = event.with("reason", reason);
                }
                (S::End, event)
            }
            (S::AnswerShown, A::StartSending { text }) => {
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    self.pending_text = text;
                }
                (S::Sending, PipelineEvent::new("message_sending"))
            }
            (S::Error, A::Retry) => {
                let event = PipelineEvent::new("retry_attempted").with("retryCount", self.retry_count);
                if self.retry_count >= MAX_RETRIES {
                    // 升级后重新计数，下一次发送仍有完整的重试机会
                    self.retry_count = 0;
                    self.error = None;
                    self.answer = Some(Answer {
                        disposition: Disposition::Escalate,
                        text: String::new(),
                        data: Some(json!({ "reason": "max_retries_exceeded" })),
                    });
                    (S::AnswerShown, event.with("escalated", true))
                } else {
                    self.error = None;
                    (self.previous_state.unwrap_or(S::Idle), event)
                }
            }
            (state, _) => {
                return Transition::Rejected {
                    state,
                    action: name,
                }
            }
        };

        self.previous_state = Some(from);
        self.state = to;
        self.seq += 1;

        Transition::Applied {
            from,
            to,
            event,
            effects: self.entry_effects(),
        }
    }

    /// 进入当前状态需要执行的副作用
    fn entry_effects(&self) -> Vec<Effect> {
        match self.state {
            ChatState::Preprocessing => vec![Effect::Preprocess {
                images: self.images.clone(),
            }],
            ChatState::PiiDetecting => vec![Effect::DetectPii {
                images: self.processed_images.iter().map(|p| p.blob.clone()).collect(),
            }],
            ChatState::Sending => vec![Effect::Send {
                text: self.pending_text.clone(),
                attachments: self.outbound_images(),
            }],
            ChatState::WaitingResponse => vec![Effect::ArmResponseTimer],
            _ => Vec::new(),
        }
    }

    fn fail(&mut self, message: &str, detail: String) {
        self.error = Some(PipelineError {
            message: message.to_string(),
            detail: Some(detail),
        });
        self.retry_count += 1;
    }

    fn fail_without_detail(&mut self, message: &str) {
        self.error = Some(PipelineError {
            message: message.to_string(),
            detail: None,
        });
        self.retry_count += 1;
    }

    /// 发送成功后丢弃所有出站数据
    fn clear_outbound(&mut self) {
        self.pending_text.clear();
        self.images.clear();
        self.processed_images.clear();
        self.detected_regions.clear();
        self.masked_images.clear();
    }

    /// 除重试计数和会话标识外全部清空
    fn clear_session_data(&mut self) {
        self.clear_outbound();
        self.error = None;
        self.answer = None;
        self.pii_stats = None;
        self.stats = ProcessingStats::default();
    }
}
