//! 会话运行时
//!
//! `ChatSession` 独占 `PipelineState`，按顺序串行处理命令；副作用在独立任务中执行，
//! 结果以带序号的命令送回，序号不再匹配的结果直接丢弃。
//! `ChatHandle` 给界面层使用：派发 action、确认遮罩、观察状态快照。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::activity::{Activity, Answer};
use crate::config::SessionConfig;
use crate::detector::{DetectedRegion, PiiStats};
use crate::events::{EventSink, PipelineEvent};
use crate::pipeline::ImagePipeline;
use crate::state::{Action, ChatState, Effect, PipelineError, PipelineState, ProcessingStats, Transition};
use crate::transport::{Subscription, Transport};
use crate::{CoreError, Result};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// 给渲染层的只读快照，图片只给数量
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub session_id: String,
    pub state: ChatState,
    pub previous_state: Option<ChatState>,
    pub status_message: Option<&'static str>,
    pub is_processing: bool,
    pub image_count: usize,
    pub processed_count: usize,
    pub masked_count: usize,
    pub detected_regions: Vec<DetectedRegion>,
    pub pending_text: String,
    pub retry_count: u32,
    pub error: Option<PipelineError>,
    pub answer: Option<Answer>,
    pub pii_stats: Option<PiiStats>,
    pub stats: ProcessingStats,
    pub seq: u64,
}

impl From<&PipelineState> for StateSnapshot {
    fn from(state: &PipelineState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            state: state.state,
            previous_state: state.previous_state,
            status_message: state.status_message(),
            is_processing: state.is_processing(),
            image_count: state.images.len(),
            processed_count: state.processed_images.len(),
            masked_count: state.masked_images.len(),
            detected_regions: state.detected_regions.clone(),
            pending_text: state.pending_text.clone(),
            retry_count: state.retry_count,
            error: state.error.clone(),
            answer: state.answer.clone(),
            pii_stats: state.pii_stats,
            stats: state.stats,
            seq: state.seq,
        }
    }
}

#[derive(Debug)]
enum Command {
    Dispatch(Action),
    ConfirmReview(Vec<DetectedRegion>),
    EffectResult { seq: u64, action: Action },
}

/// 界面层持有的句柄，全部丢弃后会话结束
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<StateSnapshot>,
}

impl ChatHandle {
    pub async fn dispatch(&self, action: Action) -> Result<()> {
        self.commands
            .send(Command::Dispatch(action))
            .await
            .map_err(|_| CoreError::ChannelClosed)
    }

    /// 用给定区域遮罩当前图片，完成后派发 CONFIRM_PII_REVIEW
    pub async fn confirm_review(&self, regions: Vec<DetectedRegion>) -> Result<()> {
        self.commands
            .send(Command::ConfirmReview(regions))
            .await
            .map_err(|_| CoreError::ChannelClosed)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshots.clone()
    }

    /// 等待满足条件的快照（包括当前快照）
    pub async fn wait_for<F>(&self, pred: F, timeout: Duration) -> Result<StateSnapshot>
    where
        F: FnMut(&StateSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(pred).await.map(|snapshot| snapshot.clone())
        })
        .await;
        match waited {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(CoreError::ChannelClosed),
            Err(_) => Err(CoreError::WaitTimeout),
        }
    }
}

pub struct ChatSession {
    state: PipelineState,
    config: SessionConfig,
    pipeline: Arc<dyn ImagePipeline>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    commands: mpsc::Receiver<Command>,
    results: mpsc::WeakSender<Command>,
    snapshots: watch::Sender<StateSnapshot>,
    /// 发送确认之前就到达的回复
    early_answer: Option<Answer>,
}

impl ChatSession {
    pub fn new(
        config: SessionConfig,
        pipeline: Arc<dyn ImagePipeline>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
    ) -> (Self, ChatHandle) {
        let state = PipelineState::new(uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(StateSnapshot::from(&state));

        log::info!(
            "[Pipeline] 会话 {} 已创建，用户: {}",
            state.session_id,
            transport.user().name
        );

        let session = Self {
            state,
            config,
            pipeline,
            transport,
            sink,
            commands: rx,
            results: tx.downgrade(),
            snapshots: snapshot_tx,
            early_answer: None,
        };
        let handle = ChatHandle {
            commands: tx,
            snapshots: snapshot_rx,
        };
        (session, handle)
    }

    /// 事件循环，所有句柄丢弃后返回
    pub async fn run(mut self) -> Result<()> {
        let mut subscription = Subscription::new(self.transport.as_ref());
        let mut inbound_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle(command),
                        None => break,
                    }
                }
                inbound = subscription.next(), if inbound_open => {
                    match inbound {
                        Some(activity) => self.on_inbound(activity),
                        None => {
                            log::warn!("[Pipeline] 传输层已关闭，不再接收回复");
                            inbound_open = false;
                        }
                    }
                }
            }
        }

        log::info!("[Pipeline] 会话 {} 结束", self.state.session_id);
        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Dispatch(action) => self.dispatch(action),
            Command::ConfirmReview(regions) => {
                if self.state.state != ChatState::PiiReview {
                    self.reject(self.state.state, "CONFIRM_PII_REVIEW");
                    return;
                }
                let images = if self.state.processed_images.is_empty() {
                    self.state.images.clone()
                } else {
                    self.state.processed_images.iter().map(|p| p.blob.clone()).collect()
                };
                self.spawn_effect(Effect::Mask { images, regions });
            }
            Command::EffectResult { seq, action } => {
                if seq != self.state.seq {
                    log::debug!(
                        "[Pipeline] 丢弃过期结果 {} (seq {} != {})",
                        action.name(),
                        seq,
                        self.state.seq
                    );
                    return;
                }
                self.dispatch(action);
            }
        }
    }

    fn on_inbound(&mut self, activity: Activity) {
        let answer = activity.answer();
        match self.state.state {
            ChatState::WaitingResponse => self.dispatch(Action::ResponseReceived { answer }),
            ChatState::Sending => {
                log::debug!("[Pipeline] 回复先于发送确认到达，暂存");
                self.early_answer = Some(answer);
            }
            state => log::debug!("[Pipeline] 状态 {} 下忽略入站消息", state),
        }
    }

    fn dispatch(&mut self, action: Action) {
        let name = action.name();
        match self.state.apply(action) {
            Transition::Applied {
                from,
                to,
                event,
                effects,
            } => {
                log::info!("[Pipeline] {}: {} -> {}", name, from, to);
                self.sink.record(&event);
                for effect in effects {
                    self.spawn_effect(effect);
                }
                self.publish();

                match to {
                    ChatState::WaitingResponse => {
                        if let Some(answer) = self.early_answer.take() {
                            self.dispatch(Action::ResponseReceived { answer });
                        }
                    }
                    ChatState::Sending => {}
                    _ => self.early_answer = None,
                }
            }
            Transition::Rejected { state, action } => self.reject(state, action),
        }
    }

    fn reject(&self, state: ChatState, action: &str) {
        log::warn!("[Pipeline] 状态 {} 不接受 {}，已忽略", state, action);
        self.sink.record(
            &PipelineEvent::new("transition_rejected")
                .with("state", state.as_str())
                .with("action", action),
        );
    }

    fn publish(&self) {
        self.snapshots.send_replace(StateSnapshot::from(&self.state));
    }

    fn spawn_effect(&self, effect: Effect) {
        let seq = self.state.seq;
        let results = self.results.clone();
        log::debug!("[Pipeline] 调度 {} (seq {})", effect.name(), seq);

        match effect {
            Effect::Preprocess { images } => {
                let pipeline = self.pipeline.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let action = match pipeline.preprocess(images).await {
                        Ok(images) => Action::PreprocessingDone {
                            images,
                            elapsed_ms: elapsed_ms(started),
                        },
                        Err(e) => {
                            log::error!("[Pipeline] 预处理失败: {}", e);
                            Action::PreprocessingError { error: e.to_string() }
                        }
                    };
                    deliver(results, seq, action).await;
                });
            }
            Effect::DetectPii { images } => {
                let pipeline = self.pipeline.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let action = match pipeline.detect(images).await {
                        Ok(regions) => Action::PiiDetectionDone {
                            regions,
                            elapsed_ms: elapsed_ms(started),
                        },
                        Err(e) => {
                            log::error!("[Pipeline] PII 检测失败: {}", e);
                            Action::PiiDetectionError { error: e.to_string() }
                        }
                    };
                    deliver(results, seq, action).await;
                });
            }
            Effect::Mask { images, regions } => {
                let pipeline = self.pipeline.clone();
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    match pipeline.mask(images, regions).await {
                        Ok(masked_images) => {
                            deliver(results, seq, Action::ConfirmPiiReview { masked_images }).await
                        }
                        Err(e) => {
                            // 停留在 PII_REVIEW，用户可以重试、跳过或取消
                            log::error!("[Pipeline] 遮罩失败: {}", e);
                            sink.record(&PipelineEvent::new("pii_masking_failed").with("error", e.to_string()));
                        }
                    }
                });
            }
            Effect::Send { text, attachments } => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let activity = Activity::message(transport.user().clone(), text, &attachments);
                    let action = match transport.post_activity(activity).await {
                        Ok(activity_id) => Action::SendSuccess { activity_id },
                        Err(e) => {
                            log::error!("[Pipeline] 发送失败: {}", e);
                            Action::SendError { error: e.to_string() }
                        }
                    };
                    deliver(results, seq, action).await;
                });
            }
            Effect::ArmResponseTimer => {
                let timeout = self.config.response_timeout();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    deliver(results, seq, Action::ResponseTimeout).await;
                });
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

async fn deliver(results: mpsc::WeakSender<Command>, seq: u64, action: Action) {
    let Some(tx) = results.upgrade() else {
        log::debug!("[Pipeline] 会话已结束，丢弃 {}", action.name());
        return;
    };
    if tx.send(Command::EffectResult { seq, action }).await.is_err() {
        log::debug!("[Pipeline] 会话已结束，结果未送达");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RingBufferSink;
    use crate::transport::{LoopbackReply, LoopbackTransport};
    use assist_ocr::BBox;
    use assist_render::{ImageBlob, PreprocessedImage};
    use assist_rules::Strength;
    use assist_triage::Disposition;
    use async_trait::async_trait;

    const WAIT: Duration = Duration::from_secs(5);

    struct FakePipeline {
        regions: Vec<DetectedRegion>,
        delay: Duration,
    }

    #[async_trait]
    impl ImagePipeline for FakePipeline {
        async fn preprocess(&self, images: Vec<ImageBlob>) -> Result<Vec<PreprocessedImage>> {
            tokio::time::sleep(self.delay).await;
            Ok(images
                .iter()
                .map(|blob| PreprocessedImage {
                    blob: ImageBlob::new(format!("p_{}", blob.name), "image/jpeg", blob.bytes.clone()),
                    width: 10,
                    height: 10,
                    original_width: 10,
                    original_height: 10,
                    content_hash: blob.content_hash(),
                })
                .collect())
        }

        async fn detect(&self, _images: Vec<ImageBlob>) -> Result<Vec<DetectedRegion>> {
            Ok(self.regions.clone())
        }

        async fn mask(&self, images: Vec<ImageBlob>, _regions: Vec<DetectedRegion>) -> Result<Vec<ImageBlob>> {
            Ok(images
                .iter()
                .map(|blob| ImageBlob::new(format!("masked_{}", blob.name), blob.content_type.clone(), blob.bytes.clone()))
                .collect())
        }
    }

    fn region() -> DetectedRegion {
        DetectedRegion {
            image_index: 0,
            rule_id: "email".into(),
            category: "EMAIL".into(),
            strength: Strength::Strong,
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            confidence: 0.9,
            snippet: "taro****.com".into(),
        }
    }

    struct Harness {
        handle: ChatHandle,
        transport: Arc<LoopbackTransport>,
        sink: Arc<RingBufferSink>,
    }

    fn start(reply: LoopbackReply, pipeline: FakePipeline, config: SessionConfig) -> Harness {
        let transport = Arc::new(LoopbackTransport::new(Some("Tester"), reply, Duration::from_millis(20)));
        let sink = Arc::new(RingBufferSink::default());
        let (session, handle) = ChatSession::new(config, Arc::new(pipeline), transport.clone(), sink.clone());
        tokio::spawn(session.run());
        Harness { handle, transport, sink }
    }

    fn no_pii() -> FakePipeline {
        FakePipeline {
            regions: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_text_only_round_trip() {
        let h = start(LoopbackReply::Answer(Disposition::AskClarification), no_pii(), SessionConfig::default());
        h.handle.dispatch(Action::SendTextOnly { text: "printer jammed".into() }).await.unwrap();

        let snapshot = h.handle.wait_for(|s| s.state == ChatState::AnswerShown, WAIT).await.unwrap();
        let answer = snapshot.answer.unwrap();
        assert_eq!(answer.disposition, Disposition::AskClarification);
        assert_eq!(answer.text, "Received: printer jammed");

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "printer jammed");
        assert!(sent[0].attachments.is_empty());

        let names = h.sink.names();
        assert!(names.contains(&"text_message_sending".to_string()));
        assert!(names.contains(&"masked_message_sent".to_string()));
        assert!(names.contains(&"response_received".to_string()));
    }

    #[tokio::test]
    async fn test_review_sends_masked_images() {
        let pipeline = FakePipeline {
            regions: vec![region()],
            delay: Duration::ZERO,
        };
        let h = start(LoopbackReply::Answer(Disposition::AutoResolve), pipeline, SessionConfig::default());
        let image = ImageBlob::new("shot.png", "image/png", vec![1, 2, 3]);
        h.handle
            .dispatch(Action::SelectImages { images: vec![image], text: Some("see attached".into()) })
            .await
            .unwrap();
        h.handle.dispatch(Action::StartPreprocessing).await.unwrap();

        let review = h.handle.wait_for(|s| s.state == ChatState::PiiReview, WAIT).await.unwrap();
        assert_eq!(review.detected_regions.len(), 1);
        assert_eq!(review.processed_count, 1);

        h.handle.confirm_review(review.detected_regions.clone()).await.unwrap();
        let done = h.handle.wait_for(|s| s.state == ChatState::AnswerShown, WAIT).await.unwrap();
        assert_eq!(done.image_count, 0);
        assert_eq!(done.processed_count, 0);
        assert_eq!(done.masked_count, 0);

        let sent = h.transport.sent();
        assert_eq!(sent[0].attachments.len(), 1);
        assert_eq!(sent[0].attachments[0].name, "masked_p_shot.png");
        assert_eq!(sent[0].text, "see attached");
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let config = SessionConfig {
            response_timeout_secs: 1,
            ..SessionConfig::default()
        };
        let h = start(LoopbackReply::Silent, no_pii(), config);
        h.handle.dispatch(Action::SendTextOnly { text: "hello".into() }).await.unwrap();

        let snapshot = h.handle.wait_for(|s| s.state == ChatState::Error, WAIT).await.unwrap();
        assert_eq!(snapshot.previous_state, Some(ChatState::WaitingResponse));
        assert_eq!(snapshot.error.unwrap().message, "No response from the server");
        assert!(h.sink.names().contains(&"response_timeout".to_string()));
    }

    #[tokio::test]
    async fn test_repeated_send_failures_escalate() {
        let h = start(LoopbackReply::Plain, no_pii(), SessionConfig::default());
        h.transport.fail_next(10);
        h.handle.dispatch(Action::SendTextOnly { text: "hello".into() }).await.unwrap();

        for attempt in 1..=3u32 {
            h.handle
                .wait_for(|s| s.state == ChatState::Error && s.retry_count == attempt, WAIT)
                .await
                .unwrap();
            h.handle.dispatch(Action::Retry).await.unwrap();
        }

        let snapshot = h.handle.wait_for(|s| s.state == ChatState::AnswerShown, WAIT).await.unwrap();
        assert_eq!(snapshot.answer.unwrap().disposition, Disposition::Escalate);
        assert!(snapshot.error.is_none());
        let failures = h.sink.names().iter().filter(|n| *n == "send_failed").count();
        assert_eq!(failures, 3);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_result() {
        let pipeline = FakePipeline {
            regions: Vec::new(),
            delay: Duration::from_millis(100),
        };
        let h = start(LoopbackReply::Plain, pipeline, SessionConfig::default());
        let image = ImageBlob::new("a.png", "image/png", vec![1]);
        h.handle.dispatch(Action::SelectImages { images: vec![image], text: None }).await.unwrap();
        h.handle.dispatch(Action::StartPreprocessing).await.unwrap();
        h.handle.dispatch(Action::Reset).await.unwrap();

        h.handle.wait_for(|s| s.state == ChatState::Idle && s.seq == 3, WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.state, ChatState::Idle);
        assert_eq!(snapshot.processed_count, 0);
        assert!(!h.sink.names().contains(&"preprocessing_completed".to_string()));
    }

    #[tokio::test]
    async fn test_illegal_action_is_recorded() {
        let h = start(LoopbackReply::Plain, no_pii(), SessionConfig::default());
        h.handle.dispatch(Action::ConfirmPiiReview { masked_images: vec![] }).await.unwrap();
        h.handle.confirm_review(vec![region()]).await.unwrap();
        h.handle.dispatch(Action::Reset).await.unwrap();
        h.handle.wait_for(|s| s.seq == 1, WAIT).await.unwrap();

        assert_eq!(h.handle.snapshot().state, ChatState::Idle);
        let rejected: Vec<_> = h
            .sink
            .snapshot()
            .into_iter()
            .filter(|e| e.name == "transition_rejected")
            .collect();
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].fields["state"], "IDLE");
    }
}
