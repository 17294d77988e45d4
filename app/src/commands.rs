use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use assist_core::{
    dedup_regions, Action, ChatHandle, ChatSession, ChatState, ImagePipeline, LogSink,
    LoopbackReply, LoopbackTransport, StandardPipeline, StateSnapshot,
};
use assist_ocr::{OcrEngine, OcrError, Recognition, TesseractEngine};
use assist_render::ImageBlob;
use assist_triage::{load_model_config, score_clusters, Candidate, Disposition, Features, ModelConfig};
use async_trait::async_trait;
use serde_json::json;

use crate::config::{save_config, AppConfig};
use crate::{ChatArgs, ConfigArgs, ScanArgs, TriageArgs};

/// `drive` 最多推进的步数
const CHAT_MAX_STEPS: usize = 16;

fn read_images(paths: &[impl AsRef<Path>]) -> Result<Vec<ImageBlob>> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            Ok(ImageBlob::from_path_bytes(path, bytes))
        })
        .collect()
}

/// Tesseract 不可用时的占位引擎，识别总是失败
struct UnavailableOcr(String);

#[async_trait]
impl OcrEngine for UnavailableOcr {
    async fn recognize(&self, _image: &ImageBlob) -> assist_ocr::Result<Recognition> {
        Err(OcrError::EngineUnavailable(self.0.clone()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

async fn ocr_engine(config: &AppConfig, required: bool) -> Result<Arc<dyn OcrEngine>> {
    match TesseractEngine::new(config.tesseract.clone()).await {
        Ok(engine) => Ok(Arc::new(engine)),
        Err(e) if !required => {
            log::warn!("[OCR] Tesseract 不可用，图片检测将失败: {}", e);
            Ok(Arc::new(UnavailableOcr(e.to_string())))
        }
        Err(e) => Err(e).context("tesseract is required for scanning"),
    }
}

fn pipeline(config: &AppConfig, ocr: Arc<dyn OcrEngine>) -> Result<StandardPipeline> {
    Ok(StandardPipeline::new(
        config.session.preprocess.clone(),
        &config.session.detector,
        ocr,
    )?)
}

pub async fn scan(config: &AppConfig, args: ScanArgs) -> Result<()> {
    let images = read_images(&args.images)?;
    let pipeline = pipeline(config, ocr_engine(config, true).await?)?;

    let processed = pipeline.preprocess(images).await?;
    let blobs: Vec<ImageBlob> = processed.iter().map(|p| p.blob.clone()).collect();
    let regions = dedup_regions(pipeline.detect(blobs.clone()).await?);

    if let Some(dir) = &args.mask_dir {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        for masked in pipeline.mask(blobs, regions.clone()).await? {
            let path = dir.join(&masked.name);
            fs::write(&path, &masked.bytes).with_context(|| format!("failed to write {}", path.display()))?;
            log::info!("[Scan] 已写入 {}", path.display());
        }
    }

    let report = json!({
        "images": processed
            .iter()
            .map(|p| json!({
                "name": p.blob.name,
                "width": p.width,
                "height": p.height,
                "originalWidth": p.original_width,
                "originalHeight": p.original_height,
                "contentHash": p.content_hash,
            }))
            .collect::<Vec<_>>(),
        "regions": regions,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub fn triage(config: &AppConfig, args: TriageArgs) -> Result<()> {
    let model_path = args
        .model
        .clone()
        .or_else(|| config.model_path.as_ref().map(Into::into));
    let model = match model_path {
        Some(path) => load_model_config(&path)
            .with_context(|| format!("failed to load model config {}", path.display()))?,
        None => ModelConfig::default(),
    };

    let features: Features = serde_json::from_str(&args.features).context("invalid --features JSON")?;
    let raw = fs::read_to_string(&args.candidates)
        .with_context(|| format!("failed to read {}", args.candidates.display()))?;
    let candidates: Vec<Candidate> = serde_json::from_str(&raw).context("invalid candidates JSON")?;

    let result = score_clusters(
        &candidates,
        &features,
        &model.weights,
        &model.thresholds,
        model.temperature_scaling.as_ref(),
    )?;
    log::info!(
        "[Triage] 模型 {}: {} 个候选 -> {}",
        model.version,
        candidates.len(),
        result.decision
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn parse_reply(raw: &str) -> Result<LoopbackReply> {
    match raw.to_ascii_lowercase().as_str() {
        "plain" => Ok(LoopbackReply::Plain),
        "silent" => Ok(LoopbackReply::Silent),
        _ => match raw.to_ascii_uppercase().parse::<Disposition>() {
            Ok(disposition) => Ok(LoopbackReply::Answer(disposition)),
            Err(e) => bail!("invalid --reply: {}", e),
        },
    }
}

fn print_snapshot(snapshot: &StateSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(line) => println!("{}", line),
        Err(e) => log::warn!("[Chat] 快照序列化失败: {}", e),
    }
}

pub async fn chat(config: &AppConfig, args: ChatArgs) -> Result<()> {
    let reply = parse_reply(&args.reply)?;
    let images = read_images(&args.images)?;
    let text = args.text.clone().filter(|t| !t.trim().is_empty());
    if images.is_empty() && text.is_none() {
        bail!("nothing to send: pass --text and/or --image");
    }

    let ocr = if images.is_empty() {
        Arc::new(UnavailableOcr("no images".into())) as Arc<dyn OcrEngine>
    } else {
        ocr_engine(config, false).await?
    };
    let pipeline = Arc::new(pipeline(config, ocr)?);
    let transport = Arc::new(LoopbackTransport::new(
        config.session.user_name.as_deref(),
        reply,
        Duration::from_millis(args.reply_delay_ms),
    ));

    let (session, handle) = ChatSession::new(config.session.clone(), pipeline, transport, Arc::new(LogSink));
    let runner = tokio::spawn(session.run());

    let mut snapshots = handle.subscribe();
    let printer = tokio::spawn(async move {
        print_snapshot(&snapshots.borrow_and_update().clone());
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            print_snapshot(&snapshot);
        }
    });

    if images.is_empty() {
        handle.dispatch(Action::SendTextOnly { text: text.unwrap_or_default() }).await?;
    } else {
        handle.dispatch(Action::SelectImages { images, text }).await?;
        handle.dispatch(Action::StartPreprocessing).await?;
    }

    let final_state = drive(&handle, config.session.response_timeout() + Duration::from_secs(30)).await?;
    log::info!("[Chat] 会话结束于 {}", final_state.state);

    drop(handle);
    runner.await.context("session task panicked")??;
    printer.await.context("printer task panicked")?;
    Ok(())
}

/// 推进会话直到结束：自动确认遮罩、自动重试，拿到回复后结束会话
async fn drive(handle: &ChatHandle, step_timeout: Duration) -> Result<StateSnapshot> {
    let settled = |s: &StateSnapshot| {
        matches!(
            s.state,
            ChatState::PiiReview | ChatState::AnswerShown | ChatState::Error | ChatState::End
        )
    };

    for _ in 0..CHAT_MAX_STEPS {
        let snapshot = handle.wait_for(settled, step_timeout).await?;
        match snapshot.state {
            ChatState::PiiReview => {
                log::info!("[Chat] 自动确认 {} 个遮罩区域", snapshot.detected_regions.len());
                handle.confirm_review(snapshot.detected_regions.clone()).await?;
            }
            ChatState::Error => {
                if let Some(error) = &snapshot.error {
                    log::warn!("[Chat] {} ({})", error.message, error.detail.as_deref().unwrap_or("-"));
                }
                handle.dispatch(Action::Retry).await?;
            }
            ChatState::AnswerShown => {
                handle
                    .dispatch(Action::EndSession { reason: Some("cli".into()) })
                    .await?;
            }
            _ => return Ok(snapshot),
        }
        // 等待本次操作引起的状态变化
        let seq = snapshot.seq;
        handle.wait_for(|s| s.seq != seq, step_timeout).await?;
    }
    bail!("session did not settle after {} steps", CHAT_MAX_STEPS)
}

pub fn config(path: &Path, config: &AppConfig, args: ConfigArgs) -> Result<()> {
    if args.write {
        save_config(path, config).with_context(|| format!("failed to write {}", path.display()))?;
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
