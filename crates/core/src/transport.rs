//! 对话传输层
//!
//! 传输层是外部协作者：发送 activity，并以广播形式提供入站 activity。
//! `LoopbackTransport` 是开发用的本地回环实现。

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use assist_triage::Disposition;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use crate::activity::{Activity, ChannelAccount};
use crate::{CoreError, Result};

const ACTIVITY_CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait Transport: Send + Sync {
    /// 本地用户身份
    fn user(&self) -> &ChannelAccount;

    /// 发送一条 activity，成功时返回其 id
    async fn post_activity(&self, activity: Activity) -> Result<String>;

    /// 所有入站 activity（包括本地用户自己的回显）
    fn activities(&self) -> broadcast::Receiver<Activity>;
}

/// 入站订阅
///
/// 只投递非本地用户发出的消息类 activity。丢弃即取消订阅。
pub struct Subscription {
    rx: broadcast::Receiver<Activity>,
    user_id: String,
}

impl Subscription {
    pub fn new(transport: &dyn Transport) -> Self {
        Self {
            rx: transport.activities(),
            user_id: transport.user().id.clone(),
        }
    }

    /// 下一条入站消息；传输层关闭时返回 `None`
    pub async fn next(&mut self) -> Option<Activity> {
        loop {
            match self.rx.recv().await {
                Ok(activity) => {
                    if activity.is_message() && activity.from.id != self.user_id {
                        return Some(activity);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[Transport] 订阅落后，丢弃 {} 条 activity", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// 回环机器人的回复方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackReply {
    /// 带 `value.answerType`
    Answer(Disposition),
    /// 不带 `value`
    Plain,
    /// 不回复
    Silent,
}

/// 本地回环传输：回显用户消息，延迟后以机器人身份回复
pub struct LoopbackTransport {
    user: ChannelAccount,
    bot: ChannelAccount,
    reply: LoopbackReply,
    delay: Duration,
    tx: broadcast::Sender<Activity>,
    failures_left: AtomicU32,
    counter: AtomicU64,
    sent: Mutex<Vec<Activity>>,
}

impl LoopbackTransport {
    pub fn new(user_name: Option<&str>, reply: LoopbackReply, delay: Duration) -> Self {
        let user_id = uuid::Uuid::new_v4().to_string();
        let name = match user_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("User-{}", &user_id[..8]),
        };
        let (tx, _) = broadcast::channel(ACTIVITY_CHANNEL_CAPACITY);
        Self {
            user: ChannelAccount::new(user_id, name),
            bot: ChannelAccount::new("bot", "AI Assistant"),
            reply,
            delay,
            tx,
            failures_left: AtomicU32::new(0),
            counter: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// 接下来的 `n` 次发送失败
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// 已成功发送的 activity
    pub fn sent(&self) -> Vec<Activity> {
        self.lock_sent().clone()
    }

    // 持锁线程 panic 后记录仍然有效，继续使用
    fn lock_sent(&self) -> MutexGuard<'_, Vec<Activity>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 以机器人身份注入一条入站消息
    pub fn inject(&self, activity: Activity) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.tx.send(activity);
    }

    fn bot_reply(&self, received: &Activity) -> Option<Activity> {
        let value = match self.reply {
            LoopbackReply::Silent => return None,
            LoopbackReply::Plain => None,
            LoopbackReply::Answer(disposition) => Some(json!({
                "answerType": disposition.as_str(),
                "faqLinks": [],
            })),
        };
        let text = if received.text.is_empty() {
            format!("Received {} attachment(s)", received.attachments.len())
        } else {
            format!("Received: {}", received.text)
        };
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Some(Activity {
            id: Some(format!("bot-msg-{}", n)),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            value,
            ..Activity::message(self.bot.clone(), text, &[])
        })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn user(&self) -> &ChannelAccount {
        &self.user
    }

    async fn post_activity(&self, activity: Activity) -> Result<String> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(CoreError::Transport("loopback send failure".to_string()));
        }

        let id = format!("loopback-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        log::info!(
            "[Transport] 发送 {}: {} 个附件",
            id,
            activity.attachments.len()
        );

        let echo = Activity {
            id: Some(id.clone()),
            ..activity.clone()
        };
        self.lock_sent().push(echo.clone());
        let _ = self.tx.send(echo);

        if let Some(reply) = self.bot_reply(&activity) {
            let tx = self.tx.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(reply);
            });
        }

        Ok(id)
    }

    fn activities(&self) -> broadcast::Receiver<Activity> {
        self.tx.subscribe()
    }
}
