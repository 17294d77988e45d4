//! 流水线事件
//!
//! 事件是给审计和测试用的结构化记录，与诊断日志分开。
//! 每个会话注入自己的 sink，不存在进程级的全局缓冲区。

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_EVENT_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub name: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl PipelineEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            at: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &PipelineEvent);
}

/// 转发到 `log`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: &PipelineEvent) {
        if event.fields.is_empty() {
            log::info!("[Event] {}", event.name);
        } else {
            log::info!("[Event] {} {}", event.name, Value::Object(event.fields.clone()));
        }
    }
}

/// 有界环形缓冲，满了丢弃最旧的事件
#[derive(Debug)]
pub struct RingBufferSink {
    capacity: usize,
    events: Mutex<VecDeque<PipelineEvent>>,
}

impl RingBufferSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn snapshot(&self) -> Vec<PipelineEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PipelineEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RingBufferSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink for RingBufferSink {
    fn record(&self, event: &PipelineEvent) {
        let mut events = self.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// 同时写入多个 sink
pub struct FanoutSink(pub Vec<std::sync::Arc<dyn EventSink>>);

impl EventSink for FanoutSink {
    fn record(&self, event: &PipelineEvent) {
        for sink in &self.0 {
            sink.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let sink = RingBufferSink::new(3);
        for i in 0..5 {
            sink.record(&PipelineEvent::new(format!("e{}", i)));
        }
        assert_eq!(sink.names(), vec!["e2", "e3", "e4"]);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_default_capacity() {
        let sink = RingBufferSink::default();
        for _ in 0..250 {
            sink.record(&PipelineEvent::new("tick"));
        }
        assert_eq!(sink.len(), DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn test_event_fields() {
        let event = PipelineEvent::new("image_selected").with("count", 2usize);
        assert_eq!(event.fields["count"], 2);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "image_selected");
    }

    #[test]
    fn test_fanout() {
        let a = Arc::new(RingBufferSink::new(10));
        let b = Arc::new(RingBufferSink::new(10));
        let sinks: Vec<Arc<dyn EventSink>> = vec![a.clone(), b.clone(), Arc::new(LogSink)];
        let fanout = FanoutSink(sinks);
        fanout.record(&PipelineEvent::new("x"));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
