//! 会话消息结构
//!
//! 与对话传输层交换的 activity，字段名保持 camelCase 线格式。

use assist_render::ImageBlob;
use assist_triage::Disposition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MESSAGE_TYPE: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccount {
    pub id: String,
    pub name: String,
}

impl ChannelAccount {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    /// `data:` URL
    pub content_url: String,
    pub name: String,
}

impl From<&ImageBlob> for Attachment {
    fn from(blob: &ImageBlob) -> Self {
        Self {
            content_type: blob.content_type.clone(),
            content_url: blob.to_data_url(),
            name: blob.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: ChannelAccount,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Activity {
    pub fn message(from: ChannelAccount, text: impl Into<String>, images: &[ImageBlob]) -> Self {
        Self {
            id: None,
            kind: MESSAGE_TYPE.to_string(),
            from,
            text: text.into(),
            attachments: images.iter().map(Attachment::from).collect(),
            value: None,
            timestamp: None,
        }
    }

    pub fn is_message(&self) -> bool {
        self.kind == MESSAGE_TYPE
    }

    /// 解释入站消息携带的处理分级
    pub fn answer(&self) -> Answer {
        Answer {
            disposition: parse_disposition(self.value.as_ref()),
            text: self.text.clone(),
            data: self.value.clone(),
        }
    }
}

/// 后端回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub disposition: Disposition,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Answer {
    pub fn new(disposition: Disposition) -> Self {
        Self {
            disposition,
            text: String::new(),
            data: None,
        }
    }
}

/// `value.answerType` 缺失视为 AUTO_RESOLVE；无法识别的值按 ESCALATE 处理
pub fn parse_disposition(value: Option<&Value>) -> Disposition {
    let Some(answer_type) = value.and_then(|v| v.get("answerType")) else {
        return Disposition::AutoResolve;
    };

    match answer_type.as_str().map(str::parse::<Disposition>) {
        Some(Ok(disposition)) => disposition,
        _ => {
            log::warn!("[Transport] 无法识别的 answerType: {}，按 ESCALATE 处理", answer_type);
            Disposition::Escalate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_shape() {
        let user = ChannelAccount::new("u1", "User-u1");
        let blob = ImageBlob::new("masked_a.jpg", "image/jpeg", vec![1, 2, 3]);
        let activity = Activity::message(user, "hello", &[blob]);
        let json = serde_json::to_value(&activity).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["from"]["id"], "u1");
        assert_eq!(json["attachments"][0]["contentType"], "image/jpeg");
        assert_eq!(json["attachments"][0]["contentUrl"], "data:image/jpeg;base64,AQID");
        assert_eq!(json["attachments"][0]["name"], "masked_a.jpg");
        assert!(json.get("value").is_none());
    }

    #[test]
    fn test_text_only_has_no_attachments_field() {
        let activity = Activity::message(ChannelAccount::new("u", "U"), "hi", &[]);
        let json = serde_json::to_value(&activity).unwrap();
        assert!(json.get("attachments").is_none());
    }

    #[test]
    fn test_parse_disposition() {
        assert_eq!(parse_disposition(None), Disposition::AutoResolve);
        assert_eq!(parse_disposition(Some(&json!({"faqLinks": []}))), Disposition::AutoResolve);
        assert_eq!(
            parse_disposition(Some(&json!({"answerType": "ASK_CLARIFICATION"}))),
            Disposition::AskClarification
        );
        assert_eq!(
            parse_disposition(Some(&json!({"answerType": "SOMETHING_ELSE"}))),
            Disposition::Escalate
        );
        assert_eq!(parse_disposition(Some(&json!({"answerType": 3}))), Disposition::Escalate);
    }

    #[test]
    fn test_inbound_parse() {
        let raw = r#"{
            "type": "message",
            "id": "bot-1",
            "from": {"id": "bot", "name": "AI Assistant"},
            "text": "Try restarting",
            "value": {"answerType": "ESCALATE"}
        }"#;
        let activity: Activity = serde_json::from_str(raw).unwrap();
        assert!(activity.is_message());
        let answer = activity.answer();
        assert_eq!(answer.disposition, Disposition::Escalate);
        assert_eq!(answer.text, "Try restarting");
    }
}
