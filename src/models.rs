use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSource {
    pub url: String,
    pub title: String,
}

impl RawSource {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPair {
    pub human: String,
    pub ai: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    pub chat_history: Vec<HistoryPair>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamItem {
    #[serde(default)]
    pub ops: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderSegment {
    Text { html: String },
    Citation { index: usize, source: RawSource },
}

impl RenderSegment {
    pub fn text(html: impl Into<String>) -> Self {
        RenderSegment::Text { html: html.into() }
    }

    pub fn is_citation(&self) -> bool {
        matches!(self, RenderSegment::Citation { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Streaming,
    Complete,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum HoverTarget {
    Citation(usize),
    SourceCard(usize),
}

impl HoverTarget {
    pub fn index(self) -> usize {
        match self {
            HoverTarget::Citation(index) | HoverTarget::SourceCard(index) => index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerView {
    pub message_id: String,
    pub run_id: Option<String>,
    pub status: TurnStatus,
    pub text: String,
    pub segments: Vec<RenderSegment>,
    pub sources: Vec<RawSource>,
    pub highlighted: Vec<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageView {
    Human { id: String, content: String },
    Ai(AnswerView),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationView {
    pub conversation_id: String,
    pub input: String,
    pub loading: bool,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightRequest {
    pub message_id: String,
    #[serde(default)]
    pub target: Option<HoverTarget>,
}
