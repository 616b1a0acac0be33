//! Outbound job records and failure classification.

use gaia_telegram::ChatApiError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One outbound provider call, serialized into the durable queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundAction {
    SendMessage {
        chat_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_markup: Option<Value>,
    },
    AnswerCallback {
        callback_query_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    EditMessage {
        chat_id: String,
        message_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_markup: Option<Value>,
    },
    // Field must not be called `action`: that name is taken by the enum tag.
    SendChatAction {
        chat_id: String,
        chat_action: String,
    },
}

impl OutboundAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::AnswerCallback { .. } => "answer_callback",
            Self::EditMessage { .. } => "edit_message",
            Self::SendChatAction { .. } => "send_chat_action",
        }
    }

    /// Logical dedup key: while one job with this key is live, enqueueing
    /// another is a no-op.
    pub fn logical_key(&self) -> String {
        match self {
            Self::SendMessage { chat_id, text, .. } => {
                format!("send_message:{chat_id}:{}", gaia_core::truncate_bytes(text, 64))
            }
            Self::AnswerCallback {
                callback_query_id, ..
            } => format!("answer_callback:{callback_query_id}"),
            Self::EditMessage {
                chat_id,
                message_id,
                ..
            } => format!("edit_message:{message_id}:{chat_id}"),
            Self::SendChatAction {
                chat_id,
                chat_action,
            } => {
                format!("send_chat_action:{chat_id}:{chat_action}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
    Unknown,
}

/// Network failures, 5xx and 429 are transient; other 4xx are permanent.
/// Anything ambiguous is treated as transient so nothing is dropped early.
pub fn classify(error: &ChatApiError) -> FailureClass {
    match error.status {
        None => FailureClass::Transient,
        Some(429) => FailureClass::Transient,
        Some(status) if status >= 500 => FailureClass::Transient,
        Some(status) if (400..500).contains(&status) => FailureClass::Permanent,
        Some(_) => FailureClass::Unknown,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundJob {
    pub id: String,
    #[serde(flatten)]
    pub action: OutboundAction,
    pub queued_at: String,
    #[serde(default, rename = "_retries")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClass>,
    #[serde(default, rename = "_failed_at", skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    /// Provider callback/update id this job acknowledges, when known.
    /// Lets operators requeue dead-letter items by the id they saw in chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl OutboundJob {
    pub fn new(action: OutboundAction, now: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            queued_at: now.to_string(),
            retries: 0,
            last_error: None,
            classification: None,
            failed_at: None,
            source_id: None,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}
