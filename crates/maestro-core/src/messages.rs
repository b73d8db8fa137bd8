use serde::{Deserialize, Serialize};

use crate::tokens::TokenUsage;

/// A message in a session's history. Append-only: editing message *k*
/// truncates everything after *k* before the replacement is written.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum StoredMessage {
    /// Prompt submitted by the user (or fired by the scheduler).
    UserPrompt { text: String },
    /// A model-stream message. The payload is opaque to the engine; the
    /// backend's wire format passes through untouched.
    Assistant { payload: serde_json::Value },
    /// Terminal result of one run, carrying the token-usage delta.
    Result {
        usage: TokenUsage,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl StoredMessage {
    pub fn user_prompt(text: impl Into<String>) -> Self {
        Self::UserPrompt { text: text.into() }
    }

    pub fn assistant(payload: serde_json::Value) -> Self {
        Self::Assistant { payload }
    }

    pub fn result(usage: TokenUsage, is_error: bool, text: Option<String>) -> Self {
        Self::Result { usage, is_error, text }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::UserPrompt { .. } => "user_prompt",
            Self::Assistant { .. } => "assistant",
            Self::Result { .. } => "result",
        }
    }
}

/// A stored message together with its insertion sequence number, which is
/// the pagination cursor for history pages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub seq: i64,
    #[serde(flatten)]
    pub message: StoredMessage,
    pub created_at: String,
}

/// One newest-first page of a session's history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<i64>,
}
