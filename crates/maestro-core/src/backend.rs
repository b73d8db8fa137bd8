use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;
use crate::messages::StoredMessage;
use crate::tokens::TokenUsage;

/// One model step to run against the backend. The first step of a run
/// carries the prompt; follow-up steps carry the tool outcomes from the
/// previous step, keyed by the resume token the backend handed back.
#[derive(Clone, Debug, Default)]
pub struct BackendRequest {
    pub prompt: Option<String>,
    pub history: Vec<StoredMessage>,
    pub tool_outcomes: Vec<ToolOutcome>,
    pub resume_token: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub cwd: Option<String>,
}

/// Result of one approved (or denied) tool call, fed back into the stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub output: String,
    pub is_error: bool,
}

/// Why a model step stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Events yielded by one backend step, in stream order:
///
/// (Delta | Message | ToolCall)* → (Completed | Error)
#[derive(Clone, Debug)]
pub enum BackendEvent {
    /// Incremental text, forwarded live but never persisted.
    Delta { text: String },
    /// A complete model-stream message, persisted as-is.
    Message { payload: serde_json::Value },
    /// The model wants a side-effecting capability. The step pauses here
    /// until the permission handshake resolves.
    ToolCall { name: String, input: serde_json::Value },
    Completed {
        usage: TokenUsage,
        resume_token: Option<String>,
        stop_reason: StopReason,
    },
    Error { error: BackendError },
}

impl BackendEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

pub type BackendStream = Pin<Box<dyn Stream<Item = BackendEvent> + Send>>;

/// The model-invocation collaborator: an opaque async streaming call that
/// yields message events and can be abandoned mid-stream.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, request: &BackendRequest) -> Result<BackendStream, BackendError>;
}

/// Typed error hierarchy for backend invocations. Classifies errors as
/// fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    // Fatal — don't retry
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("backend overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::Network(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_) | Self::InvalidRequest(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}
