use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, TaskId};
use crate::status::SessionStatus;

/// One agent conversation. Mirrors the persisted row; the orchestrator owns
/// the in-memory runner state keyed by `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Opaque backend conversation handle for continuing a conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Set when this session is a member thread of a multi-thread task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
    pub is_pinned: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Parameters for creating a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSession {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Partial update of a session row. `None` fields are left untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.cwd.is_none()
            && self.model.is_none()
            && self.last_prompt.is_none()
            && self.resume_token.is_none()
    }
}
