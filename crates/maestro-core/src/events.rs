use serde::{Deserialize, Serialize};

use crate::ids::{ScheduleId, SessionId, TaskId, ToolCallId};
use crate::messages::MessageRecord;
use crate::schedule::ScheduledTask;
use crate::session::Session;
use crate::status::{SessionStatus, TaskStatus};

/// Fan-out strategy for a multi-thread task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// All members share one model and one prompt.
    Consensus,
    /// Each member has its own prompt (and optionally model).
    DifferentTasks,
    /// Like `different_tasks`, but members carry role labels.
    RoleGroup,
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consensus => write!(f, "consensus"),
            Self::DifferentTasks => write!(f, "different_tasks"),
            Self::RoleGroup => write!(f, "role_group"),
        }
    }
}

/// Mode-specific fan-out parameters. `consensus` reads `quantity`, `prompt`
/// and `model`; the heterogeneous modes read the parallel `prompts`,
/// `models` and `roles` lists, indexed the same way as the member list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FanoutSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default)]
    pub auto_summary: bool,
}

/// Wire snapshot of a multi-thread task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub title: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub thread_ids: Vec<SessionId>,
    pub auto_summary: bool,
    pub created_at: String,
}

/// Client → server events, exhaustively matched at the dispatch boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "session.start")]
    SessionStart {
        prompt: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        temperature: Option<f64>,
    },
    #[serde(rename = "session.continue")]
    SessionContinue { session_id: SessionId, prompt: String },
    #[serde(rename = "session.stop")]
    SessionStop { session_id: SessionId },
    #[serde(rename = "session.delete")]
    SessionDelete { session_id: SessionId },
    #[serde(rename = "session.pin")]
    SessionPin { session_id: SessionId, is_pinned: bool },
    #[serde(rename = "session.update")]
    SessionUpdate {
        session_id: SessionId,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    #[serde(rename = "session.history")]
    SessionHistory {
        session_id: SessionId,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        before: Option<i64>,
    },
    #[serde(rename = "session.list")]
    SessionList,

    #[serde(rename = "permission.response")]
    PermissionResponse {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        approved: bool,
    },

    #[serde(rename = "message.edit")]
    MessageEdit {
        session_id: SessionId,
        message_index: usize,
        new_prompt: String,
    },

    #[serde(rename = "task.create")]
    TaskCreate {
        title: String,
        mode: TaskMode,
        #[serde(default)]
        cwd: Option<String>,
        fanout: FanoutSpec,
    },
    #[serde(rename = "task.start")]
    TaskStart { task_id: TaskId },
    #[serde(rename = "task.delete")]
    TaskDelete { task_id: TaskId },

    #[serde(rename = "schedule.create")]
    ScheduleCreate {
        title: String,
        #[serde(default)]
        prompt: Option<String>,
        schedule: String,
        #[serde(default)]
        notify_before: Option<i64>,
    },
    #[serde(rename = "schedule.update")]
    ScheduleUpdate {
        schedule_id: ScheduleId,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        schedule: Option<String>,
        #[serde(default)]
        notify_before: Option<i64>,
        #[serde(default)]
        enabled: Option<bool>,
    },
    #[serde(rename = "schedule.delete")]
    ScheduleDelete { schedule_id: ScheduleId },
    #[serde(rename = "schedule.list")]
    ScheduleList,
}

/// Where an outbound event is delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteClass {
    /// No session affiliation: every registered window.
    Broadcast,
    /// Status-class: every registered window, so session lists and
    /// sidebars everywhere stay current.
    Status,
    /// Session-affiliated: only windows subscribed to that session.
    /// With zero subscribers the event is dropped, not queued.
    Session(SessionId),
}

/// Server → client events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "session.status")]
    SessionStatusChanged { session_id: SessionId, status: SessionStatus },
    #[serde(rename = "session.list")]
    SessionListed { sessions: Vec<Session> },
    #[serde(rename = "session.deleted")]
    SessionDeleted { session_id: SessionId },
    #[serde(rename = "session.history")]
    SessionHistory {
        session_id: SessionId,
        messages: Vec<MessageRecord>,
        has_more: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_cursor: Option<i64>,
        input_tokens: i64,
        output_tokens: i64,
    },

    #[serde(rename = "stream.message")]
    StreamMessage { session_id: SessionId, payload: serde_json::Value },
    #[serde(rename = "stream.user_prompt")]
    StreamUserPrompt { session_id: SessionId, text: String },

    #[serde(rename = "permission.request")]
    PermissionRequest {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        tool_name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "task.status")]
    TaskStatusChanged { task_id: TaskId, status: TaskStatus },
    #[serde(rename = "task.created")]
    TaskCreated { task: TaskSnapshot },
    #[serde(rename = "task.deleted")]
    TaskDeleted { task_id: TaskId },

    #[serde(rename = "schedule.list")]
    ScheduleListed { tasks: Vec<ScheduledTask> },
    #[serde(rename = "scheduler.notification")]
    SchedulerNotification {
        schedule_id: ScheduleId,
        title: String,
        minutes: i64,
    },
    #[serde(rename = "scheduler.fired")]
    SchedulerFired {
        schedule_id: ScheduleId,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    #[serde(rename = "runner.error")]
    RunnerError {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        message: String,
    },
}

impl ServerEvent {
    /// Delivery class for the event router.
    pub fn route(&self) -> RouteClass {
        match self {
            // Status-class: keep every window's lists current.
            Self::SessionStatusChanged { .. }
            | Self::SessionListed { .. }
            | Self::SessionDeleted { .. }
            | Self::TaskStatusChanged { .. }
            | Self::TaskCreated { .. }
            | Self::TaskDeleted { .. }
            | Self::ScheduleListed { .. }
            | Self::SchedulerNotification { .. }
            | Self::SchedulerFired { .. } => RouteClass::Status,

            // Session-affiliated content.
            Self::SessionHistory { session_id, .. }
            | Self::StreamMessage { session_id, .. }
            | Self::StreamUserPrompt { session_id, .. }
            | Self::PermissionRequest { session_id, .. } => {
                RouteClass::Session(session_id.clone())
            }

            Self::RunnerError { session_id, .. } => match session_id {
                Some(id) => RouteClass::Session(id.clone()),
                None => RouteClass::Broadcast,
            },
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStatusChanged { .. } => "session.status",
            Self::SessionListed { .. } => "session.list",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::SessionHistory { .. } => "session.history",
            Self::StreamMessage { .. } => "stream.message",
            Self::StreamUserPrompt { .. } => "stream.user_prompt",
            Self::PermissionRequest { .. } => "permission.request",
            Self::TaskStatusChanged { .. } => "task.status",
            Self::TaskCreated { .. } => "task.created",
            Self::TaskDeleted { .. } => "task.deleted",
            Self::ScheduleListed { .. } => "schedule.list",
            Self::SchedulerNotification { .. } => "scheduler.notification",
            Self::SchedulerFired { .. } => "scheduler.fired",
            Self::RunnerError { .. } => "runner.error",
        }
    }
}
