use serde::{Deserialize, Serialize};

/// Lifecycle of a single agent conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Lifecycle of a multi-thread task. Never set independently after creation;
/// always derived from member sessions via [`aggregate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    Error,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Derive a task's status from its members' statuses.
///
/// Tie-break order: any running member wins, then any error, then
/// all-completed. Anything else (members still idle, or no members at
/// all) leaves the task where it was.
pub fn aggregate(current: TaskStatus, members: &[SessionStatus]) -> TaskStatus {
    if members.is_empty() {
        return current;
    }
    if members.iter().any(|s| *s == SessionStatus::Running) {
        return TaskStatus::Running;
    }
    if members.iter().any(|s| *s == SessionStatus::Error) {
        return TaskStatus::Error;
    }
    if members.iter().all(|s| *s == SessionStatus::Completed) {
        return TaskStatus::Completed;
    }
    current
}
