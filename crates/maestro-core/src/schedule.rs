use serde::{Deserialize, Serialize};

use crate::ids::ScheduleId;

/// A deferred or recurring agent invocation. `next_run` is epoch millis,
/// always consistent with `schedule` as of the last write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: ScheduleId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub schedule: String,
    pub next_run: i64,
    pub is_recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_before: Option<i64>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Parameters for creating a scheduled task. `next_run` and `is_recurring`
/// are derived from the schedule string at write time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSchedule {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_before: Option<i64>,
}

/// Partial update of a scheduled task.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_recurring: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_before: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl SchedulePatch {
    pub fn next_run(next_run: i64) -> Self {
        Self { next_run: Some(next_run), ..Default::default() }
    }

    pub fn disable() -> Self {
        Self { enabled: Some(false), ..Default::default() }
    }
}
