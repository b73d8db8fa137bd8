use chrono::Utc;
use tracing::instrument;

use maestro_core::ids::ScheduleId;
use maestro_core::schedule::{ScheduledTask, SchedulePatch};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_COLUMNS: &str =
    "id, title, prompt, schedule, next_run, is_recurring, notify_before, enabled, created_at, updated_at";

/// Parameters as persisted: the scheduler derives `next_run` and
/// `is_recurring` from the schedule string before writing.
#[derive(Clone, Debug)]
pub struct InsertSchedule {
    pub title: String,
    pub prompt: Option<String>,
    pub schedule: String,
    pub next_run: i64,
    pub is_recurring: bool,
    pub notify_before: Option<i64>,
}

pub struct ScheduleRepo {
    db: Database,
}

impl ScheduleRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, params), fields(title = %params.title, schedule = %params.schedule))]
    pub fn create(&self, params: &InsertSchedule) -> Result<ScheduledTask, StoreError> {
        let id = ScheduleId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                    (id, title, prompt, schedule, next_run, is_recurring, notify_before, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    params.title,
                    params.prompt,
                    params.schedule,
                    params.next_run,
                    params.is_recurring,
                    params.notify_before,
                    now,
                    now,
                ],
            )?;

            Ok(ScheduledTask {
                id,
                title: params.title.clone(),
                prompt: params.prompt.clone(),
                schedule: params.schedule.clone(),
                next_run: params.next_run,
                is_recurring: params.is_recurring,
                notify_before: params.notify_before,
                enabled: true,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(schedule_id = %id))]
    pub fn get(&self, id: &ScheduleId) -> Result<ScheduledTask, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM scheduled_tasks WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row),
                None => Err(StoreError::NotFound(format!("scheduled task {id}"))),
            }
        })
    }

    /// All tasks, soonest first. Disabled ones are included only on request.
    #[instrument(skip(self))]
    pub fn list(&self, include_disabled: bool) -> Result<Vec<ScheduledTask>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = if include_disabled {
                format!("SELECT {SELECT_COLUMNS} FROM scheduled_tasks ORDER BY next_run ASC")
            } else {
                format!(
                    "SELECT {SELECT_COLUMNS} FROM scheduled_tasks WHERE enabled = 1 ORDER BY next_run ASC"
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_task(row)?);
            }
            Ok(results)
        })
    }

    /// Enabled tasks whose `next_run` has passed.
    #[instrument(skip(self))]
    pub fn due(&self, now_ms: i64) -> Result<Vec<ScheduledTask>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM scheduled_tasks
                 WHERE enabled = 1 AND next_run <= ?1 ORDER BY next_run ASC"
            ))?;
            let mut rows = stmt.query([now_ms])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_task(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self, patch), fields(schedule_id = %id))]
    pub fn update(&self, id: &ScheduleId, patch: &SchedulePatch) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let mut updates = vec!["updated_at = ?1".to_string()];
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now.clone())];
            let mut idx = 2;

            if let Some(ref title) = patch.title {
                updates.push(format!("title = ?{idx}"));
                values.push(Box::new(title.clone()));
                idx += 1;
            }
            if let Some(ref prompt) = patch.prompt {
                updates.push(format!("prompt = ?{idx}"));
                values.push(Box::new(prompt.clone()));
                idx += 1;
            }
            if let Some(ref schedule) = patch.schedule {
                updates.push(format!("schedule = ?{idx}"));
                values.push(Box::new(schedule.clone()));
                idx += 1;
            }
            if let Some(next_run) = patch.next_run {
                updates.push(format!("next_run = ?{idx}"));
                values.push(Box::new(next_run));
                idx += 1;
            }
            if let Some(is_recurring) = patch.is_recurring {
                updates.push(format!("is_recurring = ?{idx}"));
                values.push(Box::new(is_recurring));
                idx += 1;
            }
            if let Some(notify_before) = patch.notify_before {
                updates.push(format!("notify_before = ?{idx}"));
                values.push(Box::new(notify_before));
                idx += 1;
            }
            if let Some(enabled) = patch.enabled {
                updates.push(format!("enabled = ?{idx}"));
                values.push(Box::new(enabled));
                idx += 1;
            }

            let sql = format!(
                "UPDATE scheduled_tasks SET {} WHERE id = ?{idx}",
                updates.join(", ")
            );
            values.push(Box::new(id.as_str().to_string()));

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();
            let changed = conn.execute(&sql, params_refs.as_slice())?;
            Ok(changed > 0)
        })
    }

    #[instrument(skip(self), fields(schedule_id = %id))]
    pub fn delete(&self, id: &ScheduleId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed =
                conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id.as_str()])?;
            Ok(changed > 0)
        })
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<ScheduledTask, StoreError> {
    Ok(ScheduledTask {
        id: ScheduleId::from_raw(row_helpers::get::<String>(row, 0, "scheduled_tasks", "id")?),
        title: row_helpers::get(row, 1, "scheduled_tasks", "title")?,
        prompt: row_helpers::get_opt(row, 2, "scheduled_tasks", "prompt")?,
        schedule: row_helpers::get(row, 3, "scheduled_tasks", "schedule")?,
        next_run: row_helpers::get(row, 4, "scheduled_tasks", "next_run")?,
        is_recurring: row_helpers::get::<i64>(row, 5, "scheduled_tasks", "is_recurring")? != 0,
        notify_before: row_helpers::get_opt(row, 6, "scheduled_tasks", "notify_before")?,
        enabled: row_helpers::get::<i64>(row, 7, "scheduled_tasks", "enabled")? != 0,
        created_at: row_helpers::get(row, 8, "scheduled_tasks", "created_at")?,
        updated_at: row_helpers::get(row, 9, "scheduled_tasks", "updated_at")?,
    })
}
