use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{Local, NaiveTime, TimeZone};
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use maestro_core::events::ServerEvent;
use maestro_core::ids::ScheduleId;
use maestro_core::schedule::{CreateSchedule, SchedulePatch, ScheduledTask};
use maestro_store::schedules::{InsertSchedule, ScheduleRepo};
use maestro_store::{Database, StoreError};

use crate::orchestrator::{SessionOrchestrator, StartSession};

const TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Rejected at create/update time; nothing is persisted.
    #[error("invalid schedule: {0}")]
    Invalid(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

static ONCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)([mhd])$").unwrap());
static EVERY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^every (\d+)([mhd])$").unwrap());
static DAILY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^daily (\d{2}):(\d{2})$").unwrap());
static DATETIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2}) (\d{2}):(\d{2})$").unwrap());

fn unit_millis(unit: &str) -> i64 {
    match unit {
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        _ => 24 * 60 * 60 * 1000,
    }
}

/// Next absolute run time (epoch millis) for a schedule string, from `from`.
///
/// Four forms: `"{n}m|h|d"` (one-time offset), `"every {n}m|h|d"`
/// (recurring offset), `"daily HH:MM"` (next local wall-clock occurrence),
/// `"YYYY-MM-DD HH:MM"` (absolute local datetime).
pub fn calculate_next_run(schedule: &str, from: i64) -> Result<i64, ScheduleError> {
    if let Some(caps) = ONCE_RE.captures(schedule).or_else(|| EVERY_RE.captures(schedule)) {
        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| ScheduleError::Invalid(schedule.to_string()))?;
        return Ok(from + amount * unit_millis(&caps[2]));
    }

    if let Some(caps) = DAILY_RE.captures(schedule) {
        let hours: u32 = caps[1].parse().unwrap_or(99);
        let minutes: u32 = caps[2].parse().unwrap_or(99);
        let time = NaiveTime::from_hms_opt(hours, minutes, 0)
            .ok_or_else(|| ScheduleError::Invalid(schedule.to_string()))?;

        let from_local = chrono::DateTime::from_timestamp_millis(from)
            .ok_or_else(|| ScheduleError::Invalid(schedule.to_string()))?
            .with_timezone(&Local);

        let mut target = from_local.date_naive().and_time(time);
        let resolve = |naive| {
            Local
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.timestamp_millis())
                .ok_or_else(|| ScheduleError::Invalid(schedule.to_string()))
        };

        // Already passed today: roll to tomorrow.
        if resolve(target)? <= from {
            target = target + chrono::Duration::days(1);
        }
        return resolve(target);
    }

    if let Some(caps) = DATETIME_RE.captures(schedule) {
        let target = chrono::NaiveDate::from_ymd_opt(
            caps[1].parse().unwrap_or(0),
            caps[2].parse().unwrap_or(0),
            caps[3].parse().unwrap_or(0),
        )
        .and_then(|d| d.and_hms_opt(caps[4].parse().unwrap_or(99), caps[5].parse().unwrap_or(99), 0))
        .ok_or_else(|| ScheduleError::Invalid(schedule.to_string()))?;

        return Local
            .from_local_datetime(&target)
            .single()
            .map(|dt| dt.timestamp_millis())
            .ok_or_else(|| ScheduleError::Invalid(schedule.to_string()));
    }

    Err(ScheduleError::Invalid(schedule.to_string()))
}

/// A schedule recurs iff it is an `every` interval or a `daily` time.
pub fn is_recurring(schedule: &str) -> bool {
    schedule.starts_with("every") || schedule.starts_with("daily")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fires due scheduled tasks through the same session-start path
/// interactive sessions use, and raises pre-run notifications.
pub struct Scheduler {
    schedules: ScheduleRepo,
    orchestrator: Arc<SessionOrchestrator>,
    event_tx: broadcast::Sender<ServerEvent>,
    /// Schedule ids already notified for their current `next_run`.
    notified: Mutex<HashSet<ScheduleId>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        db: Database,
        orchestrator: Arc<SessionOrchestrator>,
        event_tx: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            schedules: ScheduleRepo::new(db),
            orchestrator,
            event_tx,
            notified: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn send_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Validate the schedule string, derive `next_run`, persist.
    #[instrument(skip(self, params), fields(title = %params.title, schedule = %params.schedule))]
    pub fn create(&self, params: &CreateSchedule) -> Result<ScheduledTask, ScheduleError> {
        let next_run = calculate_next_run(&params.schedule, now_ms())?;
        let task = self.schedules.create(&InsertSchedule {
            title: params.title.clone(),
            prompt: params.prompt.clone(),
            schedule: params.schedule.clone(),
            next_run,
            is_recurring: is_recurring(&params.schedule),
            notify_before: params.notify_before,
        })?;
        self.emit_list();
        Ok(task)
    }

    /// Partial update. A changed schedule string is re-validated and
    /// `next_run`/`is_recurring` re-derived; an invalid one rejects the
    /// whole update.
    #[instrument(skip(self, patch), fields(schedule_id = %id))]
    pub fn update(&self, id: &ScheduleId, patch: &SchedulePatch) -> Result<ScheduledTask, ScheduleError> {
        let mut patch = patch.clone();
        if let Some(ref schedule) = patch.schedule {
            patch.next_run = Some(calculate_next_run(schedule, now_ms())?);
            patch.is_recurring = Some(is_recurring(schedule));
            self.notified.lock().remove(id);
        }
        self.schedules.update(id, &patch)?;
        self.emit_list();
        Ok(self.schedules.get(id)?)
    }

    #[instrument(skip(self), fields(schedule_id = %id))]
    pub fn delete(&self, id: &ScheduleId) -> Result<bool, ScheduleError> {
        let deleted = self.schedules.delete(id)?;
        self.notified.lock().remove(id);
        self.emit_list();
        Ok(deleted)
    }

    pub fn list(&self) -> Result<Vec<ScheduledTask>, ScheduleError> {
        Ok(self.schedules.list(true)?)
    }

    pub fn emit_list(&self) {
        match self.schedules.list(true) {
            Ok(tasks) => self.send_event(ServerEvent::ScheduleListed { tasks }),
            Err(e) => warn!(error = %e, "failed to list scheduled tasks"),
        }
    }

    /// Run the tick loop until `shutdown` is called.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!("scheduler started");
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => {
                        info!("scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        scheduler.tick(now_ms()).await;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// One pass: raise pending notifications, fire due tasks.
    pub async fn tick(&self, now: i64) {
        self.check_notifications(now);

        let due = match self.schedules.due(now) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to query due tasks");
                return;
            }
        };

        for task in due {
            self.fire(&task, now).await;
        }
    }

    fn check_notifications(&self, now: i64) {
        let tasks = match self.schedules.list(false) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to list tasks for notifications");
                return;
            }
        };

        let mut notified = self.notified.lock();
        for task in tasks {
            let Some(notify_before) = task.notify_before else {
                continue;
            };
            if notified.contains(&task.id) {
                continue;
            }
            let notify_at = task.next_run - notify_before * 60 * 1000;
            if now >= notify_at && now < task.next_run {
                self.send_event(ServerEvent::SchedulerNotification {
                    schedule_id: task.id.clone(),
                    title: task.title.clone(),
                    minutes: notify_before,
                });
                notified.insert(task.id);
            }
        }
    }

    /// Fire one due task: run its prompt in a disposable session, then
    /// reschedule (recurring) or disable (one-time). A failure here never
    /// touches sibling tasks.
    async fn fire(&self, task: &ScheduledTask, now: i64) {
        info!(schedule_id = %task.id, title = %task.title, "firing scheduled task");

        let mut session_id = None;
        if let Some(prompt) = task.prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            match self
                .orchestrator
                .start_session(StartSession {
                    title: Some(task.title.clone()),
                    prompt: prompt.clone(),
                    ..Default::default()
                })
                .await
            {
                Ok(session) => session_id = Some(session.id),
                Err(e) => {
                    warn!(schedule_id = %task.id, error = %e, "scheduled prompt failed to start");
                }
            }
        }

        self.send_event(ServerEvent::SchedulerFired {
            schedule_id: task.id.clone(),
            title: task.title.clone(),
            session_id,
        });

        self.notified.lock().remove(&task.id);

        let patch = if task.is_recurring {
            match calculate_next_run(&task.schedule, now) {
                Ok(next_run) => SchedulePatch::next_run(next_run),
                Err(e) => {
                    warn!(schedule_id = %task.id, error = %e, "failed to reschedule recurring task");
                    SchedulePatch::disable()
                }
            }
        } else {
            SchedulePatch::disable()
        };

        if let Err(e) = self.schedules.update(&task.id, &patch) {
            warn!(schedule_id = %task.id, error = %e, "failed to update fired task");
        }
        self.emit_list();
    }
}
