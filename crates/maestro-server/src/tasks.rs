use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use maestro_core::events::{FanoutSpec, ServerEvent, TaskMode, TaskSnapshot};
use maestro_core::ids::{SessionId, TaskId};
use maestro_core::messages::{MessageRecord, StoredMessage};
use maestro_core::session::CreateSession;
use maestro_core::status::{aggregate, SessionStatus, TaskStatus};
use maestro_engine::EngineError;
use maestro_store::messages::MessageRepo;
use maestro_store::sessions::SessionRepo;
use maestro_store::Database;

use crate::orchestrator::SessionOrchestrator;

/// A multi-thread task: N member sessions fanned out together. Lives in
/// memory for the process lifetime; member sessions are persisted rows.
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub thread_ids: Vec<SessionId>,
    /// Per-member prompts, indexed like `thread_ids`.
    pub prompts: Vec<String>,
    pub auto_summary: bool,
    /// One summary per task, set before the summary thread starts so a
    /// later re-entry into `completed` cannot spawn a second one.
    pub summary_spawned: bool,
    pub created_at: String,
}

impl Task {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            mode: self.mode,
            status: self.status,
            thread_ids: self.thread_ids.clone(),
            auto_summary: self.auto_summary,
            created_at: self.created_at.clone(),
        }
    }
}

struct MemberPlan {
    label: String,
    prompt: String,
    model: Option<String>,
}

/// Creates, starts, aggregates and deletes multi-thread tasks. Task status
/// is always the pure aggregation of member session statuses; recomputation
/// is serialized per task by the task's own lock.
pub struct TaskManager {
    orchestrator: Arc<SessionOrchestrator>,
    sessions: SessionRepo,
    messages: MessageRepo,
    tasks: DashMap<TaskId, Arc<tokio::sync::Mutex<Task>>>,
    event_tx: broadcast::Sender<ServerEvent>,
}

impl TaskManager {
    pub fn new(
        orchestrator: Arc<SessionOrchestrator>,
        db: Database,
        event_tx: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            orchestrator,
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db),
            tasks: DashMap::new(),
            event_tx,
        }
    }

    fn send_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Create member sessions, register the task, transition it to running
    /// and start every member with a non-empty prompt.
    #[instrument(skip(self, fanout), fields(title, mode = %mode))]
    pub async fn create(
        &self,
        title: &str,
        mode: TaskMode,
        cwd: Option<String>,
        fanout: FanoutSpec,
    ) -> Result<TaskSnapshot, EngineError> {
        let plans = member_plans(mode, &fanout)?;
        let task_id = TaskId::new();

        let mut thread_ids = Vec::with_capacity(plans.len());
        let mut prompts = Vec::with_capacity(plans.len());
        let mut to_start = Vec::new();

        for plan in &plans {
            let session = self.sessions.create(&CreateSession {
                title: plan.label.clone(),
                cwd: cwd.clone(),
                model: plan.model.clone(),
                temperature: None,
                task_id: Some(task_id.clone()),
            })?;
            if !plan.prompt.trim().is_empty() {
                to_start.push((session.id.clone(), plan.prompt.clone()));
            }
            thread_ids.push(session.id);
            prompts.push(plan.prompt.clone());
        }

        let task = Task {
            id: task_id.clone(),
            title: title.to_string(),
            mode,
            status: TaskStatus::Created,
            thread_ids,
            prompts,
            auto_summary: fanout.auto_summary,
            summary_spawned: false,
            created_at: Utc::now().to_rfc3339(),
        };
        let created_snapshot = task.snapshot();
        self.tasks
            .insert(task_id.clone(), Arc::new(tokio::sync::Mutex::new(task)));

        self.send_event(ServerEvent::TaskCreated { task: created_snapshot });
        self.orchestrator.emit_session_list();

        // Explicit transition; from here on status is pure aggregation.
        self.set_status(&task_id, TaskStatus::Running).await;

        for (session_id, prompt) in to_start {
            if let Err(e) = self.orchestrator.continue_session(&session_id, prompt).await {
                warn!(session_id = %session_id, error = %e, "failed to start task member");
            }
        }

        Ok(self.snapshot(&task_id).await.expect("task just created"))
    }

    /// Explicit status transition, used only at creation and explicit
    /// start; every other change comes from [`Self::recompute`].
    async fn set_status(&self, task_id: &TaskId, status: TaskStatus) {
        let Some(entry) = self.tasks.get(task_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let mut task = entry.lock().await;
        if task.status != status {
            task.status = status;
            self.send_event(ServerEvent::TaskStatusChanged {
                task_id: task_id.clone(),
                status,
            });
        }
    }

    /// Re-enter the start-all-members path. Idempotent per member: a
    /// member already running is left alone, empty-prompt members stay put.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn start(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let entry = self
            .tasks
            .get(task_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::SessionNotFound(format!("task {task_id}")))?;

        let members: Vec<(SessionId, String)> = {
            let task = entry.lock().await;
            task.thread_ids
                .iter()
                .cloned()
                .zip(task.prompts.iter().cloned())
                .collect()
        };

        for (session_id, prompt) in members {
            if prompt.trim().is_empty() {
                continue;
            }
            match self.sessions.get(&session_id) {
                Ok(session) if session.status == SessionStatus::Running => continue,
                Ok(_) => {
                    if let Err(e) = self.orchestrator.continue_session(&session_id, prompt).await {
                        warn!(session_id = %session_id, error = %e, "failed to start task member");
                    }
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "task member missing"),
            }
        }
        Ok(())
    }

    /// Abort every member's runner, delete every member session, then
    /// remove the task.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn delete(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let (_, entry) = self
            .tasks
            .remove(task_id)
            .ok_or_else(|| EngineError::SessionNotFound(format!("task {task_id}")))?;

        let thread_ids = {
            let task = entry.lock().await;
            task.thread_ids.clone()
        };

        for session_id in &thread_ids {
            if let Err(e) = self.orchestrator.delete_session(session_id).await {
                warn!(session_id = %session_id, error = %e, "failed to delete task member");
            }
        }

        self.send_event(ServerEvent::TaskDeleted { task_id: task_id.clone() });
        Ok(())
    }

    pub async fn snapshot(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        let entry = self.tasks.get(task_id).map(|e| Arc::clone(e.value()))?;
        let task = entry.lock().await;
        Some(task.snapshot())
    }

    /// Recompute the task's status from its members' statuses. Called once
    /// per member status-change event; a no-op when nothing changed. Boxed
    /// because a recomputation can start the summary thread, whose own
    /// status change re-enters this function.
    pub fn recompute<'a>(&'a self, task_id: &'a TaskId) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(entry) = self.tasks.get(task_id).map(|e| Arc::clone(e.value())) else {
                debug!(task_id = %task_id, "recompute for unknown task");
                return;
            };

            let summary_input = {
                let mut task = entry.lock().await;

                let mut statuses = Vec::with_capacity(task.thread_ids.len());
                for session_id in &task.thread_ids {
                    match self.sessions.get(session_id) {
                        Ok(session) => statuses.push(session.status),
                        Err(_) => {
                            // A member deleted outside task deletion counts
                            // as idle, keeping the task unresolved.
                            warn!(
                                task_id = %task_id,
                                session_id = %session_id,
                                "task member missing, treated as idle"
                            );
                            statuses.push(SessionStatus::Idle);
                        }
                    }
                }

                let next = aggregate(task.status, &statuses);
                if next == task.status {
                    return;
                }
                task.status = next;
                self.send_event(ServerEvent::TaskStatusChanged {
                    task_id: task_id.clone(),
                    status: next,
                });

                if next == TaskStatus::Completed && task.auto_summary && !task.summary_spawned {
                    task.summary_spawned = true;
                    Some((
                        task.title.clone(),
                        task.thread_ids.clone(),
                        task.prompts.clone(),
                    ))
                } else {
                    None
                }
            };

            if let Some((title, thread_ids, prompts)) = summary_input {
                if let Err(e) = self
                    .spawn_summary(task_id, &entry, &title, &thread_ids, &prompts)
                    .await
                {
                    warn!(task_id = %task_id, error = %e, "failed to spawn summary thread");
                }
            }
        })
    }

    /// Synthesize one summary session from every member's full history,
    /// append it to the task and start it.
    async fn spawn_summary(
        &self,
        task_id: &TaskId,
        entry: &Arc<tokio::sync::Mutex<Task>>,
        title: &str,
        thread_ids: &[SessionId],
        prompts: &[String],
    ) -> Result<(), EngineError> {
        let mut sections = Vec::with_capacity(thread_ids.len());
        for (i, session_id) in thread_ids.iter().enumerate() {
            let Ok(session) = self.sessions.get(session_id) else {
                continue;
            };
            let history = self.messages.history(session_id)?;
            let prompt = prompts.get(i).map(String::as_str).unwrap_or_default();
            sections.push(render_thread(&session.title, prompt, &history));
        }

        let summary_prompt = format!(
            "The task \"{title}\" ran {count} agent threads in parallel. \
             Summarize their results into one answer, noting agreements and differences.\n\n{body}",
            count = thread_ids.len(),
            body = sections.join("\n\n"),
        );

        let summary = self.sessions.create(&CreateSession {
            title: "summary".into(),
            cwd: None,
            model: None,
            temperature: None,
            task_id: Some(task_id.clone()),
        })?;

        {
            let mut task = entry.lock().await;
            task.thread_ids.push(summary.id.clone());
            task.prompts.push(summary_prompt.clone());
        }

        self.orchestrator.emit_session_list();
        self.orchestrator
            .continue_session(&summary.id, summary_prompt)
            .await
    }
}

/// Expand the fan-out parameters into per-member labels/prompts/models.
fn member_plans(mode: TaskMode, fanout: &FanoutSpec) -> Result<Vec<MemberPlan>, EngineError> {
    match mode {
        TaskMode::Consensus => {
            let quantity = fanout.quantity.unwrap_or(1);
            if quantity == 0 {
                return Err(EngineError::Internal(
                    "consensus quantity must be at least 1".into(),
                ));
            }
            let prompt = fanout.prompt.clone().unwrap_or_default();
            Ok((1..=quantity)
                .map(|n| MemberPlan {
                    label: format!("thread-{n}"),
                    prompt: prompt.clone(),
                    model: fanout.model.clone(),
                })
                .collect())
        }
        TaskMode::DifferentTasks | TaskMode::RoleGroup => {
            if fanout.prompts.is_empty() {
                return Err(EngineError::Internal(format!(
                    "{mode} requires a prompts list"
                )));
            }
            Ok(fanout
                .prompts
                .iter()
                .enumerate()
                .map(|(i, prompt)| {
                    let label = match mode {
                        TaskMode::RoleGroup => fanout
                            .roles
                            .get(i)
                            .cloned()
                            .unwrap_or_else(|| format!("thread-{}", i + 1)),
                        _ => format!("thread-{}", i + 1),
                    };
                    MemberPlan {
                        label,
                        prompt: prompt.clone(),
                        model: fanout.models.get(i).cloned().or_else(|| fanout.model.clone()),
                    }
                })
                .collect())
        }
    }
}

fn render_thread(label: &str, prompt: &str, history: &[MessageRecord]) -> String {
    let mut lines = vec![format!("## {label}"), format!("Prompt: {prompt}")];
    for record in history {
        match &record.message {
            StoredMessage::UserPrompt { text } => lines.push(format!("User: {text}")),
            StoredMessage::Assistant { payload } => {
                if let Some(text) = payload.get("text").and_then(|t| t.as_str()) {
                    lines.push(format!("Assistant: {text}"));
                }
            }
            StoredMessage::Result { .. } => {}
        }
    }
    lines.join("\n")
}
