use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{instrument, warn};

use maestro_core::backend::ModelBackend;
use maestro_core::events::ServerEvent;
use maestro_core::ids::SessionId;
use maestro_core::messages::StoredMessage;
use maestro_core::session::{CreateSession, Session, SessionPatch};
use maestro_core::status::SessionStatus;
use maestro_engine::permissions::PermissionError;
use maestro_engine::{
    CapabilityRegistry, EngineError, PermissionGate, RunnerHandle, SessionRunner,
};
use maestro_store::messages::MessageRepo;
use maestro_store::sessions::SessionRepo;
use maestro_store::Database;

use crate::tasks::TaskManager;

/// Parameters for starting a fresh session from a prompt.
#[derive(Clone, Debug, Default)]
pub struct StartSession {
    pub title: Option<String>,
    pub prompt: String,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

/// Owns the in-memory session state for the process lifetime: the runner
/// handle per session, the permission gate, and the status state machine.
/// All mutations go through this one instance.
pub struct SessionOrchestrator {
    db: Database,
    sessions: SessionRepo,
    messages: MessageRepo,
    backend: Arc<dyn ModelBackend>,
    capabilities: Arc<CapabilityRegistry>,
    gate: Arc<PermissionGate>,
    handles: DashMap<SessionId, Arc<RunnerHandle>>,
    event_tx: broadcast::Sender<ServerEvent>,
    tasks: RwLock<Option<Arc<TaskManager>>>,
}

impl SessionOrchestrator {
    pub fn new(
        db: Database,
        backend: Arc<dyn ModelBackend>,
        capabilities: Arc<CapabilityRegistry>,
        event_tx: broadcast::Sender<ServerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            db,
            backend,
            capabilities,
            gate: Arc::new(PermissionGate::new(event_tx.clone())),
            handles: DashMap::new(),
            event_tx,
            tasks: RwLock::new(None),
        })
    }

    /// Wire up the task manager after construction (the two reference each
    /// other: member status changes drive task recomputation, and task
    /// fan-out starts member sessions here).
    pub fn attach_task_manager(&self, tasks: Arc<TaskManager>) {
        *self.tasks.write() = Some(tasks);
    }

    pub fn gate(&self) -> Arc<PermissionGate> {
        Arc::clone(&self.gate)
    }

    fn send_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Create a session and run the first prompt.
    #[instrument(skip(self, params), fields(title))]
    pub async fn start_session(
        self: &Arc<Self>,
        params: StartSession,
    ) -> Result<Session, EngineError> {
        let title = params
            .title
            .clone()
            .unwrap_or_else(|| title_from_prompt(&params.prompt));

        let session = self.sessions.create(&CreateSession {
            title,
            cwd: params.cwd.clone(),
            model: params.model.clone(),
            temperature: params.temperature,
            task_id: None,
        })?;

        self.emit_session_list();
        self.begin_run(session.clone(), params.prompt, true).await?;
        Ok(session)
    }

    /// Continue an existing session with a new prompt.
    #[instrument(skip(self, prompt), fields(session_id = %id))]
    pub async fn continue_session(
        self: &Arc<Self>,
        id: &SessionId,
        prompt: String,
    ) -> Result<(), EngineError> {
        let session = self
            .sessions
            .get(id)
            .map_err(|_| EngineError::SessionNotFound(id.to_string()))?;
        self.begin_run(session, prompt, true).await
    }

    /// Edit message *k*: truncate everything after it, replace it with the
    /// new prompt, drop the now-stale backend conversation handle, and
    /// re-run.
    #[instrument(skip(self, new_prompt), fields(session_id = %id, index))]
    pub async fn edit_message(
        self: &Arc<Self>,
        id: &SessionId,
        index: usize,
        new_prompt: String,
    ) -> Result<(), EngineError> {
        let session = self
            .sessions
            .get(id)
            .map_err(|_| EngineError::SessionNotFound(id.to_string()))?;

        let count = self.messages.count(id)? as usize;
        if index >= count {
            return Err(EngineError::Internal(format!(
                "message index {index} out of range (history has {count})"
            )));
        }

        self.messages.truncate_after(id, index)?;
        self.messages
            .update_at(id, index, &StoredMessage::user_prompt(&new_prompt))?;
        self.sessions.clear_resume_token(id)?;

        let session = Session { resume_token: None, ..session };
        self.begin_run(session, new_prompt, false).await
    }

    /// Abort the live runner, if any. The status transition back to idle
    /// happens when the aborted run winds down.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn stop_session(&self, id: &SessionId) -> bool {
        match self.handles.get(id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn delete_session(self: &Arc<Self>, id: &SessionId) -> Result<(), EngineError> {
        if let Some((_, handle)) = self.handles.remove(id) {
            handle.abort();
        }
        let existed = self.sessions.delete(id)?;
        if !existed {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }
        self.send_event(ServerEvent::SessionDeleted { session_id: id.clone() });
        self.emit_session_list();
        Ok(())
    }

    pub fn pin_session(&self, id: &SessionId, is_pinned: bool) -> Result<(), EngineError> {
        self.sessions.set_pinned(id, is_pinned)?;
        self.emit_session_list();
        Ok(())
    }

    pub fn update_session(&self, id: &SessionId, patch: &SessionPatch) -> Result<(), EngineError> {
        let changed = self.sessions.update(id, patch)?;
        if !changed {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }
        self.emit_session_list();
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, EngineError> {
        Ok(self.sessions.list()?)
    }

    /// Broadcast a fresh session list to every window.
    pub fn emit_session_list(&self) {
        match self.sessions.list() {
            Ok(sessions) => self.send_event(ServerEvent::SessionListed { sessions }),
            Err(e) => warn!(error = %e, "failed to list sessions"),
        }
    }

    /// Build a history event for one requesting window. `limit` of `None`
    /// returns the full history; otherwise a newest-first page.
    pub fn history_event(
        &self,
        id: &SessionId,
        limit: Option<u32>,
        before: Option<i64>,
    ) -> Result<ServerEvent, EngineError> {
        let session = self
            .sessions
            .get(id)
            .map_err(|_| EngineError::SessionNotFound(id.to_string()))?;

        let (messages, has_more, next_cursor) = match limit {
            Some(limit) => {
                let page = self.messages.history_page(id, limit, before)?;
                (page.messages, page.has_more, page.next_cursor)
            }
            None => (self.messages.history(id)?, false, None),
        };

        Ok(ServerEvent::SessionHistory {
            session_id: id.clone(),
            messages,
            has_more,
            next_cursor,
            input_tokens: session.input_tokens,
            output_tokens: session.output_tokens,
        })
    }

    /// Route a user's permission verdict to the live runner. A response
    /// with no live runner handle is an orphan: logged and dropped.
    pub fn resolve_permission(
        &self,
        session_id: &SessionId,
        tool_call_id: &maestro_core::ids::ToolCallId,
        approved: bool,
    ) -> Result<(), PermissionError> {
        match self.handles.get(session_id) {
            Some(handle) => handle.resolve_permission(tool_call_id, approved),
            None => Err(PermissionError::Orphan(tool_call_id.clone())),
        }
    }

    pub fn is_running(&self, id: &SessionId) -> bool {
        self.handles.contains_key(id)
    }

    /// Start a run for a session that already exists. Aborts any previous
    /// handle first: a session has at most one live runner.
    pub(crate) async fn begin_run(
        self: &Arc<Self>,
        session: Session,
        prompt: String,
        persist_prompt: bool,
    ) -> Result<(), EngineError> {
        if let Some((_, old)) = self.handles.remove(&session.id) {
            old.abort();
        }

        if persist_prompt {
            self.messages
                .record(&session.id, &StoredMessage::user_prompt(&prompt))?;
        }
        self.sessions.update(
            &session.id,
            &SessionPatch { last_prompt: Some(prompt.clone()), ..Default::default() },
        )?;
        self.send_event(ServerEvent::StreamUserPrompt {
            session_id: session.id.clone(),
            text: prompt.clone(),
        });

        self.set_status(&session.id, SessionStatus::Running).await?;

        let handle = Arc::new(RunnerHandle::new(session.id.clone(), self.gate()));
        self.handles.insert(session.id.clone(), Arc::clone(&handle));

        let orch = Arc::clone(self);
        tokio::spawn(async move {
            let runner = SessionRunner::new(
                Arc::clone(&orch.backend),
                Arc::clone(&orch.capabilities),
                orch.gate(),
                orch.db.clone(),
                orch.event_tx.clone(),
            );

            let cancel = handle.cancel_token();
            let result = runner.run(&session, &prompt, &cancel).await;

            let final_status = match result {
                Ok(outcome) => {
                    if let Some(token) = outcome.resume_token {
                        let patch =
                            SessionPatch { resume_token: Some(token), ..Default::default() };
                        if let Err(e) = orch.sessions.update(&session.id, &patch) {
                            warn!(session_id = %session.id, error = %e, "failed to persist resume token");
                        }
                    }
                    SessionStatus::Completed
                }
                Err(e) if e.is_abort() => SessionStatus::Idle,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "session run failed");
                    orch.send_event(ServerEvent::RunnerError {
                        session_id: Some(session.id.clone()),
                        message: e.to_string(),
                    });
                    SessionStatus::Error
                }
            };

            orch.handles.remove(&session.id);
            if let Err(e) = orch.set_status(&session.id, final_status).await {
                warn!(session_id = %session.id, error = %e, "failed to record final status");
            }
        });

        Ok(())
    }

    /// Persist a status transition, announce it, and recompute the parent
    /// task's status if this session is a task member.
    pub(crate) async fn set_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), EngineError> {
        let changed = self.sessions.update(id, &SessionPatch::status(status))?;
        if !changed {
            // Session deleted out from under a finishing run.
            return Ok(());
        }

        self.send_event(ServerEvent::SessionStatusChanged {
            session_id: id.clone(),
            status,
        });

        let task_id = self.sessions.get(id).ok().and_then(|s| s.task_id);
        if let Some(task_id) = task_id {
            let tasks = self.tasks.read().clone();
            if let Some(tasks) = tasks {
                tasks.recompute(&task_id).await;
            }
        }
        Ok(())
    }
}

/// Default session title: the first three words of the prompt.
fn title_from_prompt(prompt: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return "New Chat".to_string();
    }
    trimmed.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use maestro_engine::mock::{MockBackend, MockStep};

    fn setup(backend: MockBackend) -> (Arc<SessionOrchestrator>, broadcast::Receiver<ServerEvent>, Database) {
        let db = Database::in_memory().unwrap();
        let (event_tx, event_rx) = broadcast::channel(512);
        let orchestrator = SessionOrchestrator::new(
            db.clone(),
            Arc::new(backend),
            Arc::new(CapabilityRegistry::new()),
            event_tx,
        );
        (orchestrator, event_rx, db)
    }

    async fn wait_for_status(
        rx: &mut broadcast::Receiver<ServerEvent>,
        expected: SessionStatus,
    ) -> SessionId {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for status")
                .expect("event channel closed");
            if let ServerEvent::SessionStatusChanged { session_id, status } = event {
                if status == expected {
                    return session_id;
                }
            }
        }
    }

    #[tokio::test]
    async fn start_session_runs_to_completion() {
        let (orch, mut rx, _db) = setup(MockBackend::new(vec![MockStep::text("Hello!")]));

        let session = orch
            .start_session(StartSession { prompt: "Say hello to me".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(session.title, "Say hello to");

        let completed = wait_for_status(&mut rx, SessionStatus::Completed).await;
        assert_eq!(completed, session.id);

        let stored = orch.sessions.get(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.resume_token.as_deref(), Some("mock_resume"));
        assert_eq!(stored.last_prompt.as_deref(), Some("Say hello to me"));
        assert!(!orch.is_running(&session.id));

        // Prompt + assistant + result in history.
        let history = orch.messages.history(&session.id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message.role(), "user_prompt");
    }

    #[tokio::test]
    async fn explicit_title_wins() {
        let (orch, mut rx, _db) = setup(MockBackend::new(vec![MockStep::text("ok")]));
        let session = orch
            .start_session(StartSession {
                title: Some("My Research".into()),
                prompt: "dig into this".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.title, "My Research");
        wait_for_status(&mut rx, SessionStatus::Completed).await;
    }

    #[tokio::test]
    async fn continue_unknown_session_fails() {
        let (orch, _rx, _db) = setup(MockBackend::new(vec![]));
        let result = orch
            .continue_session(&SessionId::new(), "hello".into())
            .await;
        assert!(matches!(result, Err(EngineError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn backend_failure_sets_error_status() {
        let (orch, mut rx, _db) = setup(MockBackend::new(vec![MockStep::Error(
            maestro_core::backend::BackendError::Overloaded,
        )]));

        let session = orch
            .start_session(StartSession { prompt: "doomed".into(), ..Default::default() })
            .await
            .unwrap();

        wait_for_status(&mut rx, SessionStatus::Error).await;
        let stored = orch.sessions.get(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn error_run_emits_runner_error() {
        let (orch, mut rx, _db) = setup(MockBackend::new(vec![MockStep::Error(
            maestro_core::backend::BackendError::Network("dns".into()),
        )]));

        let session = orch
            .start_session(StartSession { prompt: "doomed".into(), ..Default::default() })
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out")
                .unwrap();
            if let ServerEvent::RunnerError { session_id, message } = event {
                assert_eq!(session_id, Some(session.id.clone()));
                assert!(message.contains("network"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn stop_aborts_and_returns_to_idle() {
        let backend = MockBackend::new(vec![MockStep::delayed(
            Duration::from_secs(10),
            MockStep::text("too slow"),
        )]);
        let (orch, mut rx, _db) = setup(backend);

        let session = orch
            .start_session(StartSession { prompt: "slow one".into(), ..Default::default() })
            .await
            .unwrap();

        wait_for_status(&mut rx, SessionStatus::Running).await;
        assert!(orch.stop_session(&session.id));

        wait_for_status(&mut rx, SessionStatus::Idle).await;
        let stored = orch.sessions.get(&session.id).unwrap();
        // Aborted runs are a clean idle, never an error.
        assert_eq!(stored.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn stop_without_runner_is_false() {
        let (orch, _rx, _db) = setup(MockBackend::new(vec![]));
        assert!(!orch.stop_session(&SessionId::new()));
    }

    #[tokio::test]
    async fn delete_aborts_runner_and_removes_session() {
        let backend = MockBackend::new(vec![MockStep::delayed(
            Duration::from_secs(10),
            MockStep::text("never"),
        )]);
        let (orch, mut rx, _db) = setup(backend);

        let session = orch
            .start_session(StartSession { prompt: "delete me".into(), ..Default::default() })
            .await
            .unwrap();
        wait_for_status(&mut rx, SessionStatus::Running).await;

        orch.delete_session(&session.id).await.unwrap();
        assert!(orch.sessions.get(&session.id).is_err());
        assert!(!orch.is_running(&session.id));
    }

    #[tokio::test]
    async fn delete_unknown_session_fails() {
        let (orch, _rx, _db) = setup(MockBackend::new(vec![]));
        let result = orch.delete_session(&SessionId::new()).await;
        assert!(matches!(result, Err(EngineError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn edit_message_truncates_and_reruns() {
        let backend = MockBackend::new(vec![
            MockStep::text("first answer"),
            MockStep::text("second answer"),
        ]);
        let (orch, mut rx, _db) = setup(backend);

        let session = orch
            .start_session(StartSession { prompt: "original prompt".into(), ..Default::default() })
            .await
            .unwrap();
        wait_for_status(&mut rx, SessionStatus::Completed).await;

        // History: [prompt, assistant, result]. Edit index 0.
        orch.edit_message(&session.id, 0, "edited prompt".into())
            .await
            .unwrap();
        wait_for_status(&mut rx, SessionStatus::Completed).await;

        let history = orch.messages.history(&session.id).unwrap();
        // Edited prompt + new assistant + new result; nothing from the
        // first run survives past the edited index.
        assert_eq!(history.len(), 3);
        match &history[0].message {
            StoredMessage::UserPrompt { text } => assert_eq!(text, "edited prompt"),
            other => panic!("expected edited prompt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn edit_message_out_of_range_fails() {
        let (orch, mut rx, _db) = setup(MockBackend::new(vec![MockStep::text("hi")]));
        let session = orch
            .start_session(StartSession { prompt: "short".into(), ..Default::default() })
            .await
            .unwrap();
        wait_for_status(&mut rx, SessionStatus::Completed).await;

        let result = orch.edit_message(&session.id, 99, "nope".into()).await;
        assert!(matches!(result, Err(EngineError::Internal(_))));
    }

    #[tokio::test]
    async fn permission_response_without_runner_is_orphan() {
        let (orch, _rx, _db) = setup(MockBackend::new(vec![]));
        let result = orch.resolve_permission(
            &SessionId::new(),
            &maestro_core::ids::ToolCallId::new(),
            true,
        );
        assert!(matches!(result, Err(PermissionError::Orphan(_))));
    }

    #[tokio::test]
    async fn pin_and_list() {
        let (orch, mut rx, _db) = setup(MockBackend::new(vec![MockStep::text("a")]));
        let session = orch
            .start_session(StartSession { prompt: "pin me".into(), ..Default::default() })
            .await
            .unwrap();
        wait_for_status(&mut rx, SessionStatus::Completed).await;

        orch.pin_session(&session.id, true).unwrap();
        let sessions = orch.list_sessions().unwrap();
        assert!(sessions[0].is_pinned);
    }

    #[tokio::test]
    async fn history_event_pages() {
        let (orch, mut rx, _db) = setup(MockBackend::new(vec![MockStep::text("answer")]));
        let session = orch
            .start_session(StartSession { prompt: "hello".into(), ..Default::default() })
            .await
            .unwrap();
        wait_for_status(&mut rx, SessionStatus::Completed).await;

        let event = orch.history_event(&session.id, Some(2), None).unwrap();
        match event {
            ServerEvent::SessionHistory { messages, has_more, .. } => {
                assert_eq!(messages.len(), 2);
                assert!(has_more);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let full = orch.history_event(&session.id, None, None).unwrap();
        match full {
            ServerEvent::SessionHistory { messages, has_more, .. } => {
                assert_eq!(messages.len(), 3);
                assert!(!has_more);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_event_unknown_session() {
        let (orch, _rx, _db) = setup(MockBackend::new(vec![]));
        let result = orch.history_event(&SessionId::new(), None, None);
        assert!(matches!(result, Err(EngineError::SessionNotFound(_))));
    }

    #[test]
    fn default_titles() {
        assert_eq!(title_from_prompt("  "), "New Chat");
        assert_eq!(title_from_prompt("fix the login bug now"), "fix the login");
        assert_eq!(title_from_prompt("hello"), "hello");
    }
}
