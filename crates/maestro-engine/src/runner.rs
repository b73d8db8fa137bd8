use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use maestro_core::backend::{
    BackendEvent, BackendRequest, ModelBackend, StopReason, ToolOutcome,
};
use maestro_core::capability::CapabilityContext;
use maestro_core::events::ServerEvent;
use maestro_core::ids::SessionId;
use maestro_core::messages::StoredMessage;
use maestro_core::session::Session;
use maestro_core::tokens::TokenUsage;
use maestro_store::messages::MessageRepo;
use maestro_store::sessions::SessionRepo;
use maestro_store::Database;

use crate::error::EngineError;
use crate::permissions::{PermissionDecision, PermissionError, PermissionGate};
use crate::registry::CapabilityRegistry;

const DEFAULT_CAPABILITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for the session runner.
pub struct RunnerConfig {
    pub max_steps: u32,
    pub capability_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            capability_timeout: DEFAULT_CAPABILITY_TIMEOUT,
        }
    }
}

/// Live handle to one running model invocation. A session has at most one;
/// starting a new run aborts the previous handle first.
pub struct RunnerHandle {
    session_id: SessionId,
    cancel: CancellationToken,
    gate: Arc<PermissionGate>,
}

impl RunnerHandle {
    pub fn new(session_id: SessionId, gate: Arc<PermissionGate>) -> Self {
        Self {
            session_id,
            cancel: CancellationToken::new(),
            gate,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the run and deny every pending permission for this session.
    /// Idempotent: repeated aborts are no-ops.
    pub fn abort(&self) {
        self.cancel.cancel();
        let denied = self.gate.abort_session(&self.session_id);
        if denied > 0 {
            tracing::debug!(
                session_id = %self.session_id,
                denied,
                "abort denied pending permissions"
            );
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn resolve_permission(
        &self,
        tool_call_id: &maestro_core::ids::ToolCallId,
        approved: bool,
    ) -> Result<(), PermissionError> {
        self.gate.respond(&self.session_id, tool_call_id, approved)
    }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub resume_token: Option<String>,
    pub usage: TokenUsage,
}

/// Drives one prompt to completion: stream a model step, pause on tool
/// calls for the permission handshake, execute capabilities, feed results
/// into the next step, and persist everything along the way.
pub struct SessionRunner {
    backend: Arc<dyn ModelBackend>,
    capabilities: Arc<CapabilityRegistry>,
    gate: Arc<PermissionGate>,
    sessions: SessionRepo,
    messages: MessageRepo,
    event_tx: broadcast::Sender<ServerEvent>,
    config: RunnerConfig,
}

impl SessionRunner {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        capabilities: Arc<CapabilityRegistry>,
        gate: Arc<PermissionGate>,
        db: Database,
        event_tx: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            backend,
            capabilities,
            gate,
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db),
            event_tx,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    fn send_event(&self, event: ServerEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("no event receivers — event dropped");
        }
    }

    /// Run one prompt. The caller has already persisted the user prompt;
    /// the session history (prompt included) rides along on the first step.
    #[instrument(skip(self, session, prompt, cancel), fields(session_id = %session.id))]
    pub async fn run(
        &self,
        session: &Session,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let history: Vec<StoredMessage> = self
            .messages
            .history(&session.id)?
            .into_iter()
            .map(|r| r.message)
            .collect();

        let mut resume_token = session.resume_token.clone();
        let mut tool_outcomes: Vec<ToolOutcome> = Vec::new();
        let mut total_usage = TokenUsage::default();
        let mut step = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }

            step += 1;
            if step > self.config.max_steps {
                return Err(EngineError::MaxStepsExceeded(self.config.max_steps));
            }

            let request = BackendRequest {
                prompt: (step == 1).then(|| prompt.to_string()),
                history: if step == 1 { history.clone() } else { Vec::new() },
                tool_outcomes: std::mem::take(&mut tool_outcomes),
                resume_token: resume_token.clone(),
                model: session.model.clone(),
                temperature: session.temperature,
                cwd: session.cwd.clone(),
            };

            let mut stream = self.backend.stream(&request).await?;
            let mut stop_reason = None;

            while let Some(event) = stream.next().await {
                if cancel.is_cancelled() {
                    return Err(EngineError::Aborted);
                }

                match event {
                    BackendEvent::Delta { text } => {
                        // Live-only; the complete message follows.
                        self.send_event(ServerEvent::StreamMessage {
                            session_id: session.id.clone(),
                            payload: serde_json::json!({"type": "text_delta", "text": text}),
                        });
                    }
                    BackendEvent::Message { payload } => {
                        self.messages
                            .record(&session.id, &StoredMessage::assistant(payload.clone()))?;
                        self.send_event(ServerEvent::StreamMessage {
                            session_id: session.id.clone(),
                            payload,
                        });
                    }
                    BackendEvent::ToolCall { name, input } => {
                        let outcome = self
                            .handshake_and_execute(session, &name, input, cancel)
                            .await?;
                        tool_outcomes.push(outcome);
                    }
                    BackendEvent::Completed { usage, resume_token: token, stop_reason: sr } => {
                        total_usage.accumulate(&usage);
                        if token.is_some() {
                            resume_token = token;
                        }
                        stop_reason = Some(sr);
                    }
                    BackendEvent::Error { error } => {
                        return Err(EngineError::Backend(error));
                    }
                }
            }

            let stop_reason = stop_reason.ok_or_else(|| {
                EngineError::Internal("backend stream ended without a terminal event".into())
            })?;

            match stop_reason {
                StopReason::ToolUse => continue,
                StopReason::EndTurn | StopReason::MaxTokens => break,
            }
        }

        let result = StoredMessage::result(total_usage, false, None);
        self.messages.record(&session.id, &result)?;
        self.send_event(ServerEvent::StreamMessage {
            session_id: session.id.clone(),
            payload: serde_json::to_value(&result)
                .map_err(|e| EngineError::Internal(format!("serialize result: {e}")))?,
        });

        self.sessions.add_tokens(
            &session.id,
            total_usage.input_tokens as i64,
            total_usage.output_tokens as i64,
        )?;

        Ok(RunOutcome { resume_token, usage: total_usage })
    }

    /// The permission handshake for one tool call: register with the gate,
    /// wait for whichever of {user response, abort} comes first, then run
    /// the capability if approved. Capability failures become failed tool
    /// results, never run failures.
    async fn handshake_and_execute(
        &self,
        session: &Session,
        tool_name: &str,
        input: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, EngineError> {
        let (tool_call_id, decision_rx) =
            self.gate.request(&session.id, tool_name, input.clone());

        // Sender dropped means the gate entry was torn down; treat as abort.
        let decision = decision_rx.await.unwrap_or(PermissionDecision::Aborted);

        let outcome = match decision {
            PermissionDecision::Aborted => return Err(EngineError::Aborted),
            PermissionDecision::Denied => ToolOutcome {
                tool_call_id,
                tool_name: tool_name.to_string(),
                output: decision.denial_text().to_string(),
                is_error: true,
            },
            PermissionDecision::Approved => {
                let (output, is_error) = self
                    .execute_capability(session, tool_name, input, cancel)
                    .await;
                ToolOutcome {
                    tool_call_id,
                    tool_name: tool_name.to_string(),
                    output,
                    is_error,
                }
            }
        };

        let payload = serde_json::json!({
            "type": "tool_result",
            "tool_call_id": outcome.tool_call_id,
            "tool_name": outcome.tool_name,
            "output": outcome.output,
            "is_error": outcome.is_error,
        });
        self.messages
            .record(&session.id, &StoredMessage::assistant(payload.clone()))?;
        self.send_event(ServerEvent::StreamMessage {
            session_id: session.id.clone(),
            payload,
        });

        Ok(outcome)
    }

    async fn execute_capability(
        &self,
        session: &Session,
        tool_name: &str,
        input: serde_json::Value,
        cancel: &CancellationToken,
    ) -> (String, bool) {
        let Some(capability) = self.capabilities.get(tool_name) else {
            return (format!("Unknown capability: {tool_name}"), true);
        };

        let ctx = CapabilityContext {
            session_id: session.id.clone(),
            cwd: session.cwd.as_ref().map(PathBuf::from),
            abort_signal: cancel.clone(),
        };

        let result = tokio::time::timeout(
            self.config.capability_timeout,
            std::panic::AssertUnwindSafe(capability.execute(input, &ctx)).catch_unwind(),
        )
        .await;

        match result {
            Ok(Ok(Ok(outcome))) => (outcome.output, outcome.is_error),
            Ok(Ok(Err(e))) => (e.to_string(), true),
            Ok(Err(panic)) => {
                error!(
                    capability = tool_name,
                    panic = %panic_message(&panic),
                    "capability panicked during execution"
                );
                ("Internal error: capability crashed".into(), true)
            }
            Err(_) => {
                warn!(
                    capability = tool_name,
                    timeout_secs = self.config.capability_timeout.as_secs(),
                    "capability timed out"
                );
                (
                    format!(
                        "Capability timed out after {}s",
                        self.config.capability_timeout.as_secs()
                    ),
                    true,
                )
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_core::capability::{Capability, CapabilityError, CapabilityOutcome};
    use maestro_core::session::CreateSession;
    use maestro_core::ids::ToolCallId;
    use maestro_store::sessions::SessionRepo;

    use crate::mock::{MockBackend, MockStep};

    struct Fixture {
        db: Database,
        gate: Arc<PermissionGate>,
        event_tx: broadcast::Sender<ServerEvent>,
        session: Session,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let (event_tx, _) = broadcast::channel(256);
        let gate = Arc::new(PermissionGate::new(event_tx.clone()));
        let session = SessionRepo::new(db.clone())
            .create(&CreateSession { title: "test".into(), ..Default::default() })
            .unwrap();
        Fixture { db, gate, event_tx, session }
    }

    fn runner(
        fx: &Fixture,
        backend: Arc<MockBackend>,
        capabilities: CapabilityRegistry,
    ) -> SessionRunner {
        SessionRunner::new(
            backend,
            Arc::new(capabilities),
            Arc::clone(&fx.gate),
            fx.db.clone(),
            fx.event_tx.clone(),
        )
    }

    /// Approves or denies every permission request seen on the bus.
    fn auto_respond(fx: &Fixture, approve: bool) -> tokio::task::JoinHandle<()> {
        let mut rx = fx.event_tx.subscribe();
        let gate = Arc::clone(&fx.gate);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let ServerEvent::PermissionRequest { session_id, tool_call_id, .. } = event {
                    let _ = gate.respond(&session_id, &tool_call_id, approve);
                }
            }
        })
    }

    struct RecordingCapability {
        seen: Arc<parking_lot::Mutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl Capability for RecordingCapability {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &CapabilityContext,
        ) -> Result<CapabilityOutcome, CapabilityError> {
            self.seen.lock().push(args);
            Ok(CapabilityOutcome::ok("recorded"))
        }
    }

    struct FailingCapability;

    #[async_trait]
    impl Capability for FailingCapability {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &CapabilityContext,
        ) -> Result<CapabilityOutcome, CapabilityError> {
            Err(CapabilityError::ExecutionFailed("exit status 1".into()))
        }
    }

    struct PanicCapability;

    #[async_trait]
    impl Capability for PanicCapability {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &CapabilityContext,
        ) -> Result<CapabilityOutcome, CapabilityError> {
            panic!("capability exploded");
        }
    }

    #[tokio::test]
    async fn single_step_text_run() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![MockStep::text("Hello!")]));
        let runner = runner(&fx, Arc::clone(&backend), CapabilityRegistry::new());

        let cancel = CancellationToken::new();
        let outcome = runner.run(&fx.session, "Say hello", &cancel).await.unwrap();

        assert_eq!(outcome.resume_token.as_deref(), Some("mock_resume"));
        assert_eq!(outcome.usage, TokenUsage::new(8, 4));

        // Assistant message + terminal result persisted.
        let history = MessageRepo::new(fx.db.clone()).history(&fx.session.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message.role(), "assistant");
        assert!(history[1].message.is_terminal());

        // Token accumulators updated on the session row.
        let session = SessionRepo::new(fx.db.clone()).get(&fx.session.id).unwrap();
        assert_eq!(session.input_tokens, 8);
        assert_eq!(session.output_tokens, 4);
    }

    #[tokio::test]
    async fn first_step_carries_prompt_and_history() {
        let fx = fixture();
        MessageRepo::new(fx.db.clone())
            .record(&fx.session.id, &StoredMessage::user_prompt("Say hello"))
            .unwrap();

        let backend = Arc::new(MockBackend::new(vec![MockStep::text("Hello!")]));
        let runner = runner(&fx, Arc::clone(&backend), CapabilityRegistry::new());

        let cancel = CancellationToken::new();
        runner.run(&fx.session, "Say hello", &cancel).await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt.as_deref(), Some("Say hello"));
        assert_eq!(requests[0].history.len(), 1);
    }

    #[tokio::test]
    async fn approved_tool_call_feeds_result_back() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![
            MockStep::tool_call("recorder", serde_json::json!({"key": "value"})),
            MockStep::text("All done."),
        ]));

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut capabilities = CapabilityRegistry::new();
        capabilities.register(Arc::new(RecordingCapability { seen: Arc::clone(&seen) }));

        let runner = runner(&fx, Arc::clone(&backend), capabilities);
        let responder = auto_respond(&fx, true);

        let cancel = CancellationToken::new();
        let outcome = runner.run(&fx.session, "use the recorder", &cancel).await.unwrap();
        responder.abort();

        // Capability ran with the model's arguments.
        assert_eq!(seen.lock().as_slice(), &[serde_json::json!({"key": "value"})]);

        // Second backend step received the tool outcome.
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].tool_outcomes.len(), 1);
        assert_eq!(requests[1].tool_outcomes[0].output, "recorded");
        assert!(!requests[1].tool_outcomes[0].is_error);

        // Usage accumulated across both steps.
        assert_eq!(outcome.usage, TokenUsage::new(14, 6));
    }

    #[tokio::test]
    async fn denied_tool_call_feeds_denial_back() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![
            MockStep::tool_call("recorder", serde_json::json!({})),
            MockStep::text("Understood."),
        ]));

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut capabilities = CapabilityRegistry::new();
        capabilities.register(Arc::new(RecordingCapability { seen: Arc::clone(&seen) }));

        let runner = runner(&fx, Arc::clone(&backend), capabilities);
        let responder = auto_respond(&fx, false);

        let cancel = CancellationToken::new();
        let result = runner.run(&fx.session, "try it", &cancel).await;
        responder.abort();

        assert!(result.is_ok());
        // Denied: capability never ran.
        assert!(seen.lock().is_empty());

        let requests = backend.requests();
        assert_eq!(requests[1].tool_outcomes[0].output, "Permission denied by user");
        assert!(requests[1].tool_outcomes[0].is_error);
    }

    #[tokio::test]
    async fn abort_while_permission_pending() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![MockStep::tool_call(
            "recorder",
            serde_json::json!({}),
        )]));
        let runner = runner(&fx, Arc::clone(&backend), CapabilityRegistry::new());

        let handle = RunnerHandle::new(fx.session.id.clone(), Arc::clone(&fx.gate));
        let cancel = handle.cancel_token();

        let mut rx = fx.event_tx.subscribe();
        let session = fx.session.clone();
        let run = tokio::spawn(async move { runner.run(&session, "go", &cancel).await });

        // Wait until the permission request is on the bus, then abort.
        loop {
            match rx.recv().await.unwrap() {
                ServerEvent::PermissionRequest { .. } => break,
                _ => continue,
            }
        }
        assert_eq!(fx.gate.pending_count(&fx.session.id), 1);
        handle.abort();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(EngineError::Aborted)));
        // No permission left pending after abort.
        assert_eq!(fx.gate.pending_count(&fx.session.id), 0);
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let fx = fixture();
        let handle = RunnerHandle::new(fx.session.id.clone(), Arc::clone(&fx.gate));
        handle.abort();
        handle.abort();
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn capability_failure_becomes_failed_tool_result() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![
            MockStep::tool_call("failing", serde_json::json!({})),
            MockStep::text("Noted the failure."),
        ]));

        let mut capabilities = CapabilityRegistry::new();
        capabilities.register(Arc::new(FailingCapability));

        let runner = runner(&fx, Arc::clone(&backend), capabilities);
        let responder = auto_respond(&fx, true);

        let cancel = CancellationToken::new();
        let result = runner.run(&fx.session, "fail", &cancel).await;
        responder.abort();

        // The run keeps going; the failure is in the tool result.
        assert!(result.is_ok());
        let requests = backend.requests();
        assert!(requests[1].tool_outcomes[0].is_error);
        assert!(requests[1].tool_outcomes[0].output.contains("exit status 1"));
    }

    #[tokio::test]
    async fn capability_panic_does_not_crash_run() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![
            MockStep::tool_call("panicky", serde_json::json!({})),
            MockStep::text("Recovered."),
        ]));

        let mut capabilities = CapabilityRegistry::new();
        capabilities.register(Arc::new(PanicCapability));

        let runner = runner(&fx, Arc::clone(&backend), capabilities);
        let responder = auto_respond(&fx, true);

        let cancel = CancellationToken::new();
        let result = runner.run(&fx.session, "boom", &cancel).await;
        responder.abort();

        assert!(result.is_ok(), "run should survive a capability panic: {result:?}");
        let requests = backend.requests();
        assert!(requests[1].tool_outcomes[0].output.contains("crashed"));
        assert!(requests[1].tool_outcomes[0].is_error);
    }

    #[tokio::test]
    async fn unknown_capability_is_failed_tool_result() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![
            MockStep::tool_call("nonexistent", serde_json::json!({})),
            MockStep::text("ok"),
        ]));
        let runner = runner(&fx, Arc::clone(&backend), CapabilityRegistry::new());
        let responder = auto_respond(&fx, true);

        let cancel = CancellationToken::new();
        let result = runner.run(&fx.session, "go", &cancel).await;
        responder.abort();

        assert!(result.is_ok());
        let requests = backend.requests();
        assert!(requests[1].tool_outcomes[0].output.contains("Unknown capability"));
    }

    #[tokio::test]
    async fn backend_error_fails_run() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![MockStep::Error(
            maestro_core::backend::BackendError::Overloaded,
        )]));
        let runner = runner(&fx, Arc::clone(&backend), CapabilityRegistry::new());

        let cancel = CancellationToken::new();
        let result = runner.run(&fx.session, "hi", &cancel).await;
        assert!(matches!(result, Err(EngineError::Backend(_))));
    }

    #[tokio::test]
    async fn stream_error_event_fails_run() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![MockStep::stream_error(
            maestro_core::backend::BackendError::StreamInterrupted("eof".into()),
        )]));
        let runner = runner(&fx, Arc::clone(&backend), CapabilityRegistry::new());

        let cancel = CancellationToken::new();
        let result = runner.run(&fx.session, "hi", &cancel).await;
        assert!(matches!(result, Err(EngineError::Backend(_))));
    }

    #[tokio::test]
    async fn cancelled_before_start_aborts() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![MockStep::text("never seen")]));
        let runner = runner(&fx, Arc::clone(&backend), CapabilityRegistry::new());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner.run(&fx.session, "hi", &cancel).await;
        assert!(matches!(result, Err(EngineError::Aborted)));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn max_steps_exceeded() {
        let fx = fixture();
        let mut steps = Vec::new();
        for _ in 0..5 {
            steps.push(MockStep::tool_call("recorder", serde_json::json!({})));
        }
        let backend = Arc::new(MockBackend::new(steps));

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut capabilities = CapabilityRegistry::new();
        capabilities.register(Arc::new(RecordingCapability { seen }));

        let runner = runner(&fx, Arc::clone(&backend), capabilities)
            .with_config(RunnerConfig { max_steps: 3, ..Default::default() });
        let responder = auto_respond(&fx, true);

        let cancel = CancellationToken::new();
        let result = runner.run(&fx.session, "loop forever", &cancel).await;
        responder.abort();

        assert!(matches!(result, Err(EngineError::MaxStepsExceeded(3))));
    }

    #[tokio::test]
    async fn resume_token_threads_through_steps() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![
            MockStep::tool_call("recorder", serde_json::json!({})),
            MockStep::text("done"),
        ]));

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut capabilities = CapabilityRegistry::new();
        capabilities.register(Arc::new(RecordingCapability { seen }));

        let runner = runner(&fx, Arc::clone(&backend), capabilities);
        let responder = auto_respond(&fx, true);

        let cancel = CancellationToken::new();
        runner.run(&fx.session, "go", &cancel).await.unwrap();
        responder.abort();

        let requests = backend.requests();
        // First step starts fresh, second continues from the mock's token.
        assert!(requests[0].resume_token.is_none());
        assert_eq!(requests[1].resume_token.as_deref(), Some("mock_resume"));
    }

    #[tokio::test]
    async fn run_succeeds_without_event_receivers() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(vec![MockStep::text("quiet")]));
        let runner = runner(&fx, Arc::clone(&backend), CapabilityRegistry::new());

        // fixture() already dropped its receiver; sends will fail silently.
        let cancel = CancellationToken::new();
        let result = runner.run(&fx.session, "hi", &cancel).await;
        assert!(result.is_ok(), "run should succeed without receivers: {result:?}");
    }

    #[tokio::test]
    async fn handle_resolve_permission_orphan() {
        let fx = fixture();
        let handle = RunnerHandle::new(fx.session.id.clone(), Arc::clone(&fx.gate));
        let result = handle.resolve_permission(&ToolCallId::new(), true);
        assert!(matches!(result, Err(PermissionError::Orphan(_))));
    }
}
