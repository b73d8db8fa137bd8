use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use maestro_core::backend::{
    BackendError, BackendEvent, BackendRequest, BackendStream, ModelBackend, StopReason,
};
use maestro_core::tokens::TokenUsage;

/// Pre-programmed backend steps for deterministic testing without a model.
pub enum MockStep {
    /// Yield a sequence of events.
    Stream(Vec<BackendEvent>),
    /// Return an error from the stream() call itself.
    Error(BackendError),
    /// Wait a duration, then yield the inner step.
    Delay(Duration, Box<MockStep>),
}

impl MockStep {
    /// A step that streams one text message and ends the turn.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![
            BackendEvent::Delta { text: text.to_string() },
            BackendEvent::Message {
                payload: serde_json::json!({"type": "text", "text": text}),
            },
            BackendEvent::Completed {
                usage: TokenUsage::new(8, 4),
                resume_token: Some("mock_resume".into()),
                stop_reason: StopReason::EndTurn,
            },
        ])
    }

    /// A step that requests one tool call and stops on `tool_use`.
    pub fn tool_call(name: &str, input: serde_json::Value) -> Self {
        Self::Stream(vec![
            BackendEvent::ToolCall { name: name.to_string(), input },
            BackendEvent::Completed {
                usage: TokenUsage::new(6, 2),
                resume_token: Some("mock_resume".into()),
                stop_reason: StopReason::ToolUse,
            },
        ])
    }

    /// A step whose stream ends with an error event.
    pub fn stream_error(error: BackendError) -> Self {
        Self::Stream(vec![BackendEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockStep) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock backend that replays scripted steps in call order. Every request is
/// recorded so tests can assert what was fed back (prompt, resume token,
/// tool outcomes).
pub struct MockBackend {
    steps: Vec<MockStep>,
    fallback_text: Option<String>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<BackendRequest>>,
}

impl MockBackend {
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps,
            fallback_text: None,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A backend that answers every request with the same text. Useful as a
    /// stand-in when no real provider is wired up.
    pub fn always_text(text: &str) -> Self {
        Self {
            steps: Vec::new(),
            fallback_text: Some(text.to_string()),
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, request: &BackendRequest) -> Result<BackendStream, BackendError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        match self.steps.get(idx) {
            Some(step) => resolve_step(step).await,
            None => match &self.fallback_text {
                Some(text) => {
                    let MockStep::Stream(events) = MockStep::text(text) else {
                        unreachable!()
                    };
                    Ok(Box::pin(stream::iter(events)))
                }
                None => Err(BackendError::InvalidRequest(format!(
                    "MockBackend: no step configured for call {idx}"
                ))),
            },
        }
    }
}

/// Resolve a step, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_step(step: &MockStep) -> Result<BackendStream, BackendError> {
    let mut current = step;
    loop {
        match current {
            MockStep::Stream(events) => {
                let events = events.clone();
                return Ok(Box::pin(stream::iter(events)));
            }
            MockStep::Error(e) => return Err(e.clone()),
            MockStep::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}
