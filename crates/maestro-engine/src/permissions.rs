use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tracing::warn;

use maestro_core::events::ServerEvent;
use maestro_core::ids::{SessionId, ToolCallId};

/// How a pending tool-call approval was resolved. Whichever of
/// {user response, abort} happens first wins; the loser is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionDecision {
    Approved,
    Denied,
    Aborted,
}

impl PermissionDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Text fed back to the model when the call was not approved.
    pub fn denial_text(&self) -> &'static str {
        match self {
            Self::Approved => "",
            Self::Denied => "Permission denied by user",
            Self::Aborted => "Session aborted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    /// A response arrived for a tool call with no pending entry — the
    /// runner died or the call was already resolved. Logged and dropped.
    #[error("no pending permission for tool call {0}")]
    Orphan(ToolCallId),
}

struct PendingPermission {
    session_id: SessionId,
    tool_name: String,
    tx: oneshot::Sender<PermissionDecision>,
}

/// Per-session registry of pending tool-call approvals. Each entry is a
/// one-shot: the first resolution (user response or session abort) wins and
/// removes it, so no waiter can hang past its runner.
pub struct PermissionGate {
    pending: DashMap<ToolCallId, PendingPermission>,
    event_tx: broadcast::Sender<ServerEvent>,
}

impl PermissionGate {
    pub fn new(event_tx: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            pending: DashMap::new(),
            event_tx,
        }
    }

    /// Register a pending approval and announce it to the UI.
    pub fn request(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        input: serde_json::Value,
    ) -> (ToolCallId, oneshot::Receiver<PermissionDecision>) {
        let tool_call_id = ToolCallId::new();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            tool_call_id.clone(),
            PendingPermission {
                session_id: session_id.clone(),
                tool_name: tool_name.to_string(),
                tx,
            },
        );

        let event = ServerEvent::PermissionRequest {
            session_id: session_id.clone(),
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.to_string(),
            input,
        };
        if self.event_tx.send(event).is_err() {
            warn!(tool = tool_name, "no event receivers — permission request dropped");
        }

        (tool_call_id, rx)
    }

    /// Resolve a pending approval with the user's verdict.
    pub fn respond(
        &self,
        session_id: &SessionId,
        tool_call_id: &ToolCallId,
        approved: bool,
    ) -> Result<(), PermissionError> {
        let entry = self
            .pending
            .remove_if(tool_call_id, |_, p| &p.session_id == session_id);

        match entry {
            Some((_, pending)) => {
                let decision = if approved {
                    PermissionDecision::Approved
                } else {
                    PermissionDecision::Denied
                };
                // Receiver gone means the runner already stopped; nothing to do.
                let _ = pending.tx.send(decision);
                Ok(())
            }
            None => Err(PermissionError::Orphan(tool_call_id.clone())),
        }
    }

    /// Deny every pending approval for a session. Called on abort so no
    /// request waits forever. Returns the number of entries resolved.
    pub fn abort_session(&self, session_id: &SessionId) -> usize {
        let ids: Vec<ToolCallId> = self
            .pending
            .iter()
            .filter(|entry| &entry.value().session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut resolved = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(PermissionDecision::Aborted);
                resolved += 1;
            }
        }
        resolved
    }

    pub fn pending_count(&self, session_id: &SessionId) -> usize {
        self.pending
            .iter()
            .filter(|entry| &entry.value().session_id == session_id)
            .count()
    }

    pub fn pending_tool_name(&self, tool_call_id: &ToolCallId) -> Option<String> {
        self.pending.get(tool_call_id).map(|p| p.tool_name.clone())
    }
}
