use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::SessionId;

/// Context available to capabilities during execution.
pub struct CapabilityContext {
    pub session_id: SessionId,
    pub cwd: Option<PathBuf>,
    pub abort_signal: CancellationToken,
}

/// Outcome of a capability invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityOutcome {
    pub output: String,
    pub is_error: bool,
}

impl CapabilityOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { output: output.into(), is_error: false }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self { output: output.into(), is_error: true }
    }
}

/// A named side-effecting operation (shell, file I/O, search, ...) invoked
/// by the model through the orchestrator, gated by user approval.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &CapabilityContext,
    ) -> Result<CapabilityOutcome, CapabilityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}
