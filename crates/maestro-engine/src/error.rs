use maestro_core::backend::BackendError;
use maestro_core::capability::CapabilityError;
use maestro_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Deliberate stop. Never surfaced as an error outcome: the session
    /// transitions back to idle.
    #[error("run aborted")]
    Aborted,

    #[error("max steps exceeded: {0}")]
    MaxStepsExceeded(u32),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
