//! Engine error surface
//!
//! One enum per failure kind the programmatic surface can return. Module
//! internals use their own error types and convert at the boundary.

use thiserror::Error;

/// Errors surfaced by the engine's programmatic operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Referenced entity missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad input: empty title, invalid status, cyclic dependency,
    /// non-leaf worker start, task of another outcome
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Pre-condition failed: worker already running, escalation not
    /// pending, analysis job already running, branch exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Execution task attempted before the capability gate was satisfied
    #[error("Capabilities not ready: {0}")]
    CapabilityNotReady(String),

    /// LLM runner returned a retriable failure
    #[error("LLM transient failure: {0}")]
    LlmTransient(String),

    /// LLM runner terminated permanently (missing binary, bad config)
    #[error("LLM fatal failure: {0}")]
    LlmFatal(String),

    /// Merge could not complete cleanly; surfaced via merge-queue state
    #[error("Merge conflict on {0}")]
    MergeConflict(String),

    /// Invariant violated; logged, never auto-recovered
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl From<crate::state::StateError> for EngineError {
    fn from(err: crate::state::StateError) -> Self {
        match err {
            crate::state::StateError::NotFound(id) => Self::NotFound(id),
            crate::state::StateError::Validation(msg) => Self::Validation(msg),
            crate::state::StateError::Conflict(msg) => Self::Conflict(msg),
            crate::state::StateError::CapabilityNotReady(msg) => Self::CapabilityNotReady(msg),
            crate::state::StateError::Store(msg) => Self::Internal(msg),
            crate::state::StateError::ChannelError => {
                Self::Internal("state channel closed".to_string())
            }
        }
    }
}

impl From<crate::llm::LlmError> for EngineError {
    fn from(err: crate::llm::LlmError) -> Self {
        if err.is_fatal() {
            Self::LlmFatal(err.to_string())
        } else {
            Self::LlmTransient(err.to_string())
        }
    }
}
