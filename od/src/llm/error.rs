//! LLM runner error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while driving the LLM sidecar
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Sidecar binary could not be spawned: {0}")]
    Spawn(String),

    #[error("Sidecar exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Unreadable sidecar output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Permanent failures that should fail the worker, not the task
    pub fn is_fatal(&self) -> bool {
        matches!(self, LlmError::Spawn(_))
    }

    /// Whether retrying the same invocation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Spawn(_) => false,
            LlmError::NonZeroExit { .. } => true,
            LlmError::Timeout(_) => true,
            LlmError::Cancelled => false,
            LlmError::InvalidOutput(_) => true,
            LlmError::Io(_) => true,
        }
    }
}
