//! LLM runner - opaque sidecar invocation
//!
//! The engine never speaks a provider protocol. Each iteration shells out
//! to a configured agent binary with the prompt on stdin and reads text,
//! cost, and exit code back. Invocations are cancellable mid-flight.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::watch;

mod error;
mod sidecar;

pub use error::LlmError;
pub use sidecar::SidecarRunner;

/// One invocation request
#[derive(Debug, Clone)]
pub struct RunnerRequest {
    /// Fully assembled prompt
    pub prompt: String,
    /// Model identifier forwarded to the sidecar
    pub model: String,
    /// Directory the sidecar runs in (the worker's workspace)
    pub workspace: PathBuf,
}

/// What the sidecar produced
#[derive(Debug, Clone)]
pub struct RunnerOutput {
    pub text: String,
    pub cost_usd: f64,
    pub exit_code: i32,
}

/// Invoke-prompt-return-text capability
///
/// Implementations may shell out to a real agent process or return
/// scripted output; the supervisor only sees this trait.
#[async_trait]
pub trait LlmRunner: Send + Sync {
    /// Run one invocation to completion or cancellation
    ///
    /// `cancel` flips to true when the caller wants the invocation torn
    /// down; implementations must kill in-flight work and return
    /// [`LlmError::Cancelled`].
    async fn run(
        &self,
        request: RunnerRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunnerOutput, LlmError>;
}
