//! Sidecar runner - spawns the external agent binary per invocation
//!
//! The prompt goes to the child's stdin; stdout is collected whole. If the
//! final stdout line is a JSON object, it is treated as a metadata tail
//! and mined for cost (`cost_usd` or `total_cost_usd`); the remaining
//! lines form the response text.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::LlmConfig;

use super::{LlmError, LlmRunner, RunnerOutput, RunnerRequest};

/// Production runner: one child process per invocation
pub struct SidecarRunner {
    config: LlmConfig,
}

impl SidecarRunner {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }

    /// Split a metadata tail off the raw stdout, if present
    fn parse_output(stdout: &str, exit_code: i32) -> RunnerOutput {
        let trimmed = stdout.trim_end();
        let mut cost_usd = 0.0;
        let mut text = trimmed.to_string();

        if let Some(last_line) = trimmed.lines().last()
            && last_line.starts_with('{')
            && let Ok(meta) = serde_json::from_str::<serde_json::Value>(last_line)
        {
            cost_usd = meta
                .get("cost_usd")
                .or_else(|| meta.get("total_cost_usd"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            // Prefer an embedded result field over the raw body
            if let Some(result) = meta.get("result").and_then(|v| v.as_str()) {
                text = result.to_string();
            } else {
                text = trimmed[..trimmed.len() - last_line.len()].trim_end().to_string();
            }
        }

        RunnerOutput {
            text,
            cost_usd,
            exit_code,
        }
    }
}

#[async_trait]
impl LlmRunner for SidecarRunner {
    async fn run(
        &self,
        request: RunnerRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunnerOutput, LlmError> {
        let timeout = self.config.iteration_timeout();

        debug!(
            command = %self.config.command,
            model = %request.model,
            workspace = %request.workspace.display(),
            prompt_len = request.prompt.len(),
            "Spawning sidecar"
        );

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg("--model")
            .arg(&request.model)
            .current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::Spawn(format!("{}: {}", self.config.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            drop(stdin);
        }

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            result = &mut wait => result?,
            _ = tokio::time::sleep(timeout) => {
                warn!(?timeout, "Sidecar invocation timed out");
                return Err(LlmError::Timeout(timeout));
            }
            changed = cancel.changed() => {
                if changed.is_ok() && *cancel.borrow() {
                    debug!("Sidecar invocation cancelled");
                    return Err(LlmError::Cancelled);
                }
                // Sender dropped without a cancel signal; finish the call
                wait.await?
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(LlmError::NonZeroExit {
                code: exit_code,
                stderr,
            });
        }

        Ok(Self::parse_output(&stdout, exit_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_output() {
        let out = SidecarRunner::parse_output("did the thing\nall done", 0);
        assert_eq!(out.text, "did the thing\nall done");
        assert_eq!(out.cost_usd, 0.0);
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn test_parse_metadata_tail() {
        let raw = "did the thing\n{\"cost_usd\": 0.042}";
        let out = SidecarRunner::parse_output(raw, 0);
        assert_eq!(out.text, "did the thing");
        assert!((out.cost_usd - 0.042).abs() < 1e-9);
    }

    #[test]
    fn test_parse_result_field() {
        let raw = "{\"result\": \"final answer\", \"total_cost_usd\": 0.01}";
        let out = SidecarRunner::parse_output(raw, 0);
        assert_eq!(out.text, "final answer");
        assert!((out.cost_usd - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_parse_malformed_tail_kept_as_text() {
        let raw = "body\n{not json";
        let out = SidecarRunner::parse_output(raw, 0);
        assert_eq!(out.text, "body\n{not json");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let config = LlmConfig {
            command: "/nonexistent/agent-binary".to_string(),
            ..Default::default()
        };
        let runner = SidecarRunner::new(config);
        let (_tx, rx) = watch::channel(false);

        let err = runner
            .run(
                RunnerRequest {
                    prompt: "hello".to_string(),
                    model: "m".to_string(),
                    workspace: std::env::temp_dir(),
                },
                rx,
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_echo_sidecar() {
        // `sh -c cat -- --model m` swallows the model flag as shell
        // positionals and echoes the prompt from stdin
        let config = LlmConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "cat".to_string(), "--".to_string()],
            ..Default::default()
        };
        let runner = SidecarRunner::new(config);
        let (_tx, rx) = watch::channel(false);

        let out = runner
            .run(
                RunnerRequest {
                    prompt: "hello sidecar".to_string(),
                    model: "m".to_string(),
                    workspace: std::env::temp_dir(),
                },
                rx,
            )
            .await
            .unwrap();
        assert_eq!(out.text, "hello sidecar");
        assert_eq!(out.exit_code, 0);
    }
}
