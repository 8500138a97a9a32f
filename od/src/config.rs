//! Outcomed configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM sidecar configuration
    pub llm: LlmConfig,

    /// Concurrency limits
    pub concurrency: ConcurrencyConfig,

    /// Observer thresholds
    pub observer: ObserverConfig,

    /// Escalation handling
    pub escalation: EscalationConfig,

    /// Review and convergence
    pub review: ReviewConfig,

    /// Git integration
    pub git: GitConfig,

    /// Storage locations
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `.outcomed.yml` in the working directory, then
    /// the user config dir, then built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".outcomed.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("outcomed").join("outcomed.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM sidecar configuration
///
/// The runner shells out to an external agent binary; the provider
/// protocol behind that binary is not this process's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Sidecar binary invoked per iteration
    pub command: String,

    /// Extra arguments passed before the prompt
    pub args: Vec<String>,

    /// Model identifier forwarded to the sidecar
    pub model: String,

    /// Per-iteration wall clock limit in milliseconds
    #[serde(rename = "iteration-timeout-ms")]
    pub iteration_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            model: "claude-sonnet-4-20250514".to_string(),
            iteration_timeout_ms: 300_000,
        }
    }
}

impl LlmConfig {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_millis(self.iteration_timeout_ms)
    }
}

/// Concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum concurrent workers across all outcomes
    #[serde(rename = "max-workers")]
    pub max_workers: usize,

    /// Maximum concurrent LLM invocations; excess queue
    #[serde(rename = "max-llm-calls")]
    pub max_llm_calls: usize,

    /// Sliding-window rate limit on LLM invocations
    #[serde(rename = "max-calls-per-window")]
    pub max_calls_per_window: u32,

    #[serde(rename = "rate-window-secs")]
    pub rate_window_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            max_llm_calls: 4,
            max_calls_per_window: 60,
            rate_window_secs: 60,
        }
    }
}

impl ConcurrencyConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}

/// Observer thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Ambiguity-pattern confidence below which an escalation is raised
    #[serde(rename = "ambiguity-confidence-threshold")]
    pub ambiguity_confidence_threshold: f64,

    /// Consecutive poor/off-track iterations before the task is failed
    #[serde(rename = "strikes-before-fail")]
    pub strikes_before_fail: u32,

    /// Recent progress entries folded into prompt context
    #[serde(rename = "context-max-entries")]
    pub context_max_entries: usize,

    /// Per-entry character budget in prompt context
    #[serde(rename = "context-max-chars")]
    pub context_max_chars: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            ambiguity_confidence_threshold: 0.6,
            strikes_before_fail: 2,
            context_max_entries: 5,
            context_max_chars: 500,
        }
    }
}

/// Escalation handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Minimum match confidence for auto-resolution
    #[serde(rename = "auto-resolve-threshold")]
    pub auto_resolve_threshold: f64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            auto_resolve_threshold: 0.8,
        }
    }
}

/// Review and convergence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Consecutive zero-issue cycles required for convergence
    #[serde(rename = "convergence-cycles")]
    pub convergence_cycles: u32,

    /// Minimum severity that spawns a remediation task
    #[serde(rename = "remediation-min-severity")]
    pub remediation_min_severity: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            convergence_cycles: 2,
            remediation_min_severity: "medium".to_string(),
        }
    }
}

/// Git integration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Base directory for per-worker worktrees
    #[serde(rename = "worktree-dir")]
    pub worktree_dir: PathBuf,

    /// Prefix for worker branches
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from("/tmp/outcomed/worktrees"),
            branch_prefix: "outcomed".to_string(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite store path
    #[serde(rename = "store-path")]
    pub store_path: PathBuf,

    /// Root directory for per-outcome workspaces
    #[serde(rename = "workspace-root")]
    pub workspace_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("outcomed");
        Self {
            store_path: data_dir.join("outcomed.db"),
            workspace_root: data_dir.join("workspaces"),
        }
    }
}
