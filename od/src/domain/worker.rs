//! Worker - a long-lived supervisor driving tasks to completion

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// No eligible work; supervisor exited cleanly
    #[default]
    Idle,
    /// Supervisor loop active
    Running,
    /// Blocked on a pending escalation
    Waiting,
    /// Suspended; may be resumed
    Paused,
    /// All work done and outcome converged
    Completed,
    /// Unrecoverable failure
    Failed,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A worker record; one Ralph loop supervisor per running worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub outcome_id: String,
    pub name: String,
    pub status: WorkerStatus,
    /// Task currently claimed/running, if any
    pub current_task: Option<String>,
    /// Strictly monotonic per worker
    pub iteration: u32,
    /// Accumulated LLM spend
    pub cost_usd: f64,
    /// Human-readable rollup of recent progress
    pub progress_summary: String,
    /// Dedicated branch in worktree mode
    pub branch: Option<String>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    /// Most recent observation id
    pub last_observation: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Worker {
    pub fn new(outcome_id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = now_ms();
        Self {
            id: generate_id("worker", &name),
            outcome_id: outcome_id.into(),
            name,
            status: WorkerStatus::Idle,
            current_task: None,
            iteration: 0,
            cost_usd: 0.0,
            progress_summary: String::new(),
            branch: None,
            started_at: None,
            stopped_at: None,
            last_observation: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: WorkerStatus) {
        self.status = status;
        match status {
            WorkerStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now_ms());
                }
            }
            WorkerStatus::Completed | WorkerStatus::Failed | WorkerStatus::Paused | WorkerStatus::Idle => {
                self.stopped_at = Some(now_ms());
            }
            WorkerStatus::Waiting => {}
        }
        self.updated_at = now_ms();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, WorkerStatus::Completed | WorkerStatus::Failed)
    }

    /// Whether the supervisor task for this worker is live
    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkerStatus::Running | WorkerStatus::Waiting)
    }
}

impl Record for Worker {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "workers"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_new() {
        let worker = Worker::new("outcome-1", "worker-a");
        assert!(worker.id.contains("-worker-"));
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.iteration, 0);
        assert!(worker.started_at.is_none());
    }

    #[test]
    fn test_status_timestamps() {
        let mut worker = Worker::new("outcome-1", "worker-a");
        worker.set_status(WorkerStatus::Running);
        assert!(worker.started_at.is_some());
        assert!(worker.is_active());

        worker.set_status(WorkerStatus::Paused);
        assert!(worker.stopped_at.is_some());
        assert!(!worker.is_active());
        assert!(!worker.is_terminal());

        worker.set_status(WorkerStatus::Completed);
        assert!(worker.is_terminal());
    }
}
