//! Task - a unit of work owned by an outcome

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::capability::CapabilityType;
use super::id::generate_id;

/// Default retry budget for new tasks
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Task workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Claimed by a worker, not yet running
    Claimed,
    /// Being executed by its claimant
    Running,
    /// Finished successfully
    Completed,
    /// Failed with no retries left
    Failed,
    /// Held back by an external condition
    Blocked,
    /// Awaiting decomposition into subtasks
    DecompositionPending,
    /// Decomposition underway
    DecompositionInProgress,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::DecompositionPending => "decomposition_pending",
            Self::DecompositionInProgress => "decomposition_in_progress",
        };
        write!(f, "{}", s)
    }
}

/// Which stage of the outcome lifecycle a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Builds a prerequisite skill or tool
    Capability,
    /// Drives the outcome itself
    #[default]
    Execution,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capability => write!(f, "capability"),
            Self::Execution => write!(f, "execution"),
        }
    }
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Owning outcome; dependencies never cross this boundary
    pub outcome_id: String,
    pub title: String,
    pub description: String,
    /// What this task must achieve
    pub task_intent: String,
    /// How to achieve it; escalation answers append here
    pub task_approach: String,
    /// Lower is more urgent
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub phase: TaskPhase,
    /// Set when phase is capability
    pub capability_type: Option<CapabilityType>,
    /// Task ids within the same outcome that must complete first
    pub depends_on: Vec<String>,
    /// Typed references like `skill:tavily-api` that must exist before claim
    pub required_capabilities: Vec<String>,
    /// Typed reference this task builds, for capability-phase tasks
    pub provides: Option<String>,
    pub status: TaskStatus,
    /// Worker currently holding this task
    pub claimed_by: Option<String>,
    /// True when created by a review cycle
    pub from_review: bool,
    /// Creation cycle index for review-generated tasks
    pub review_cycle: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(outcome_id: impl Into<String>, title: impl Into<String>) -> Self {
        let title = title.into();
        let now = now_ms();
        Self {
            id: generate_id("task", &title),
            outcome_id: outcome_id.into(),
            title,
            description: String::new(),
            task_intent: String::new(),
            task_approach: String::new(),
            priority: 0,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            phase: TaskPhase::Execution,
            capability_type: None,
            depends_on: Vec::new(),
            required_capabilities: Vec::new(),
            provides: None,
            status: TaskStatus::Pending,
            claimed_by: None,
            from_review: false,
            review_cycle: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Construct a capability-phase task
    pub fn capability(
        outcome_id: impl Into<String>,
        title: impl Into<String>,
        capability_type: CapabilityType,
    ) -> Self {
        let mut task = Self::new(outcome_id, title);
        task.phase = TaskPhase::Capability;
        task.capability_type = Some(capability_type);
        task
    }

    pub fn with_provides(mut self, reference: impl Into<String>) -> Self {
        self.provides = Some(reference.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.task_intent = intent.into();
        self
    }

    pub fn with_approach(mut self, approach: impl Into<String>) -> Self {
        self.task_approach = approach.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_required_capabilities(mut self, refs: Vec<String>) -> Self {
        self.required_capabilities = refs;
        self
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Append escalation-resolution context to the approach
    pub fn append_approach_context(&mut self, context: &str) {
        if !self.task_approach.is_empty() {
            self.task_approach.push_str("\n\n");
        }
        self.task_approach.push_str(context);
        self.updated_at = now_ms();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether the task is live work from the outcome's point of view
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Pending | TaskStatus::Claimed | TaskStatus::Running
        )
    }

    pub fn retries_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("phase".to_string(), IndexValue::String(self.phase.to_string()));
        fields.insert("priority".to_string(), IndexValue::Int(self.priority));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = Task::new("outcome-1", "Implement add/delete");
        assert!(task.id.contains("-task-"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.phase, TaskPhase::Execution);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(task.capability_type.is_none());
    }

    #[test]
    fn test_capability_task() {
        let task = Task::capability("outcome-1", "Build tavily-api skill", CapabilityType::Skill);
        assert_eq!(task.phase, TaskPhase::Capability);
        assert_eq!(task.capability_type, Some(CapabilityType::Skill));
    }

    #[test]
    fn test_append_approach_context() {
        let mut task = Task::new("outcome-1", "Implement add/delete").with_approach("Start simple");
        task.append_approach_context("User decision: yes, file-backed");
        assert!(task.task_approach.contains("Start simple"));
        assert!(task.task_approach.contains("User decision: yes, file-backed"));
    }

    #[test]
    fn test_is_open() {
        let mut task = Task::new("outcome-1", "t");
        assert!(task.is_open());
        task.set_status(TaskStatus::Completed);
        assert!(!task.is_open());
        assert!(task.is_terminal());
        task.set_status(TaskStatus::DecompositionPending);
        assert!(!task.is_open());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_retries_left() {
        let mut task = Task::new("outcome-1", "t");
        task.max_attempts = 2;
        assert!(task.retries_left());
        task.attempts = 2;
        assert!(!task.retries_left());
    }
}
