//! AnalysisJob - retrospective clustering of past escalations

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Background job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A group of escalations sharing a trigger type and root cause
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationCluster {
    pub trigger_type: String,
    pub root_cause: String,
    pub escalation_ids: Vec<String>,
}

/// A task sketch inside an improvement proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedTask {
    pub title: String,
    pub description: String,
}

/// An actionable proposal distilled from a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementProposal {
    pub id: String,
    pub root_cause: String,
    pub problem_summary: String,
    pub proposed_tasks: Vec<ProposedTask>,
    pub intent_sketch: String,
    pub approach_sketch: String,
    pub source_escalations: Vec<String>,
}

/// A retrospective analysis run; at most one running per outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub outcome_id: String,
    pub status: JobStatus,
    pub progress: String,
    pub clusters: Vec<EscalationCluster>,
    pub proposals: Vec<ImprovementProposal>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AnalysisJob {
    pub fn new(outcome_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("job", "retro"),
            outcome_id: outcome_id.into(),
            status: JobStatus::Pending,
            progress: String::new(),
            clusters: Vec::new(),
            proposals: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    pub fn set_progress(&mut self, progress: impl Into<String>) {
        self.progress = progress.into();
        self.updated_at = now_ms();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

impl Record for AnalysisJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "analysis_jobs"
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
    fn test_job_lifecycle() {
        let mut job = AnalysisJob::new("outcome-1");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_terminal());

        job.set_status(JobStatus::Running);
        job.set_progress("clustering 12 escalations");
        assert_eq!(job.progress, "clustering 12 escalations");

        job.set_status(JobStatus::Completed);
        assert!(job.is_terminal());
    }
}
