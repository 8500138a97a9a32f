//! MergeRequest - a queued integration of a worker branch

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Merge queue state; conflicted merges never modify the base branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Queued,
    InProgress,
    Completed,
    Conflicted,
    Failed,
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One entry in an outcome's merge queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: String,
    pub outcome_id: String,
    pub worker_id: String,
    pub branch: String,
    pub status: MergeStatus,
    /// Conflicting paths when status is conflicted
    pub conflicts: Vec<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MergeRequest {
    pub fn new(
        outcome_id: impl Into<String>,
        worker_id: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        let branch = branch.into();
        let now = now_ms();
        Self {
            id: generate_id("merge", &branch),
            outcome_id: outcome_id.into(),
            worker_id: worker_id.into(),
            branch,
            status: MergeStatus::Queued,
            conflicts: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: MergeStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            MergeStatus::Completed | MergeStatus::Conflicted | MergeStatus::Failed
        )
    }
}

impl Record for MergeRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "merges"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome_id.clone()));
        fields.insert("worker".to_string(), IndexValue::String(self.worker_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}
