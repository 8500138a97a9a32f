//! ReviewCycle - an audit of an outcome against its success criteria

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Severity of a review issue; medium and above spawn remediation tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A problem found during review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: IssueSeverity,
    pub description: String,
}

/// Pass/fail verdict for one acceptance or success criterion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    /// What was evaluated (item title or criterion text)
    pub subject: String,
    pub passed: bool,
    pub evidence: String,
}

/// One review run over an outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub id: String,
    pub outcome_id: String,
    /// Monotonic per outcome
    pub cycle_index: u32,
    /// True when the run skipped issue hunting
    pub criteria_only: bool,
    /// Per intent-item acceptance criteria results
    pub item_results: Vec<CriterionResult>,
    /// Outcome-level success criteria results
    pub criterion_results: Vec<CriterionResult>,
    pub issues: Vec<ReviewIssue>,
    pub issues_found: u32,
    /// Remediation tasks created by this cycle
    pub remediation_tasks: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ReviewCycle {
    pub fn new(outcome_id: impl Into<String>, cycle_index: u32, criteria_only: bool) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("cycle", &format!("review {}", cycle_index)),
            outcome_id: outcome_id.into(),
            cycle_index,
            criteria_only,
            item_results: Vec::new(),
            criterion_results: Vec::new(),
            issues: Vec::new(),
            issues_found: 0,
            remediation_tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether every evaluated criterion passed
    pub fn all_criteria_pass(&self) -> bool {
        self.item_results.iter().all(|r| r.passed) && self.criterion_results.iter().all(|r| r.passed)
    }
}

impl Record for ReviewCycle {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "review_cycles"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome_id.clone()));
        fields.insert("cycle_index".to_string(), IndexValue::Int(self.cycle_index as i64));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(IssueSeverity::Low < IssueSeverity::Medium);
        assert!(IssueSeverity::Medium < IssueSeverity::High);
        assert!(IssueSeverity::Medium >= IssueSeverity::Medium);
    }

    #[test]
    fn test_all_criteria_pass() {
        let mut cycle = ReviewCycle::new("outcome-1", 1, false);
        assert!(cycle.all_criteria_pass());

        cycle.criterion_results.push(CriterionResult {
            subject: "can add and delete items".to_string(),
            passed: true,
            evidence: "task completed".to_string(),
        });
        assert!(cycle.all_criteria_pass());

        cycle.item_results.push(CriterionResult {
            subject: "items persist".to_string(),
            passed: false,
            evidence: "no evidence found".to_string(),
        });
        assert!(!cycle.all_criteria_pass());
    }
}
