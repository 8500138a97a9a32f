//! Escalation - a structured question raised to the user
//!
//! A pending escalation blocks every task it references from being
//! claimed until the user answers or dismisses it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Reserved option id that routes the answer to task decomposition
pub const BREAK_INTO_SUBTASKS: &str = "break_into_subtasks";

/// Escalation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    #[default]
    Pending,
    Answered,
    Dismissed,
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Answered => write!(f, "answered"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// A labeled answer option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationOption {
    pub id: String,
    pub label: String,
}

impl EscalationOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// A question awaiting a user decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub outcome_id: String,
    /// Short stable tag, e.g. `unclear_requirement`
    pub trigger_type: String,
    pub question: String,
    pub options: Vec<EscalationOption>,
    /// Tasks blocked from claiming while this is pending
    pub affected_tasks: Vec<String>,
    pub status: EscalationStatus,
    pub selected_option: Option<String>,
    pub user_context: Option<String>,
    /// Confidence when resolved automatically
    pub resolution_confidence: Option<f64>,
    /// Set when a retrospective proposal consumed this escalation
    pub incorporated: bool,
    pub resolved_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Escalation {
    pub fn new(
        outcome_id: impl Into<String>,
        trigger_type: impl Into<String>,
        question: impl Into<String>,
        options: Vec<EscalationOption>,
        affected_tasks: Vec<String>,
    ) -> Self {
        let question = question.into();
        let now = now_ms();
        Self {
            id: generate_id("escalation", &question),
            outcome_id: outcome_id.into(),
            trigger_type: trigger_type.into(),
            question,
            options,
            affected_tasks,
            status: EscalationStatus::Pending,
            selected_option: None,
            user_context: None,
            resolution_confidence: None,
            incorporated: false,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EscalationStatus::Pending
    }

    /// Whether the option set includes the decomposition route
    pub fn offers_decomposition(&self) -> bool {
        self.options.iter().any(|o| o.id == BREAK_INTO_SUBTASKS)
    }

    pub fn option(&self, id: &str) -> Option<&EscalationOption> {
        self.options.iter().find(|o| o.id == id)
    }

    pub fn resolve(&mut self, status: EscalationStatus, selected: Option<String>) {
        self.status = status;
        self.selected_option = selected;
        self.resolved_at = Some(now_ms());
        self.updated_at = now_ms();
    }
}

impl Record for Escalation {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "escalations"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert(
            "trigger_type".to_string(),
            IndexValue::String(self.trigger_type.clone()),
        );
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Escalation {
        Escalation::new(
            "outcome-1",
            "unclear_requirement",
            "Should items persist across restarts?",
            vec![
                EscalationOption::new("opt-1", "yes, file-backed"),
                EscalationOption::new("opt-2", "no, memory only"),
                EscalationOption::new(BREAK_INTO_SUBTASKS, "break into subtasks"),
            ],
            vec!["task-1".to_string()],
        )
    }

    #[test]
    fn test_escalation_new() {
        let esc = sample();
        assert!(esc.id.contains("-escalation-"));
        assert!(esc.is_pending());
        assert!(esc.offers_decomposition());
        assert_eq!(esc.affected_tasks, vec!["task-1".to_string()]);
    }

    #[test]
    fn test_resolve() {
        let mut esc = sample();
        esc.resolve(EscalationStatus::Answered, Some("opt-1".to_string()));
        assert!(!esc.is_pending());
        assert_eq!(esc.selected_option.as_deref(), Some("opt-1"));
        assert!(esc.resolved_at.is_some());
    }

    #[test]
    fn test_option_lookup() {
        let esc = sample();
        assert!(esc.option("opt-2").is_some());
        assert!(esc.option("opt-9").is_none());
    }
}
