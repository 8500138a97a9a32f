//! Outcome - a user-declared goal
//!
//! Outcomes form a forest via `parent`; only leaf outcomes host workers.
//! An outcome carries structured intent (the "what"), a versioned design
//! doc (the "how"), and the capability gate that holds execution tasks
//! back until prerequisite skills and tools exist.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Outcome lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Being actively worked
    #[default]
    Active,
    /// Parked, not claimable
    Dormant,
    /// Converged with all success criteria passing
    Achieved,
    /// Closed out
    Archived,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Dormant => write!(f, "dormant"),
            Self::Achieved => write!(f, "achieved"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

/// Capability gate state
///
/// Execution-phase tasks are claimable only when this is `Ready`. Any
/// change to intent summary, success criteria, or approach text resets
/// the gate to `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityReady {
    #[default]
    NotStarted,
    Building,
    Ready,
}

impl std::fmt::Display for CapabilityReady {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Building => write!(f, "building"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// How workers share the outcome's working directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GitMode {
    /// No git integration; plain shared directory
    #[default]
    None,
    /// All workers write the same checkout
    Shared,
    /// Branch-per-worker isolation with a merge queue
    Worktree,
}

/// Status of a single intent item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Done,
}

/// One deliverable within an outcome's intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    pub status: ItemStatus,
}

impl IntentItem {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: generate_id("item", &title),
            title,
            description: description.into(),
            acceptance_criteria: Vec::new(),
            priority: 0,
            status: ItemStatus::Pending,
        }
    }
}

/// Structured "what" of an outcome
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Intent {
    /// One-paragraph summary of the goal
    pub summary: String,
    /// Deliverables with acceptance criteria
    pub items: Vec<IntentItem>,
    /// Outcome-level success criteria, evaluated by review cycles
    pub success_criteria: Vec<String>,
}

/// Structured "how" of an outcome; versions only grow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignDoc {
    pub approach: String,
    pub version: u32,
}

/// Review convergence tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Convergence {
    /// Consecutive full review cycles with zero issues
    pub consecutive_zero_issues: u32,
    /// Index of the last cycle folded into this state
    pub last_cycle_index: u32,
}

/// A user-declared goal; root of the task/worker graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    pub name: String,
    /// Parent outcome, forming a forest
    pub parent: Option<String>,
    /// Free-text context supplied at creation
    pub brief: String,
    pub intent: Intent,
    /// Latest design doc; None until an approach is set
    pub design_doc: Option<DesignDoc>,
    pub status: OutcomeStatus,
    pub capability_ready: CapabilityReady,
    /// Workspace directory for this outcome
    pub work_dir: Option<String>,
    /// Base branch merges target in worktree mode
    pub work_branch: Option<String>,
    pub git_mode: GitMode,
    /// Allow more than one running worker
    pub parallel: bool,
    pub convergence: Convergence,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Outcome {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let now = now_ms();
        Self {
            id: generate_id("outcome", &name),
            name,
            parent: None,
            brief: String::new(),
            intent: Intent::default(),
            design_doc: None,
            status: OutcomeStatus::Active,
            capability_ready: CapabilityReady::NotStarted,
            work_dir: None,
            work_branch: None,
            git_mode: GitMode::None,
            parallel: false,
            convergence: Convergence::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = brief.into();
        self
    }

    pub fn with_git_mode(mut self, mode: GitMode) -> Self {
        self.git_mode = mode;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    pub fn set_status(&mut self, status: OutcomeStatus) {
        self.status = status;
        self.touch();
    }

    /// Replace the structured intent
    ///
    /// Resets the capability gate when the summary or success criteria
    /// changed, so capability needs are re-detected on next worker start.
    pub fn set_intent(&mut self, intent: Intent) {
        let gate_inputs_changed = self.intent.summary != intent.summary
            || self.intent.success_criteria != intent.success_criteria;
        self.intent = intent;
        if gate_inputs_changed {
            self.capability_ready = CapabilityReady::NotStarted;
        }
        self.touch();
    }

    /// Append a new design-doc version
    ///
    /// Resets the capability gate when the approach text changed.
    pub fn append_design_doc(&mut self, approach: impl Into<String>) {
        let approach = approach.into();
        let changed = self.approach_text() != Some(approach.as_str());
        let version = self.design_doc.as_ref().map(|d| d.version + 1).unwrap_or(1);
        self.design_doc = Some(DesignDoc { approach, version });
        if changed {
            self.capability_ready = CapabilityReady::NotStarted;
        }
        self.touch();
    }

    pub fn set_capability_ready(&mut self, state: CapabilityReady) {
        self.capability_ready = state;
        self.touch();
    }

    /// Current approach text, if any design doc exists
    pub fn approach_text(&self) -> Option<&str> {
        self.design_doc.as_ref().map(|d| d.approach.as_str())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, OutcomeStatus::Achieved | OutcomeStatus::Archived)
    }
}

impl Record for Outcome {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "outcomes"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert(
            "capability_ready".to_string(),
            IndexValue::String(self.capability_ready.to_string()),
        );
        if let Some(parent) = &self.parent {
            fields.insert("parent".to_string(), IndexValue::String(parent.clone()));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_new() {
        let outcome = Outcome::new("Build TODO");
        assert!(outcome.id.contains("-outcome-"));
        assert_eq!(outcome.status, OutcomeStatus::Active);
        assert_eq!(outcome.capability_ready, CapabilityReady::NotStarted);
        assert!(outcome.design_doc.is_none());
        assert!(!outcome.parallel);
    }

    #[test]
    fn test_intent_change_resets_gate() {
        let mut outcome = Outcome::new("Build TODO");
        outcome.set_capability_ready(CapabilityReady::Ready);

        let mut intent = Intent::default();
        intent.summary = "A single-user todo app".to_string();
        outcome.set_intent(intent.clone());
        assert_eq!(outcome.capability_ready, CapabilityReady::NotStarted);

        // Unchanged gate inputs do not reset
        outcome.set_capability_ready(CapabilityReady::Ready);
        outcome.set_intent(intent);
        assert_eq!(outcome.capability_ready, CapabilityReady::Ready);
    }

    #[test]
    fn test_design_doc_versioning() {
        let mut outcome = Outcome::new("Build TODO");
        outcome.append_design_doc("Use file-backed storage");
        assert_eq!(outcome.design_doc.as_ref().unwrap().version, 1);

        outcome.set_capability_ready(CapabilityReady::Ready);
        outcome.append_design_doc("Use SQLite storage");
        assert_eq!(outcome.design_doc.as_ref().unwrap().version, 2);
        assert_eq!(outcome.capability_ready, CapabilityReady::NotStarted);
    }

    #[test]
    fn test_same_approach_keeps_gate() {
        let mut outcome = Outcome::new("Build TODO");
        outcome.append_design_doc("Use file-backed storage");
        outcome.set_capability_ready(CapabilityReady::Ready);
        outcome.append_design_doc("Use file-backed storage");
        assert_eq!(outcome.capability_ready, CapabilityReady::Ready);
        // Version still advances
        assert_eq!(outcome.design_doc.as_ref().unwrap().version, 2);
    }

    #[test]
    fn test_indexed_fields() {
        let outcome = Outcome::new("Build TODO").with_parent("parent-id");
        let fields = outcome.indexed_fields();
        assert_eq!(fields.get("status"), Some(&IndexValue::String("active".to_string())));
        assert_eq!(fields.get("parent"), Some(&IndexValue::String("parent-id".to_string())));
    }
}
