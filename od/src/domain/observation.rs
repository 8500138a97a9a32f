//! Observation - per-iteration evaluation of worker output
//!
//! Written once per iteration by the observer and never mutated. The
//! supervisor acts on it; the observer itself never touches tasks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Score band boundaries for quality derivation
pub const GOOD_THRESHOLD: u8 = 75;
pub const NEEDS_WORK_THRESHOLD: u8 = 40;

/// Quality band derived from the alignment score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    NeedsWork,
    Poor,
}

impl Quality {
    /// Band an alignment score: >=75 good, 40-74 needs work, <40 poor
    pub fn from_score(score: u8) -> Self {
        if score >= GOOD_THRESHOLD {
            Self::Good
        } else if score >= NEEDS_WORK_THRESHOLD {
            Self::NeedsWork
        } else {
            Self::Poor
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Good => write!(f, "good"),
            Self::NeedsWork => write!(f, "needs_work"),
            Self::Poor => write!(f, "poor"),
        }
    }
}

/// Category of a discovery surfaced during an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryType {
    /// Recurring structure worth reusing
    Pattern,
    /// A limit the work must respect
    Constraint,
    /// Useful context without direct action
    Insight,
    /// Something preventing progress
    Blocker,
}

/// A discovery made by the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    #[serde(rename = "type")]
    pub r#type: DiscoveryType,
    pub note: String,
}

/// One labeled answer option inside an ambiguity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbiguityOption {
    pub id: String,
    pub label: String,
}

/// A decision the worker cannot make alone
///
/// Always carries at least two options and a stable trigger tag; the
/// supervisor turns this into an escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ambiguity {
    pub question: String,
    pub options: Vec<AmbiguityOption>,
    pub trigger_type: String,
}

/// Per-iteration evaluation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub worker_id: String,
    pub outcome_id: String,
    pub task_id: String,
    pub iteration: u32,
    /// Bounded 0-100
    pub alignment_score: u8,
    pub quality: Quality,
    pub on_track: bool,
    /// Concrete completion signal found in the output
    pub task_complete: bool,
    pub discoveries: Vec<Discovery>,
    pub drift: Vec<String>,
    pub issues: Vec<String>,
    pub ambiguity: Option<Ambiguity>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Observation {
    pub fn new(
        worker_id: impl Into<String>,
        outcome_id: impl Into<String>,
        task_id: impl Into<String>,
        iteration: u32,
        alignment_score: u8,
    ) -> Self {
        let score = alignment_score.min(100);
        let now = now_ms();
        Self {
            id: generate_id("observation", ""),
            worker_id: worker_id.into(),
            outcome_id: outcome_id.into(),
            task_id: task_id.into(),
            iteration,
            alignment_score: score,
            quality: Quality::from_score(score),
            on_track: true,
            task_complete: false,
            discoveries: Vec::new(),
            drift: Vec::new(),
            issues: Vec::new(),
            ambiguity: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_ambiguity(&self) -> bool {
        self.ambiguity.is_some()
    }

    /// Whether any blocker-typed discovery is present
    pub fn has_blocker(&self) -> bool {
        self.discoveries.iter().any(|d| d.r#type == DiscoveryType::Blocker)
    }

    /// One-line compacted form used as prompt context
    pub fn summary(&self) -> String {
        let mut parts = vec![format!(
            "score={} quality={} on_track={}",
            self.alignment_score, self.quality, self.on_track
        )];
        if self.task_complete {
            parts.push("complete".to_string());
        }
        if !self.drift.is_empty() {
            parts.push(format!("drift: {}", self.drift.join("; ")));
        }
        if !self.issues.is_empty() {
            parts.push(format!("issues: {}", self.issues.join("; ")));
        }
        for d in &self.discoveries {
            parts.push(format!("{:?}: {}", d.r#type, d.note).to_lowercase());
        }
        parts.join(" | ")
    }
}

impl Record for Observation {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "observations"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("worker".to_string(), IndexValue::String(self.worker_id.clone()));
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome_id.clone()));
        fields.insert("task".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("iteration".to_string(), IndexValue::Int(self.iteration as i64));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_banding() {
        assert_eq!(Quality::from_score(100), Quality::Good);
        assert_eq!(Quality::from_score(75), Quality::Good);
        assert_eq!(Quality::from_score(74), Quality::NeedsWork);
        assert_eq!(Quality::from_score(40), Quality::NeedsWork);
        assert_eq!(Quality::from_score(39), Quality::Poor);
        assert_eq!(Quality::from_score(0), Quality::Poor);
    }

    #[test]
    fn test_score_clamped() {
        let obs = Observation::new("w", "o", "t", 1, 200);
        assert_eq!(obs.alignment_score, 100);
    }

    #[test]
    fn test_has_blocker() {
        let mut obs = Observation::new("w", "o", "t", 1, 80);
        assert!(!obs.has_blocker());
        obs.discoveries.push(Discovery {
            r#type: DiscoveryType::Blocker,
            note: "missing API key".to_string(),
        });
        assert!(obs.has_blocker());
    }

    #[test]
    fn test_summary_compacts() {
        let mut obs = Observation::new("w", "o", "t", 2, 55);
        obs.drift.push("switched storage format".to_string());
        let s = obs.summary();
        assert!(s.contains("score=55"));
        assert!(s.contains("needs_work"));
        assert!(s.contains("switched storage format"));
    }
}
