//! Capability - a reusable skill or tool scoped to an outcome
//!
//! Skills are markdown files with YAML frontmatter under the outcome's
//! `skills/` directory; tools are executable scripts under `tools/`. Tasks
//! reference capabilities by typed name: `skill:<name>` / `tool:<name>`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Whether a capability is a skill (knowledge) or a tool (executable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    Skill,
    Tool,
}

impl std::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skill => write!(f, "skill"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Frontmatter at the top of a skill markdown file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillFrontmatter {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Env-key names the skill needs at runtime
    #[serde(default)]
    pub requires: Vec<String>,
}

/// A capability need detected from approach text, not yet materialized
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityNeed {
    pub kind: CapabilityType,
    pub name: String,
}

impl CapabilityNeed {
    pub fn skill(name: impl Into<String>) -> Self {
        Self {
            kind: CapabilityType::Skill,
            name: name.into(),
        }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self {
            kind: CapabilityType::Tool,
            name: name.into(),
        }
    }

    /// Typed reference string, e.g. `skill:tavily-api`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    /// Parse a typed reference string
    pub fn parse(reference: &str) -> Option<Self> {
        let (kind, name) = reference.split_once(':')?;
        let kind = match kind {
            "skill" => CapabilityType::Skill,
            "tool" => CapabilityType::Tool,
            _ => return None,
        };
        Some(Self {
            kind,
            name: name.to_string(),
        })
    }
}

/// An existing capability artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub outcome_id: String,
    pub kind: CapabilityType,
    pub name: String,
    /// Path of the backing file within the workspace
    pub path: Option<String>,
    pub description: Option<String>,
    pub triggers: Vec<String>,
    pub requires: Vec<String>,
    /// Capability task that produced this artifact, when known
    pub source_task: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Capability {
    pub fn new(outcome_id: impl Into<String>, kind: CapabilityType, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = now_ms();
        Self {
            id: generate_id(&kind.to_string(), &name),
            outcome_id: outcome_id.into(),
            kind,
            name,
            path: None,
            description: None,
            triggers: Vec::new(),
            requires: Vec::new(),
            source_task: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

impl Record for Capability {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "capabilities"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome_id.clone()));
        fields.insert("kind".to_string(), IndexValue::String(self.kind.to_string()));
        fields.insert("name".to_string(), IndexValue::String(self.name.clone()));
        fields
    }
}
