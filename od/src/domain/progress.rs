//! ProgressEntry - append-only per-worker iteration log
//!
//! Entries are keyed by (worker, seq) where seq is assigned by the state
//! actor and strictly increases per worker. Entries are never mutated
//! after write; retries and escalations leave history intact.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use outcomestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// One line of worker history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub id: String,
    pub worker_id: String,
    pub outcome_id: String,
    /// Monotonic per worker, assigned on append
    pub seq: u64,
    pub iteration: u32,
    pub task_id: Option<String>,
    /// Short human-readable content
    pub content: String,
    /// Full LLM output when this entry records an invocation
    pub raw_output: Option<String>,
    /// Observation written for this iteration, if any
    pub observation_id: Option<String>,
    /// True once folded into a compacted summary
    pub compacted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProgressEntry {
    pub fn new(
        worker_id: impl Into<String>,
        outcome_id: impl Into<String>,
        iteration: u32,
        content: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("progress", ""),
            worker_id: worker_id.into(),
            outcome_id: outcome_id.into(),
            seq: 0,
            iteration,
            task_id: None,
            content: content.into(),
            raw_output: None,
            observation_id: None,
            compacted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_output = Some(raw.into());
        self
    }

    pub fn with_observation(mut self, observation_id: impl Into<String>) -> Self {
        self.observation_id = Some(observation_id.into());
        self
    }
}

impl Record for ProgressEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "progress"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("worker".to_string(), IndexValue::String(self.worker_id.clone()));
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome_id.clone()));
        fields.insert("seq".to_string(), IndexValue::Int(self.seq as i64));
        fields
    }
}

/// Render the most recent entries as compact prompt context
///
/// Keeps the N most recent entries, truncating each from the front so the
/// tail (usually the interesting part) survives. Raw output is never
/// included, only the compacted content line.
pub fn render_recent(entries: &[ProgressEntry], max_entries: usize, max_chars: usize) -> String {
    let start = entries.len().saturating_sub(max_entries);
    let mut out = String::new();
    for entry in &entries[start..] {
        let chars: Vec<char> = entry.content.chars().collect();
        let content = if chars.len() > max_chars {
            let tail: String = chars[chars.len() - max_chars..].iter().collect();
            format!("...{}", tail)
        } else {
            entry.content.clone()
        };
        out.push_str(&format!("- iteration {}: {}\n", entry.iteration, content));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_entry_new() {
        let entry = ProgressEntry::new("worker-1", "outcome-1", 3, "claiming next task")
            .with_task("task-1");
        assert_eq!(entry.iteration, 3);
        assert_eq!(entry.task_id.as_deref(), Some("task-1"));
        assert!(!entry.compacted);
        assert!(entry.raw_output.is_none());
    }

    #[test]
    fn test_render_recent_caps_entries() {
        let entries: Vec<ProgressEntry> = (1..=10)
            .map(|i| ProgressEntry::new("w", "o", i, format!("step {}", i)))
            .collect();
        let rendered = render_recent(&entries, 3, 200);
        assert!(!rendered.contains("step 7"));
        assert!(rendered.contains("step 8"));
        assert!(rendered.contains("step 10"));
    }

    #[test]
    fn test_render_recent_truncates_front() {
        let long = "x".repeat(100) + "tail-marker";
        let entries = vec![ProgressEntry::new("w", "o", 1, long)];
        let rendered = render_recent(&entries, 5, 20);
        assert!(rendered.contains("tail-marker"));
        assert!(rendered.contains("..."));
        assert!(rendered.len() < 60);
    }
}
