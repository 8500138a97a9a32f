//! Capability planner - from approach text to capability tasks
//!
//! Extracts skill/tool needs from approach and intent text, dedupes them
//! against what the outcome already has, materializes capability tasks,
//! and manages the outcome's capability gate.

use std::collections::HashSet;

use regex::Regex;
use tracing::{debug, info};

use crate::domain::{
    Capability, CapabilityNeed, CapabilityReady, Task, TaskPhase, TaskStatus, slugify,
};
use crate::error::EngineResult;
use crate::state::StateManager;

/// Capability tasks sort ahead of all execution work
pub const CAPABILITY_PRIORITY_BASE: i64 = -100;

/// Extract capability needs from free text
///
/// Three sources, in order:
/// - explicit typed references: `skill:name`, `tool:name`
/// - named APIs: "Tavily API" becomes `skill:tavily-api`
/// - named tools: "the csv-export tool/CLI/script" becomes `tool:csv-export`
pub fn extract_needs(text: &str) -> Vec<CapabilityNeed> {
    let explicit_re = Regex::new(r"\b(skill|tool):([A-Za-z0-9][A-Za-z0-9_-]*)\b").expect("explicit regex");
    let api_re = Regex::new(r"\b([A-Z][A-Za-z0-9]+)\s+API\b").expect("api regex");
    let tool_re =
        Regex::new(r"(?i)\b([a-z][a-z0-9-]{2,})\s+(?:tool|cli|script)\b").expect("tool regex");

    let mut needs = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |need: CapabilityNeed| {
        if seen.insert(need.reference()) {
            needs.push(need);
        }
    };

    for cap in explicit_re.captures_iter(text) {
        let name = slugify(&cap[2]);
        match &cap[1] {
            "skill" => push(CapabilityNeed::skill(name)),
            _ => push(CapabilityNeed::tool(name)),
        }
    }

    for cap in api_re.captures_iter(text) {
        // "The API" and similar sentence-lead noise carries no name
        let word = &cap[1];
        if matches!(word, "The" | "This" | "That" | "An" | "A") {
            continue;
        }
        push(CapabilityNeed::skill(format!("{}-api", slugify(word))));
    }

    for cap in tool_re.captures_iter(text) {
        let word = slugify(&cap[1]);
        if matches!(word.as_str(), "the" | "this" | "that" | "any" | "each" | "existing") {
            continue;
        }
        push(CapabilityNeed::tool(word));
    }

    needs
}

/// Plans and gates outcome capabilities
#[derive(Clone)]
pub struct CapabilityPlanner {
    state: StateManager,
}

impl CapabilityPlanner {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Extract needs from approach and intent, deduped against existing
    /// capabilities and capability tasks of the outcome
    pub async fn analyze(
        &self,
        outcome_id: &str,
        approach: &str,
        intent_summary: &str,
    ) -> EngineResult<Vec<CapabilityNeed>> {
        let existing = self.state.list_capabilities(outcome_id).await?;
        let tasks = self.state.list_tasks(outcome_id, None).await?;
        Ok(dedupe_needs(
            extract_needs(&format!("{}\n{}", approach, intent_summary)),
            &existing,
            &tasks,
        ))
    }

    /// Needs introduced by an approach change, beyond everything known
    pub async fn detect_new(&self, outcome_id: &str, approach: &str) -> EngineResult<Vec<CapabilityNeed>> {
        self.analyze(outcome_id, approach, "").await
    }

    /// Materialize one capability task per need
    ///
    /// Parallel needs share no dependencies; otherwise they form a linear
    /// chain in extraction order.
    pub async fn create_tasks(
        &self,
        outcome_id: &str,
        needs: &[CapabilityNeed],
        parallel: bool,
    ) -> EngineResult<Vec<String>> {
        if needs.is_empty() {
            return Ok(Vec::new());
        }

        let mut tasks: Vec<Task> = Vec::with_capacity(needs.len());
        for (i, need) in needs.iter().enumerate() {
            let mut task = Task::capability(
                outcome_id,
                format!("Build {}: {}", need.kind, need.name),
                need.kind,
            )
            .with_intent(format!(
                "Create the {} `{}` under the outcome workspace so later tasks can use it",
                need.kind, need.name
            ))
            .with_approach(match need.kind {
                crate::domain::CapabilityType::Skill => format!(
                    "Write skills/{}.md with frontmatter (name, triggers, requires) and usage notes.",
                    need.name
                ),
                crate::domain::CapabilityType::Tool => format!(
                    "Write an executable script tools/{} with a usage header.",
                    need.name
                ),
            })
            .with_priority(CAPABILITY_PRIORITY_BASE + i as i64)
            .with_provides(need.reference());

            if !parallel && i > 0 {
                task.depends_on = vec![tasks[i - 1].id.clone()];
            }
            tasks.push(task);
        }

        let ids = self.state.create_tasks(tasks).await?;
        info!(outcome_id, count = ids.len(), "Capability tasks created");
        Ok(ids)
    }

    /// Bring the outcome's capability gate up to date
    ///
    /// Runs at worker start and whenever a gate reset is observed:
    /// detects new needs, materializes tasks for them, and settles the
    /// gate (ready when nothing is missing, building otherwise).
    pub async fn ensure_gate(&self, outcome_id: &str) -> EngineResult<CapabilityReady> {
        let outcome = self.state.get_outcome_required(outcome_id).await?;
        if outcome.capability_ready == CapabilityReady::Ready {
            return Ok(CapabilityReady::Ready);
        }

        let approach = outcome.approach_text().unwrap_or("").to_string();
        let needs = self
            .analyze(outcome_id, &approach, &outcome.intent.summary)
            .await?;

        if !needs.is_empty() {
            self.create_tasks(outcome_id, &needs, outcome.parallel).await?;
        }

        let tasks = self.state.list_tasks(outcome_id, None).await?;
        let unfinished = tasks
            .iter()
            .any(|t| t.phase == TaskPhase::Capability && t.status != TaskStatus::Completed);

        let new_state = if unfinished {
            CapabilityReady::Building
        } else {
            CapabilityReady::Ready
        };

        let mut outcome = self.state.get_outcome_required(outcome_id).await?;
        if outcome.capability_ready != new_state {
            outcome.set_capability_ready(new_state);
            self.state.update_outcome(outcome).await?;
            debug!(outcome_id, state = %new_state, "Capability gate updated");
        }
        Ok(new_state)
    }
}

/// Drop needs that already exist or are already being built
pub fn dedupe_needs(
    needs: Vec<CapabilityNeed>,
    existing: &[Capability],
    tasks: &[Task],
) -> Vec<CapabilityNeed> {
    let present: HashSet<String> = existing.iter().map(|c| c.reference()).collect();
    let planned: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.phase == TaskPhase::Capability)
        .filter_map(|t| t.provides.as_deref())
        .collect();

    needs
        .into_iter()
        .filter(|n| {
            let r = n.reference();
            !present.contains(&r) && !planned.contains(r.as_str())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CapabilityType;

    #[test]
    fn test_extract_api_mention() {
        let needs = extract_needs("Uses Tavily API for search.");
        assert_eq!(needs.len(), 1);
        assert_eq!(needs[0].reference(), "skill:tavily-api");
    }

    #[test]
    fn test_extract_no_needs_from_plain_text() {
        let needs = extract_needs("Use simple file-backed storage.");
        assert!(needs.is_empty());
    }

    #[test]
    fn test_extract_explicit_references() {
        let needs = extract_needs("Requires skill:github-search and tool:csv-export to run.");
        assert_eq!(needs.len(), 2);
        assert_eq!(needs[0].kind, CapabilityType::Skill);
        assert_eq!(needs[1].reference(), "tool:csv-export");
    }

    #[test]
    fn test_extract_tool_mention() {
        let needs = extract_needs("Run the scraper tool nightly.");
        assert_eq!(needs.len(), 1);
        assert_eq!(needs[0].reference(), "tool:scraper");
    }

    #[test]
    fn test_extract_dedupes_repeats() {
        let needs = extract_needs("Tavily API here, Tavily API there, and skill:tavily-api again.");
        assert_eq!(needs.len(), 1);
    }

    #[test]
    fn test_sentence_lead_api_noise_skipped() {
        let needs = extract_needs("The API surface stays stable.");
        assert!(needs.is_empty());
    }

    #[test]
    fn test_dedupe_against_existing() {
        let cap = Capability::new("o", CapabilityType::Skill, "tavily-api");
        let planned = Task::capability("o", "build", CapabilityType::Tool).with_provides("tool:csv-export");
        let needs = vec![
            CapabilityNeed::skill("tavily-api"),
            CapabilityNeed::tool("csv-export"),
            CapabilityNeed::skill("fresh"),
        ];
        let remaining = dedupe_needs(needs, &[cap], &[planned]);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].reference(), "skill:fresh");
    }

    #[tokio::test]
    async fn test_create_tasks_chained_vs_parallel() {
        let state = StateManager::spawn_in_memory().unwrap();
        let outcome_id = state
            .create_outcome(crate::domain::Outcome::new("caps"))
            .await
            .unwrap();
        let planner = CapabilityPlanner::new(state.clone());

        let needs = vec![CapabilityNeed::skill("a-api"), CapabilityNeed::skill("b-api")];
        let ids = planner.create_tasks(&outcome_id, &needs, false).await.unwrap();
        assert_eq!(ids.len(), 2);

        let second = state.get_task_required(&ids[1]).await.unwrap();
        assert_eq!(second.depends_on, vec![ids[0].clone()]);
        assert_eq!(second.phase, TaskPhase::Capability);
        assert_eq!(second.provides.as_deref(), Some("skill:b-api"));

        // Parallel tasks carry no dependencies
        let outcome_id2 = state
            .create_outcome(crate::domain::Outcome::new("caps2"))
            .await
            .unwrap();
        let ids = planner.create_tasks(&outcome_id2, &needs, true).await.unwrap();
        let second = state.get_task_required(&ids[1]).await.unwrap();
        assert!(second.depends_on.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_gate_no_needs_flips_ready() {
        let state = StateManager::spawn_in_memory().unwrap();
        let mut outcome = crate::domain::Outcome::new("plain");
        outcome.append_design_doc("Use simple file-backed storage.");
        let outcome_id = state.create_outcome(outcome).await.unwrap();

        let planner = CapabilityPlanner::new(state.clone());
        let gate = planner.ensure_gate(&outcome_id).await.unwrap();
        assert_eq!(gate, CapabilityReady::Ready);
    }

    #[tokio::test]
    async fn test_ensure_gate_with_needs_builds() {
        let state = StateManager::spawn_in_memory().unwrap();
        let mut outcome = crate::domain::Outcome::new("searchy");
        outcome.append_design_doc("Uses Tavily API for search.");
        let outcome_id = state.create_outcome(outcome).await.unwrap();

        let planner = CapabilityPlanner::new(state.clone());
        let gate = planner.ensure_gate(&outcome_id).await.unwrap();
        assert_eq!(gate, CapabilityReady::Building);

        let tasks = state.list_tasks(&outcome_id, None).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].phase, TaskPhase::Capability);
        assert_eq!(tasks[0].provides.as_deref(), Some("skill:tavily-api"));

        // Re-running does not duplicate the capability task
        planner.ensure_gate(&outcome_id).await.unwrap();
        assert_eq!(state.list_tasks(&outcome_id, None).await.unwrap().len(), 1);
    }
}
