//! HOMЯ observer - deterministic output evaluation
//!
//! Parses the marker lines the iteration prompt asks for (TASK COMPLETE,
//! BLOCKED, DECISION NEEDED, DISCOVERY/CONSTRAINT/INSIGHT) and applies
//! drift and issue heuristics against the task's stated approach. All of
//! it is plain text analysis; identical input yields identical output.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::config::ObserverConfig;
use crate::domain::{
    Ambiguity, AmbiguityOption, BREAK_INTO_SUBTASKS, Discovery, DiscoveryType, Observation,
    slugify,
};

use super::{ObservationContext, Observer};

const BASE_SCORE: i32 = 70;

/// The production observer
pub struct HomrObserver {
    config: ObserverConfig,
    drift_re: Regex,
    issue_re: Regex,
    hedge_re: Regex,
}

impl HomrObserver {
    pub fn new(config: ObserverConfig) -> Self {
        Self {
            config,
            drift_re: Regex::new(
                r"(?i)\b(instead of|rather than|deviat\w*|diverg\w*|switch(?:ed|ing) to|abandon(?:ed|ing))\b",
            )
            .expect("drift regex"),
            issue_re: Regex::new(r"(?i)^\s*(error|issue|failed|failure)\b[:\s]").expect("issue regex"),
            hedge_re: Regex::new(r"(?i)\b(should (?:we|i)|which of|unsure|unclear|ambiguous|not sure|clarif\w*)\b")
                .expect("hedge regex"),
        }
    }

    /// Parse the `OPTIONS:` block following a decision marker
    fn parse_options(lines: &[&str], start: usize) -> Vec<AmbiguityOption> {
        let mut options = Vec::new();
        let mut in_block = false;
        for line in &lines[start..] {
            let trimmed = line.trim();
            if trimmed.eq_ignore_ascii_case("options:") {
                in_block = true;
                continue;
            }
            if in_block {
                if let Some(label) = trimmed.strip_prefix("- ") {
                    let slug = slugify(label);
                    let id = if slug == "break-into-subtasks" {
                        BREAK_INTO_SUBTASKS.to_string()
                    } else {
                        slug
                    };
                    options.push(AmbiguityOption {
                        id,
                        label: label.to_string(),
                    });
                } else if !trimmed.is_empty() {
                    break;
                }
            }
        }
        options
    }

    /// Pad an option set so every ambiguity offers a real choice
    fn ensure_two_options(mut options: Vec<AmbiguityOption>) -> Vec<AmbiguityOption> {
        if options.is_empty() {
            options.push(AmbiguityOption {
                id: "proceed-as-planned".to_string(),
                label: "proceed as planned".to_string(),
            });
        }
        if options.len() < 2 {
            options.push(AmbiguityOption {
                id: BREAK_INTO_SUBTASKS.to_string(),
                label: "break into subtasks".to_string(),
            });
        }
        options
    }

    /// Rough keyword overlap between output and the task intent
    fn intent_overlap(output: &str, intent: &str) -> usize {
        let output_lower = output.to_lowercase();
        intent
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 3)
            .filter(|w| output_lower.contains(&w.to_lowercase()))
            .count()
    }
}

#[async_trait]
impl Observer for HomrObserver {
    async fn observe(&self, ctx: &ObservationContext, raw_output: &str) -> Observation {
        let lines: Vec<&str> = raw_output.lines().collect();

        let mut task_complete = false;
        let mut discoveries = Vec::new();
        let mut drift = Vec::new();
        let mut issues = Vec::new();
        let mut ambiguity: Option<Ambiguity> = None;
        let mut hedge_hits = 0usize;

        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim();

            if let Some(rest) = trimmed.strip_prefix("TASK COMPLETE") {
                task_complete = true;
                debug!(summary = rest.trim_start_matches(':').trim(), "Completion marker found");
            } else if let Some(note) = trimmed.strip_prefix("BLOCKED:") {
                discoveries.push(Discovery {
                    r#type: DiscoveryType::Blocker,
                    note: note.trim().to_string(),
                });
            } else if let Some(note) = trimmed.strip_prefix("DISCOVERY:") {
                discoveries.push(Discovery {
                    r#type: DiscoveryType::Pattern,
                    note: note.trim().to_string(),
                });
            } else if let Some(note) = trimmed.strip_prefix("CONSTRAINT:") {
                discoveries.push(Discovery {
                    r#type: DiscoveryType::Constraint,
                    note: note.trim().to_string(),
                });
            } else if let Some(note) = trimmed.strip_prefix("INSIGHT:") {
                discoveries.push(Discovery {
                    r#type: DiscoveryType::Insight,
                    note: note.trim().to_string(),
                });
            } else if let Some(question) = trimmed.strip_prefix("DECISION NEEDED:") {
                // Explicit user-decision request always escalates
                let options = Self::ensure_two_options(Self::parse_options(&lines, i + 1));
                ambiguity = Some(Ambiguity {
                    question: question.trim().to_string(),
                    options,
                    trigger_type: "unclear_requirement".to_string(),
                });
            } else {
                if self.issue_re.is_match(trimmed) {
                    issues.push(trimmed.to_string());
                }
                if self.drift_re.is_match(trimmed) {
                    // A deviation cue only counts as drift when it departs
                    // from the stated approach rather than restating it
                    let restates = Self::intent_overlap(trimmed, &ctx.task_approach) >= 3;
                    if !restates {
                        drift.push(trimmed.to_string());
                    }
                }
                if self.hedge_re.is_match(trimmed) && trimmed.contains('?') {
                    hedge_hits += 1;
                }
            }
        }

        // Pattern-matched ambiguity: hedged questions with low confidence
        // that the worker can resolve alone
        if ambiguity.is_none() && hedge_hits > 0 {
            let confidence = 1.0 - 0.3 * hedge_hits as f64;
            if confidence < self.config.ambiguity_confidence_threshold {
                let question = lines
                    .iter()
                    .map(|l| l.trim())
                    .find(|l| self.hedge_re.is_match(l) && l.contains('?'))
                    .unwrap_or("Unresolved question in worker output")
                    .to_string();
                ambiguity = Some(Ambiguity {
                    question,
                    options: Self::ensure_two_options(Vec::new()),
                    trigger_type: "unclear_requirement".to_string(),
                });
            }
        }

        let has_blocker = discoveries.iter().any(|d| d.r#type == DiscoveryType::Blocker);

        let mut score: i32 = BASE_SCORE;
        if task_complete {
            score += 15;
        }
        if Self::intent_overlap(raw_output, &ctx.task_intent) >= 2 {
            score += 10;
        }
        score -= 15 * drift.len().min(3) as i32;
        score -= 10 * issues.len().min(3) as i32;
        if has_blocker {
            score -= 25;
        }
        let score = score.clamp(0, 100) as u8;

        let mut observation = Observation::new(
            &ctx.worker_id,
            &ctx.outcome_id,
            &ctx.task_id,
            ctx.iteration,
            score,
        );
        observation.task_complete = task_complete;
        observation.discoveries = discoveries;
        observation.drift = drift;
        observation.issues = issues;
        observation.on_track = observation.drift.is_empty() && !has_blocker;
        observation.ambiguity = ambiguity;
        observation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Quality;

    fn ctx() -> ObservationContext {
        ObservationContext {
            worker_id: "worker-1".to_string(),
            outcome_id: "outcome-1".to_string(),
            task_id: "task-1".to_string(),
            iteration: 1,
            approach: "Use simple file-backed storage.".to_string(),
            task_intent: "Users can add and delete todo items".to_string(),
            task_approach: "Append-only file with compaction".to_string(),
        }
    }

    fn observer() -> HomrObserver {
        HomrObserver::new(ObserverConfig::default())
    }

    #[tokio::test]
    async fn test_clean_completion() {
        let output = "Implemented add and delete for todo items.\nTASK COMPLETE: add/delete works";
        let obs = observer().observe(&ctx(), output).await;

        assert!(obs.task_complete);
        assert!(obs.on_track);
        assert_eq!(obs.quality, Quality::Good);
        assert!(obs.alignment_score >= 75);
        assert!(!obs.has_ambiguity());
    }

    #[tokio::test]
    async fn test_blocker_forces_off_track() {
        let output = "BLOCKED: missing TAVILY_API_KEY in environment\nCONTINUING: waiting on key";
        let obs = observer().observe(&ctx(), output).await;

        assert!(obs.has_blocker());
        assert!(!obs.on_track);
        assert!(obs.alignment_score < 75);
    }

    #[tokio::test]
    async fn test_explicit_decision_escalates() {
        let output = "Made progress on storage.\n\
            DECISION NEEDED: Should items persist across restarts?\n\
            OPTIONS:\n\
            - yes, file-backed\n\
            - no, memory only\n\
            - break into subtasks\n";
        let obs = observer().observe(&ctx(), output).await;

        let ambiguity = obs.ambiguity.expect("ambiguity expected");
        assert_eq!(ambiguity.trigger_type, "unclear_requirement");
        assert_eq!(ambiguity.options.len(), 3);
        assert_eq!(ambiguity.options[0].label, "yes, file-backed");
        assert_eq!(ambiguity.options[2].id, BREAK_INTO_SUBTASKS);
    }

    #[tokio::test]
    async fn test_explicit_decision_without_options_gets_padding() {
        let output = "DECISION NEEDED: Keep the legacy format?";
        let obs = observer().observe(&ctx(), output).await;

        let ambiguity = obs.ambiguity.expect("ambiguity expected");
        assert!(ambiguity.options.len() >= 2);
    }

    #[tokio::test]
    async fn test_hedged_questions_escalate_below_threshold() {
        let output = "I am unsure which storage layout is wanted here?\n\
            It is unclear whether deletes should cascade?";
        let obs = observer().observe(&ctx(), output).await;
        // Two hedge hits: confidence 0.4, below the 0.6 default
        assert!(obs.has_ambiguity());
    }

    #[tokio::test]
    async fn test_single_hedge_does_not_escalate() {
        let output = "Not sure this helper is needed? Continuing with the plan.\nCONTINUING: tests next";
        let obs = observer().observe(&ctx(), output).await;
        // One hedge hit: confidence 0.7, above the 0.6 default
        assert!(!obs.has_ambiguity());
    }

    #[tokio::test]
    async fn test_drift_and_issues_lower_score() {
        let output = "Switched to a SQL database instead of the planned file format.\n\
            ERROR: migration script failed\n\
            CONTINUING: debugging";
        let obs = observer().observe(&ctx(), output).await;

        assert!(!obs.drift.is_empty());
        assert!(!obs.issues.is_empty());
        assert!(!obs.on_track);
        assert!(obs.alignment_score < 75);
    }

    #[tokio::test]
    async fn test_discovery_markers_typed() {
        let output = "DISCOVERY: the id scheme doubles as a sort key\n\
            CONSTRAINT: file locks are advisory on NFS\n\
            INSIGHT: compaction can run in the background\n\
            CONTINUING: next step";
        let obs = observer().observe(&ctx(), output).await;

        assert_eq!(obs.discoveries.len(), 3);
        assert_eq!(obs.discoveries[0].r#type, DiscoveryType::Pattern);
        assert_eq!(obs.discoveries[1].r#type, DiscoveryType::Constraint);
        assert_eq!(obs.discoveries[2].r#type, DiscoveryType::Insight);
        assert!(obs.on_track);
    }

    #[tokio::test]
    async fn test_determinism() {
        let output = "Some progress.\nERROR: flaky test\nCONTINUING: more";
        let a = observer().observe(&ctx(), output).await;
        let b = observer().observe(&ctx(), output).await;
        assert_eq!(a.alignment_score, b.alignment_score);
        assert_eq!(a.issues, b.issues);
        assert_eq!(a.on_track, b.on_track);
    }
}
