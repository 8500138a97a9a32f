//! Escalation resolver - user questions and their resolution
//!
//! Opens escalations, applies answers (including the break-into-subtasks
//! route), dismisses, and auto-resolves from the outcome's skill set and
//! previously answered questions. Waiting workers are woken through the
//! state event channel, not by polling.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::config::EscalationConfig;
use crate::domain::{
    Ambiguity, BREAK_INTO_SUBTASKS, Escalation, EscalationOption, EscalationStatus, Task,
};
use crate::error::EngineResult;
use crate::state::StateManager;

/// Outcome of an auto-resolve pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoResolveReport {
    pub resolved: usize,
    pub deferred: usize,
}

/// Tracks and resolves pending user questions
#[derive(Clone)]
pub struct EscalationResolver {
    state: StateManager,
    config: EscalationConfig,
}

impl EscalationResolver {
    pub fn new(state: StateManager, config: EscalationConfig) -> Self {
        Self { state, config }
    }

    /// Open a pending escalation
    pub async fn open(
        &self,
        outcome_id: &str,
        trigger_type: &str,
        question: &str,
        options: Vec<EscalationOption>,
        affected_tasks: Vec<String>,
    ) -> EngineResult<String> {
        let escalation = Escalation::new(outcome_id, trigger_type, question, options, affected_tasks);
        Ok(self.state.open_escalation(escalation).await?)
    }

    /// Open an escalation from an observer ambiguity payload
    pub async fn open_from_ambiguity(
        &self,
        outcome_id: &str,
        ambiguity: &Ambiguity,
        affected_tasks: Vec<String>,
    ) -> EngineResult<String> {
        let options = ambiguity
            .options
            .iter()
            .map(|o| EscalationOption::new(&o.id, &o.label))
            .collect();
        self.open(
            outcome_id,
            &ambiguity.trigger_type,
            &ambiguity.question,
            options,
            affected_tasks,
        )
        .await
    }

    /// Apply a user answer
    ///
    /// `break_into_subtasks` decomposes every affected task; any other
    /// option appends its text (plus context) to each affected task's
    /// approach and makes the tasks claimable again.
    pub async fn answer(
        &self,
        id: &str,
        selected_option: &str,
        additional_context: Option<String>,
    ) -> EngineResult<Escalation> {
        let resolved = self
            .state
            .resolve_escalation(
                id,
                Some(selected_option.to_string()),
                additional_context.clone(),
                None,
                false,
            )
            .await?;

        if selected_option == BREAK_INTO_SUBTASKS {
            for task_id in &resolved.affected_tasks {
                let task = self.state.get_task_required(task_id).await?;
                let subtasks = generate_subtasks(&task, additional_context.as_deref());
                let ids = self.state.decompose_task(task_id, subtasks).await?;
                info!(%task_id, subtasks = ids.len(), "Task decomposed after escalation");
            }
        }

        Ok(resolved)
    }

    /// Close without changes
    pub async fn dismiss(&self, id: &str, reason: Option<String>) -> EngineResult<Escalation> {
        Ok(self
            .state
            .resolve_escalation(id, None, reason, None, true)
            .await?)
    }

    /// Resolve pending escalations that match known context with high
    /// confidence
    ///
    /// Sources of confidence, checked in order: prior answered questions
    /// with the same trigger type, then the outcome's skill set. Matches
    /// below the configured threshold are deferred to the user.
    pub async fn auto_resolve(&self, outcome_id: &str) -> EngineResult<AutoResolveReport> {
        let pending = self
            .state
            .list_escalations(Some(outcome_id.to_string()), true)
            .await?;
        if pending.is_empty() {
            return Ok(AutoResolveReport::default());
        }

        let all = self
            .state
            .list_escalations(Some(outcome_id.to_string()), false)
            .await?;
        let answered: Vec<&Escalation> = all
            .iter()
            .filter(|e| e.status == EscalationStatus::Answered && e.selected_option.is_some())
            .collect();
        let capabilities = self.state.list_capabilities(outcome_id).await?;

        let mut report = AutoResolveReport::default();

        for escalation in &pending {
            let mut best: Option<(f64, String)> = None;

            // Prior answers with the same trigger carry the strongest signal
            for prior in &answered {
                if prior.trigger_type != escalation.trigger_type {
                    continue;
                }
                let Some(selected) = &prior.selected_option else {
                    continue;
                };
                if escalation.option(selected).is_none() {
                    continue;
                }
                let confidence = jaccard(&prior.question, &escalation.question);
                if best.as_ref().map(|(c, _)| confidence > *c).unwrap_or(true) {
                    best = Some((confidence, selected.clone()));
                }
            }

            // Skills whose triggers overlap an option label
            for capability in &capabilities {
                let skill_text = format!(
                    "{} {} {}",
                    capability.name,
                    capability.description.as_deref().unwrap_or(""),
                    capability.triggers.join(" ")
                );
                for option in &escalation.options {
                    if option.id == BREAK_INTO_SUBTASKS {
                        continue;
                    }
                    let confidence =
                        jaccard(&skill_text, &format!("{} {}", escalation.question, option.label));
                    if confidence > 0.0
                        && best.as_ref().map(|(c, _)| confidence > *c).unwrap_or(true)
                    {
                        best = Some((confidence, option.id.clone()));
                    }
                }
            }

            match best {
                Some((confidence, option)) if confidence >= self.config.auto_resolve_threshold => {
                    debug!(
                        escalation_id = %escalation.id,
                        %option,
                        confidence,
                        "Auto-resolving escalation"
                    );
                    self.state
                        .resolve_escalation(
                            &escalation.id,
                            Some(option),
                            Some("auto-resolved".to_string()),
                            Some(confidence),
                            false,
                        )
                        .await?;
                    report.resolved += 1;
                }
                _ => report.deferred += 1,
            }
        }

        Ok(report)
    }

}

/// Token-set Jaccard similarity over lowercase words
fn jaccard(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .map(String::from)
            .collect()
    };
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}

/// Deterministic decomposition of a task into subtasks
///
/// One subtask per intent sentence (capped at four); a task whose intent
/// is a single sentence splits into a clarify/implement pair. The union
/// of the subtasks covers the original intent, and user context from the
/// escalation answer lands in every subtask approach.
pub fn generate_subtasks(task: &Task, user_context: Option<&str>) -> Vec<Task> {
    let context_note = user_context
        .map(|c| format!("\n\nUser guidance: {}", c))
        .unwrap_or_default();

    let sentences: Vec<&str> = task
        .task_intent
        .split(['.', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(4)
        .collect();

    let mut subtasks = Vec::new();
    if sentences.len() >= 2 {
        for (i, sentence) in sentences.iter().enumerate() {
            let sub = Task::new(&task.outcome_id, format!("{} ({}/{})", task.title, i + 1, sentences.len()))
                .with_description(task.description.clone())
                .with_intent((*sentence).to_string())
                .with_approach(format!("{}{}", task.task_approach, context_note))
                .with_priority(task.priority)
                .with_required_capabilities(task.required_capabilities.clone());
            subtasks.push(sub);
        }
    } else {
        let clarify = Task::new(&task.outcome_id, format!("Clarify scope: {}", task.title))
            .with_description(task.description.clone())
            .with_intent(format!("Pin down the concrete requirements for: {}", task.task_intent))
            .with_approach(format!("Write findings to docs/ before implementing.{}", context_note))
            .with_priority(task.priority);
        let implement = Task::new(&task.outcome_id, format!("Implement: {}", task.title))
            .with_description(task.description.clone())
            .with_intent(task.task_intent.clone())
            .with_approach(format!("{}{}", task.task_approach, context_note))
            .with_priority(task.priority)
            .with_required_capabilities(task.required_capabilities.clone())
            .with_depends_on(vec![clarify.id.clone()]);
        subtasks.push(clarify);
        subtasks.push(implement);
    }

    // Subtasks inherit the phase so capability work stays capability work
    for sub in &mut subtasks {
        sub.phase = task.phase;
        sub.capability_type = task.capability_type;
        sub.provides.clone_from(&task.provides);
    }
    subtasks
}
