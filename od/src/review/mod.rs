//! Review + convergence loop
//!
//! A review cycle evaluates an outcome's intent items and success
//! criteria against evidence from completed tasks and workspace outputs.
//! Full cycles also hunt issues and spawn remediation tasks; convergence
//! is two consecutive clean full cycles with all criteria passing.

mod convergence;
mod reviewer;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ReviewConfig;
use crate::domain::{IssueSeverity, Outcome, OutcomeStatus, ReviewCycle, Task};
use crate::error::EngineResult;
use crate::state::StateManager;
use crate::workspace::Workspace;

pub use convergence::{fold_cycle, is_converged};
pub use reviewer::{Evidence, EvidenceReviewer, ReviewFindings, Reviewer};

/// Runs review cycles for outcomes
#[derive(Clone)]
pub struct ReviewRunner {
    state: StateManager,
    workspace: Workspace,
    reviewer: Arc<dyn Reviewer>,
    config: ReviewConfig,
}

impl ReviewRunner {
    pub fn new(
        state: StateManager,
        workspace: Workspace,
        reviewer: Arc<dyn Reviewer>,
        config: ReviewConfig,
    ) -> Self {
        Self {
            state,
            workspace,
            reviewer,
            config,
        }
    }

    fn min_severity(&self) -> IssueSeverity {
        match self.config.remediation_min_severity.as_str() {
            "low" => IssueSeverity::Low,
            "high" => IssueSeverity::High,
            _ => IssueSeverity::Medium,
        }
    }

    /// Run one review cycle
    ///
    /// `criteria_only` evaluates pass/fail without issue hunting,
    /// remediation, or convergence effects.
    pub async fn run(&self, outcome_id: &str, criteria_only: bool) -> EngineResult<ReviewCycle> {
        let outcome = self.state.get_outcome_required(outcome_id).await?;

        let tasks = self.state.list_tasks(outcome_id, None).await?;
        let outputs = self
            .workspace
            .list_outputs(outcome_id)
            .unwrap_or_default();
        let evidence = Evidence {
            tasks: tasks.clone(),
            outputs,
        };

        let findings = self.reviewer.evaluate(&outcome, &evidence).await;

        let cycle_index = self
            .state
            .latest_review_cycle(outcome_id)
            .await?
            .map(|c| c.cycle_index + 1)
            .unwrap_or(1);

        let mut cycle = ReviewCycle::new(outcome_id, cycle_index, criteria_only);
        cycle.item_results = findings.item_results;
        cycle.criterion_results = findings.criterion_results;

        if !criteria_only {
            cycle.issues = findings.issues;
            cycle.issues_found = cycle.issues.len() as u32;
            cycle.remediation_tasks = self.create_remediation_tasks(&outcome, &tasks, &cycle).await?;
        }

        self.state.put_review_cycle(cycle.clone()).await?;
        info!(
            outcome_id,
            cycle_index,
            criteria_only,
            issues = cycle.issues_found,
            "Review cycle recorded"
        );

        if !criteria_only {
            self.update_convergence(outcome_id, &cycle).await?;
        }

        Ok(cycle)
    }

    /// One remediation task per issue at or above the configured severity
    ///
    /// Remediation priority sits below every currently claimable task so
    /// in-flight work finishes first.
    async fn create_remediation_tasks(
        &self,
        outcome: &Outcome,
        tasks: &[Task],
        cycle: &ReviewCycle,
    ) -> EngineResult<Vec<String>> {
        let min = self.min_severity();
        let actionable: Vec<_> = cycle.issues.iter().filter(|i| i.severity >= min).collect();
        if actionable.is_empty() {
            return Ok(Vec::new());
        }

        let floor = tasks
            .iter()
            .filter(|t| t.is_open())
            .map(|t| t.priority)
            .max()
            .unwrap_or(0);

        let mut remediation = Vec::with_capacity(actionable.len());
        for (i, issue) in actionable.iter().enumerate() {
            let title: String = format!("Remediate: {}", issue.description)
                .chars()
                .take(80)
                .collect();
            let mut task = Task::new(&outcome.id, title)
                .with_description(issue.description.clone())
                .with_intent(format!("Resolve the review finding: {}", issue.description))
                .with_priority(floor + 10 + i as i64);
            task.from_review = true;
            task.review_cycle = Some(cycle.cycle_index);
            remediation.push(task);
        }

        let ids = self.state.create_tasks(remediation).await?;
        debug!(count = ids.len(), "Remediation tasks created");
        Ok(ids)
    }

    /// Fold the cycle into convergence state and transition the outcome
    /// to achieved when converged with all criteria passing
    async fn update_convergence(&self, outcome_id: &str, cycle: &ReviewCycle) -> EngineResult<()> {
        let mut outcome = self.state.get_outcome_required(outcome_id).await?;
        outcome.convergence = fold_cycle(&outcome.convergence, cycle);

        let converged = is_converged(&outcome.convergence, self.config.convergence_cycles);
        if converged && cycle.all_criteria_pass() && outcome.status == OutcomeStatus::Active {
            outcome.set_status(OutcomeStatus::Achieved);
            info!(outcome_id = %outcome.id, "Outcome achieved");
        } else {
            outcome.touch();
        }
        self.state.update_outcome(outcome).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Intent;
    use tempfile::tempdir;

    async fn setup(criterion: &str) -> (StateManager, ReviewRunner, String) {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn_in_memory().unwrap();

        let mut outcome = Outcome::new("Build TODO");
        let mut intent = Intent::default();
        intent.summary = "A single-user todo app".to_string();
        intent.success_criteria = vec![criterion.to_string()];
        outcome.set_intent(intent);
        let outcome_id = state.create_outcome(outcome).await.unwrap();

        let runner = ReviewRunner::new(
            state.clone(),
            Workspace::new(temp.path()),
            Arc::new(EvidenceReviewer),
            ReviewConfig::default(),
        );
        (state, runner, outcome_id)
    }

    async fn complete_a_task(state: &StateManager, outcome_id: &str, title: &str, intent: &str) {
        let worker = crate::domain::Worker::new(outcome_id, "reviewer-test");
        let task_id = state
            .create_task(Task::new(outcome_id, title).with_intent(intent))
            .await
            .unwrap();
        // Make the outcome claimable so a worker can exist
        let mut outcome = state.get_outcome_required(outcome_id).await.unwrap();
        outcome.set_capability_ready(crate::domain::CapabilityReady::Ready);
        state.update_outcome(outcome).await.unwrap();

        let worker_id = state.create_worker(worker).await.unwrap();
        let claimed = state.claim_task(outcome_id, &worker_id).await.unwrap().unwrap();
        assert_eq!(claimed.id, task_id);
        state.begin_task(&task_id, &worker_id).await.unwrap();
        state.complete_task(&task_id, &worker_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_clean_cycles_achieve_outcome() {
        let (state, runner, outcome_id) = setup("can add and delete items").await;
        complete_a_task(&state, &outcome_id, "Implement add/delete", "add and delete items").await;

        let cycle = runner.run(&outcome_id, false).await.unwrap();
        assert_eq!(cycle.cycle_index, 1);
        assert_eq!(cycle.issues_found, 0);
        assert!(cycle.all_criteria_pass());

        let outcome = state.get_outcome_required(&outcome_id).await.unwrap();
        assert_eq!(outcome.convergence.consecutive_zero_issues, 1);
        assert_eq!(outcome.status, OutcomeStatus::Active);

        runner.run(&outcome_id, false).await.unwrap();
        let outcome = state.get_outcome_required(&outcome_id).await.unwrap();
        assert_eq!(outcome.convergence.consecutive_zero_issues, 2);
        assert_eq!(outcome.status, OutcomeStatus::Achieved);
    }

    #[tokio::test]
    async fn test_failed_criterion_creates_remediation() {
        let (state, runner, outcome_id) = setup("items persist across restarts").await;

        let cycle = runner.run(&outcome_id, false).await.unwrap();
        assert!(cycle.issues_found > 0);
        assert!(!cycle.remediation_tasks.is_empty());

        let task = state
            .get_task_required(&cycle.remediation_tasks[0])
            .await
            .unwrap();
        assert!(task.from_review);
        assert_eq!(task.review_cycle, Some(1));
        assert!(task.priority >= 10);

        let outcome = state.get_outcome_required(&outcome_id).await.unwrap();
        assert_eq!(outcome.convergence.consecutive_zero_issues, 0);
    }

    #[tokio::test]
    async fn test_criteria_only_cycle_has_no_side_effects() {
        let (state, runner, outcome_id) = setup("items persist across restarts").await;

        let cycle = runner.run(&outcome_id, true).await.unwrap();
        assert!(cycle.criteria_only);
        assert_eq!(cycle.issues_found, 0);
        assert!(cycle.remediation_tasks.is_empty());

        // No remediation tasks and no convergence movement
        assert!(state.list_tasks(&outcome_id, None).await.unwrap().is_empty());
        let outcome = state.get_outcome_required(&outcome_id).await.unwrap();
        assert_eq!(outcome.convergence.consecutive_zero_issues, 0);
        assert_eq!(outcome.convergence.last_cycle_index, 0);
    }

    #[tokio::test]
    async fn test_cycle_indices_are_monotonic() {
        let (_state, runner, outcome_id) = setup("whatever criterion").await;
        let c1 = runner.run(&outcome_id, true).await.unwrap();
        let c2 = runner.run(&outcome_id, true).await.unwrap();
        assert_eq!(c1.cycle_index, 1);
        assert_eq!(c2.cycle_index, 2);
    }
}
