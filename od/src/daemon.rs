//! Daemon - composition root and programmatic surface
//!
//! Wires the state actor, LLM gate, sidecar runner, observer, planner,
//! resolver, reviewer, merge coordinator, retro engine, and worker
//! manager together, and exposes the operation groups the CLI (and any
//! other adapter) consumes.

use std::path::PathBuf;
use std::sync::Arc;

use eyre::Result;
use tracing::info;

use crate::capability::{CapabilityPlanner, CapabilityScanner, extract_needs};
use crate::config::Config;
use crate::domain::{
    AnalysisJob, Capability, CapabilityNeed, CapabilityType, Escalation, GitMode, Intent,
    IntentItem, MergeRequest, Observation, Outcome, ProgressEntry, ReviewCycle, Task, TaskStatus,
    Worker,
};
use crate::error::{EngineError, EngineResult};
use crate::escalation::{AutoResolveReport, EscalationResolver};
use crate::llm::{LlmRunner, SidecarRunner};
use crate::observer::{HomrObserver, Observer};
use crate::prompts::PromptBuilder;
use crate::retro::RetroEngine;
use crate::review::{EvidenceReviewer, ReviewRunner, Reviewer};
use crate::scheduler::LlmGate;
use crate::state::{StateManager, recover};
use crate::supervisor::{LiveStatus, StartOptions, SupervisorDeps, SupervisorExit, WorkerManager};
use crate::tasks::TaskStats;
use crate::worktree::{MergeCoordinator, WorktreeConfig, WorktreeManager, can_merge_cleanly};
use crate::workspace::Workspace;

/// The assembled engine
pub struct Daemon {
    config: Config,
    state: StateManager,
    workspace: Workspace,
    planner: CapabilityPlanner,
    scanner: CapabilityScanner,
    resolver: EscalationResolver,
    review: ReviewRunner,
    retro: RetroEngine,
    merges: MergeCoordinator,
    workers: WorkerManager,
}

impl Daemon {
    /// Assemble with production implementations (sidecar runner, HOMЯ
    /// observer, evidence reviewer) and run startup recovery
    pub async fn start(config: Config) -> Result<Self> {
        let state = StateManager::spawn(&config.storage.store_path)?;
        let runner: Arc<dyn LlmRunner> = Arc::new(SidecarRunner::new(config.llm.clone()));
        let observer: Arc<dyn Observer> = Arc::new(HomrObserver::new(config.observer.clone()));
        let reviewer: Arc<dyn Reviewer> = Arc::new(EvidenceReviewer);
        Self::assemble(config, state, runner, observer, reviewer).await
    }

    /// Assemble with injected capability implementations (tests, stubs)
    pub async fn assemble(
        config: Config,
        state: StateManager,
        runner: Arc<dyn LlmRunner>,
        observer: Arc<dyn Observer>,
        reviewer: Arc<dyn Reviewer>,
    ) -> Result<Self> {
        let recovery = recover(&state).await?;
        if recovery.workers_paused > 0 || recovery.tasks_released > 0 {
            info!(?recovery, "Startup recovery applied");
        }

        let workspace = Workspace::new(&config.storage.workspace_root);
        let planner = CapabilityPlanner::new(state.clone());
        let scanner = CapabilityScanner::new(state.clone(), workspace.clone());
        let resolver = EscalationResolver::new(state.clone(), config.escalation.clone());
        let review = ReviewRunner::new(
            state.clone(),
            workspace.clone(),
            reviewer,
            config.review.clone(),
        );
        let retro = RetroEngine::new(state.clone());

        let worktrees = Arc::new(WorktreeManager::new(WorktreeConfig {
            base_dir: config.git.worktree_dir.clone(),
            branch_prefix: config.git.branch_prefix.clone(),
        }));
        let merges = MergeCoordinator::new(state.clone(), Arc::clone(&worktrees));

        let deps = SupervisorDeps {
            state: state.clone(),
            runner,
            observer,
            gate: Arc::new(LlmGate::new(&config.concurrency)),
            planner: planner.clone(),
            resolver: resolver.clone(),
            prompts: Arc::new(PromptBuilder::new()?),
            llm: config.llm.clone(),
            observer_config: config.observer.clone(),
            review_config: config.review.clone(),
        };
        let workers = WorkerManager::new(
            deps,
            workspace.clone(),
            Arc::clone(&worktrees),
            merges.clone(),
            scanner.clone(),
            config.concurrency.max_workers,
        );

        Ok(Self {
            config,
            state,
            workspace,
            planner,
            scanner,
            resolver,
            review,
            retro,
            merges,
            workers,
        })
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn shutdown(&self) {
        self.state.shutdown().await;
    }

    // === Outcome ops ===

    pub async fn create_outcome(
        &self,
        name: &str,
        brief: Option<String>,
        parent: Option<String>,
        work_dir: Option<String>,
        git_mode: GitMode,
    ) -> EngineResult<Outcome> {
        let mut outcome = Outcome::new(name).with_git_mode(git_mode);
        if let Some(brief) = brief {
            outcome.brief = brief;
        }
        if let Some(parent) = parent {
            outcome.parent = Some(parent);
        }
        outcome.work_dir = work_dir;
        let id = self.state.create_outcome(outcome).await?;
        self.workspace
            .ensure_layout(&id)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        Ok(self.state.get_outcome_required(&id).await?)
    }

    pub async fn get_outcome(&self, id: &str) -> EngineResult<Outcome> {
        Ok(self.state.get_outcome_required(id).await?)
    }

    pub async fn list_outcomes(&self, status: Option<String>) -> EngineResult<Vec<Outcome>> {
        Ok(self.state.list_outcomes(status, None).await?)
    }

    /// Depth-first outcome forest as (depth, outcome) pairs
    pub async fn outcome_tree(&self) -> EngineResult<Vec<(usize, Outcome)>> {
        let all = self.state.list_outcomes(None, None).await?;
        let mut tree = Vec::with_capacity(all.len());
        fn descend(
            parent: Option<&str>,
            depth: usize,
            all: &[Outcome],
            out: &mut Vec<(usize, Outcome)>,
        ) {
            for outcome in all
                .iter()
                .filter(|o| o.parent.as_deref() == parent)
            {
                out.push((depth, outcome.clone()));
                descend(Some(&outcome.id), depth + 1, all, out);
            }
        }
        descend(None, 0, &all, &mut tree);
        Ok(tree)
    }

    pub async fn archive_outcome(&self, id: &str) -> EngineResult<()> {
        Ok(self.state.archive_outcome(id).await?)
    }

    pub async fn update_outcome(&self, outcome: Outcome) -> EngineResult<()> {
        Ok(self.state.update_outcome(outcome).await?)
    }

    /// Replace the structured intent from free text
    pub async fn optimize_intent(&self, outcome_id: &str, text: &str) -> EngineResult<Outcome> {
        let mut outcome = self.state.get_outcome_required(outcome_id).await?;
        outcome.set_intent(parse_intent(text));
        self.state.update_outcome(outcome).await?;
        Ok(self.state.get_outcome_required(outcome_id).await?)
    }

    /// Append a design-doc version; resets the capability gate when the
    /// approach changed
    pub async fn optimize_approach(&self, outcome_id: &str, approach: &str) -> EngineResult<Outcome> {
        let mut outcome = self.state.get_outcome_required(outcome_id).await?;
        outcome.append_design_doc(approach);
        self.state.update_outcome(outcome).await?;
        Ok(self.state.get_outcome_required(outcome_id).await?)
    }

    // === Task ops ===

    pub async fn create_task(&self, task: Task) -> EngineResult<String> {
        Ok(self.state.create_task(task).await?)
    }

    pub async fn create_tasks(&self, tasks: Vec<Task>) -> EngineResult<Vec<String>> {
        Ok(self.state.create_tasks(tasks).await?)
    }

    pub async fn get_task(&self, id: &str) -> EngineResult<Task> {
        Ok(self.state.get_task_required(id).await?)
    }

    pub async fn update_task(&self, task: Task) -> EngineResult<()> {
        Ok(self.state.update_task(task).await?)
    }

    pub async fn delete_task(&self, id: &str) -> EngineResult<bool> {
        Ok(self.state.delete_task(id).await?)
    }

    pub async fn list_tasks(
        &self,
        outcome_id: &str,
        status: Option<TaskStatus>,
    ) -> EngineResult<Vec<Task>> {
        Ok(self.state.list_tasks(outcome_id, status).await?)
    }

    pub async fn task_stats(&self, outcome_id: &str) -> EngineResult<TaskStats> {
        Ok(self.state.task_stats(outcome_id).await?)
    }

    // === Worker ops ===

    pub async fn start_worker(&self, outcome_id: &str, options: StartOptions) -> EngineResult<String> {
        self.workers.start_worker(outcome_id, options).await
    }

    pub async fn stop_worker(&self, worker_id: &str, fail: bool) -> EngineResult<()> {
        self.workers.stop_worker(worker_id, fail).await
    }

    pub async fn pause_worker(&self, worker_id: &str) -> EngineResult<()> {
        self.workers.pause_worker(worker_id).await
    }

    pub async fn resume_worker(&self, worker_id: &str) -> EngineResult<()> {
        self.workers.resume_worker(worker_id).await
    }

    pub async fn stop_all_workers(&self, outcome_id: &str) -> EngineResult<usize> {
        self.workers.stop_all(outcome_id).await
    }

    pub async fn list_workers(&self, outcome_id: Option<String>) -> EngineResult<Vec<Worker>> {
        Ok(self.state.list_workers(outcome_id, None).await?)
    }

    pub async fn live_status(&self, worker_id: &str) -> EngineResult<LiveStatus> {
        self.workers.live_status(worker_id).await
    }

    pub async fn join_worker(&self, worker_id: &str) -> EngineResult<SupervisorExit> {
        self.workers.join_worker(worker_id).await
    }

    pub async fn join_all_workers(&self) -> Vec<(String, SupervisorExit)> {
        self.workers.join_all().await
    }

    pub async fn list_progress(&self, worker_id: &str) -> EngineResult<Vec<ProgressEntry>> {
        Ok(self.state.list_progress(worker_id).await?)
    }

    pub async fn get_observation(&self, id: &str) -> EngineResult<Option<Observation>> {
        Ok(self.state.get_observation(id).await?)
    }

    // === Capability ops ===

    /// Detect capability needs from given text or the stored design doc
    pub async fn detect_capabilities(
        &self,
        outcome_id: &str,
        text: Option<&str>,
    ) -> EngineResult<Vec<CapabilityNeed>> {
        let outcome = self.state.get_outcome_required(outcome_id).await?;
        match text {
            Some(text) => {
                let existing = self.state.list_capabilities(outcome_id).await?;
                let tasks = self.state.list_tasks(outcome_id, None).await?;
                Ok(crate::capability::dedupe_needs(
                    extract_needs(text),
                    &existing,
                    &tasks,
                ))
            }
            None => {
                let approach = outcome.approach_text().unwrap_or("").to_string();
                self.planner
                    .analyze(outcome_id, &approach, &outcome.intent.summary)
                    .await
            }
        }
    }

    pub async fn list_capabilities(&self, outcome_id: &str) -> EngineResult<Vec<Capability>> {
        Ok(self.state.list_capabilities(outcome_id).await?)
    }

    pub async fn create_capability_tasks(
        &self,
        outcome_id: &str,
        needs: &[CapabilityNeed],
        parallel: bool,
    ) -> EngineResult<Vec<String>> {
        self.planner.create_tasks(outcome_id, needs, parallel).await
    }

    /// Write a capability file scaffold into the workspace and sync
    pub async fn create_capability_file(
        &self,
        outcome_id: &str,
        kind: CapabilityType,
        name: &str,
        description: Option<&str>,
        triggers: &[String],
        requires: &[String],
    ) -> EngineResult<PathBuf> {
        self.workspace
            .ensure_layout(outcome_id)
            .map_err(|e| EngineError::internal(e.to_string()))?;

        let path = match kind {
            CapabilityType::Skill => {
                let path = self.workspace.skills_dir(outcome_id).join(format!("{}.md", name));
                let mut frontmatter = format!("---\nname: {}\n", name);
                if let Some(description) = description {
                    frontmatter.push_str(&format!("description: {}\n", description));
                }
                frontmatter.push_str("triggers:\n");
                for trigger in triggers {
                    frontmatter.push_str(&format!("  - {}\n", trigger));
                }
                if !requires.is_empty() {
                    frontmatter.push_str("requires:\n");
                    for key in requires {
                        frontmatter.push_str(&format!("  - {}\n", key));
                    }
                }
                frontmatter.push_str(&format!("---\n\n# {}\n", name));
                std::fs::write(&path, frontmatter)
                    .map_err(|e| EngineError::internal(e.to_string()))?;
                path
            }
            CapabilityType::Tool => {
                let path = self.workspace.tools_dir(outcome_id).join(name);
                let body = format!("#!/bin/sh\n# {}\n", description.unwrap_or(name));
                std::fs::write(&path, body).map_err(|e| EngineError::internal(e.to_string()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                        .map_err(|e| EngineError::internal(e.to_string()))?;
                }
                path
            }
        };

        self.scanner
            .sync(outcome_id)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
        Ok(path)
    }

    /// Re-evaluate the capability gate after an approach change
    pub async fn replan_capabilities(&self, outcome_id: &str) -> EngineResult<()> {
        self.scanner
            .sync(outcome_id)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.planner.ensure_gate(outcome_id).await?;
        Ok(())
    }

    // === Escalation ops ===

    pub async fn list_escalations(
        &self,
        outcome_id: Option<String>,
        pending_only: bool,
    ) -> EngineResult<Vec<Escalation>> {
        Ok(self.state.list_escalations(outcome_id, pending_only).await?)
    }

    pub async fn answer_escalation(
        &self,
        id: &str,
        option_id: &str,
        context: Option<String>,
    ) -> EngineResult<Escalation> {
        self.resolver.answer(id, option_id, context).await
    }

    pub async fn dismiss_escalation(&self, id: &str, reason: Option<String>) -> EngineResult<Escalation> {
        self.resolver.dismiss(id, reason).await
    }

    pub async fn auto_resolve_escalations(&self, outcome_id: &str) -> EngineResult<AutoResolveReport> {
        self.resolver.auto_resolve(outcome_id).await
    }

    // === Review ops ===

    pub async fn run_review(&self, outcome_id: &str, criteria_only: bool) -> EngineResult<ReviewCycle> {
        self.review.run(outcome_id, criteria_only).await
    }

    pub async fn latest_review(&self, outcome_id: &str) -> EngineResult<Option<ReviewCycle>> {
        Ok(self.state.latest_review_cycle(outcome_id).await?)
    }

    // === Retro ops ===

    pub async fn trigger_retro(&self, outcome_id: &str) -> EngineResult<String> {
        self.retro.trigger(outcome_id).await
    }

    pub async fn retro_status(&self, job_id: &str) -> EngineResult<AnalysisJob> {
        self.retro.status(job_id).await
    }

    pub async fn accept_retro_proposal(&self, job_id: &str, proposal_id: &str) -> EngineResult<String> {
        self.retro.accept_proposal(job_id, proposal_id).await
    }

    pub async fn accept_retro_consolidated(&self, job_id: &str) -> EngineResult<String> {
        self.retro.accept_consolidated(job_id).await
    }

    // === Merge ops ===

    pub async fn queue_merge(&self, outcome_id: &str, worker_id: &str) -> EngineResult<String> {
        let id = self.merges.queue(outcome_id, worker_id).await?;
        self.merges.process_queue(outcome_id).await?;
        Ok(id)
    }

    pub async fn merge_status(&self, outcome_id: &str) -> EngineResult<Vec<MergeRequest>> {
        Ok(self.state.list_merges(outcome_id, None).await?)
    }

    /// Dry-run a worker's branch against the outcome base
    pub async fn merge_dry_run(&self, worker_id: &str) -> EngineResult<(bool, Vec<String>)> {
        let worker = self.state.get_worker_required(worker_id).await?;
        let outcome = self.state.get_outcome_required(&worker.outcome_id).await?;
        let branch = worker
            .branch
            .ok_or_else(|| EngineError::validation(format!("worker {} has no branch", worker_id)))?;
        let repo_root = outcome
            .work_dir
            .ok_or_else(|| EngineError::validation("outcome has no working directory".to_string()))?;
        let base = outcome.work_branch.unwrap_or_else(|| "main".to_string());
        can_merge_cleanly(PathBuf::from(repo_root).as_path(), &base, &branch)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))
    }
}

/// Parse free text into a structured intent
///
/// First non-bullet paragraph line becomes the summary; bullets become
/// intent items until a "success criteria" heading, after which bullets
/// become success criteria.
pub fn parse_intent(text: &str) -> Intent {
    let mut intent = Intent::default();
    let mut in_criteria = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.to_lowercase().contains("success criteria") {
            in_criteria = true;
            continue;
        }
        if let Some(bullet) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
            if in_criteria {
                intent.success_criteria.push(bullet.to_string());
            } else {
                intent.items.push(IntentItem::new(bullet, bullet));
            }
        } else if intent.summary.is_empty() && !trimmed.starts_with('#') {
            intent.summary = trimmed.to_string();
        }
    }
    intent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_intent() {
        let text = "A single-user todo app\n\n\
            - Add items\n\
            - Delete items\n\n\
            ## Success criteria\n\
            - can add and delete items\n\
            - state survives restarts\n";
        let intent = parse_intent(text);
        assert_eq!(intent.summary, "A single-user todo app");
        assert_eq!(intent.items.len(), 2);
        assert_eq!(intent.items[0].title, "Add items");
        assert_eq!(
            intent.success_criteria,
            vec!["can add and delete items", "state survives restarts"]
        );
    }

    #[test]
    fn test_parse_intent_plain_paragraph() {
        let intent = parse_intent("Just build the thing already.");
        assert_eq!(intent.summary, "Just build the thing already.");
        assert!(intent.items.is_empty());
        assert!(intent.success_criteria.is_empty());
    }
}
