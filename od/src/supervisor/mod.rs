//! Worker supervision - the Ralph loop and its manager
//!
//! Each worker is driven by a [`RalphEngine`] iteration loop; the
//! [`WorkerManager`] spawns one engine per worker and owns pause/stop
//! control and worktree lifecycle.

mod engine;
mod manager;

pub use engine::{
    ControlSignal, MAX_ITERATIONS, RalphEngine, SupervisorDeps, SupervisorExit,
};
pub use manager::{LiveStatus, StartOptions, WorkerManager};

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{Mutex, watch};

    use crate::capability::{CapabilityPlanner, CapabilityScanner};
    use crate::config::Config;
    use crate::domain::{
        CapabilityReady, Intent, Outcome, Task, TaskStatus, Worker, WorkerStatus,
    };
    use crate::escalation::EscalationResolver;
    use crate::llm::{LlmError, LlmRunner, RunnerOutput, RunnerRequest};
    use crate::observer::HomrObserver;
    use crate::prompts::PromptBuilder;
    use crate::scheduler::LlmGate;
    use crate::state::StateManager;
    use crate::worktree::{MergeCoordinator, WorktreeConfig, WorktreeManager};
    use crate::workspace::Workspace;

    use super::*;

    /// Scripted runner: pops one canned output per invocation
    struct ScriptedRunner {
        outputs: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<Result<String, LlmError>>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
            }
        }
    }

    #[async_trait]
    impl LlmRunner for ScriptedRunner {
        async fn run(
            &self,
            _request: RunnerRequest,
            _cancel: watch::Receiver<bool>,
        ) -> Result<RunnerOutput, LlmError> {
            let next = self.outputs.lock().await.pop_front();
            match next {
                Some(Ok(text)) => Ok(RunnerOutput {
                    text,
                    cost_usd: 0.01,
                    exit_code: 0,
                }),
                Some(Err(e)) => Err(e),
                None => Ok(RunnerOutput {
                    text: "CONTINUING: nothing scripted".to_string(),
                    cost_usd: 0.0,
                    exit_code: 0,
                }),
            }
        }
    }

    /// Runner that never returns until cancelled
    struct HangingRunner;

    #[async_trait]
    impl LlmRunner for HangingRunner {
        async fn run(
            &self,
            _request: RunnerRequest,
            mut cancel: watch::Receiver<bool>,
        ) -> Result<RunnerOutput, LlmError> {
            loop {
                if cancel.changed().await.is_err() || *cancel.borrow() {
                    return Err(LlmError::Cancelled);
                }
            }
        }
    }

    struct Harness {
        state: StateManager,
        deps: SupervisorDeps,
        _tempdir: tempfile::TempDir,
        workspace: Workspace,
    }

    fn harness(runner: Arc<dyn LlmRunner>) -> Harness {
        let tempdir = tempfile::tempdir().unwrap();
        let state = StateManager::spawn_in_memory().unwrap();
        let config = Config::default();
        let workspace = Workspace::new(tempdir.path());

        let deps = SupervisorDeps {
            state: state.clone(),
            runner,
            observer: Arc::new(HomrObserver::new(config.observer.clone())),
            gate: Arc::new(LlmGate::new(&config.concurrency)),
            planner: CapabilityPlanner::new(state.clone()),
            resolver: EscalationResolver::new(state.clone(), config.escalation.clone()),
            prompts: Arc::new(PromptBuilder::new().unwrap()),
            llm: config.llm.clone(),
            observer_config: config.observer.clone(),
            review_config: config.review.clone(),
        };
        Harness {
            state,
            deps,
            _tempdir: tempdir,
            workspace,
        }
    }

    async fn outcome_with_task(state: &StateManager, title: &str, intent: &str) -> (String, String) {
        let mut outcome = Outcome::new("Build TODO");
        let mut i = Intent::default();
        i.summary = "A single-user todo app".to_string();
        i.success_criteria = vec!["can add and delete items".to_string()];
        outcome.set_intent(i);
        outcome.append_design_doc("Use simple file-backed storage.");
        let outcome_id = state.create_outcome(outcome).await.unwrap();

        let task_id = state
            .create_task(Task::new(&outcome_id, title).with_intent(intent).with_priority(10))
            .await
            .unwrap();
        (outcome_id, task_id)
    }

    async fn run_engine(h: &Harness, outcome_id: &str) -> (String, SupervisorExit) {
        // Gate must settle before claims succeed
        h.deps.planner.ensure_gate(outcome_id).await.unwrap();

        let worker = Worker::new(outcome_id, "test-worker");
        let worker_id = h.state.create_worker(worker).await.unwrap();
        let mut w = h.state.get_worker_required(&worker_id).await.unwrap();
        w.set_status(WorkerStatus::Running);
        h.state.update_worker(w).await.unwrap();

        let (_tx, rx) = watch::channel(ControlSignal::Run);
        let engine = RalphEngine::new(
            h.deps.clone(),
            &worker_id,
            outcome_id,
            h.workspace.ensure_layout(outcome_id).unwrap(),
            rx,
        );
        let exit = engine.run().await;
        (worker_id, exit)
    }

    #[tokio::test]
    async fn test_single_task_completes_then_idle() {
        let runner = Arc::new(ScriptedRunner::new(vec![Ok(
            "Implemented add and delete items.\nTASK COMPLETE: done".to_string(),
        )]));
        let h = harness(runner);
        let (outcome_id, task_id) = outcome_with_task(
            &h.state,
            "Implement add/delete",
            "Users can add and delete todo items",
        )
        .await;

        let (worker_id, exit) = run_engine(&h, &outcome_id).await;
        // Outcome not converged yet: worker goes idle, not completed
        assert_eq!(exit, SupervisorExit::Idle);

        let task = h.state.get_task_required(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let worker = h.state.get_worker_required(&worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert!(worker.iteration >= 1);
        assert!(worker.cost_usd > 0.0);

        // Progress history: claim line plus the observed iteration
        let progress = h.state.list_progress(&worker_id).await.unwrap();
        assert!(progress.len() >= 2);
        let seqs: Vec<u64> = progress.iter().map(|p| p.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted);
    }

    #[tokio::test]
    async fn test_transient_failure_consumes_attempt_and_retries() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Err(LlmError::Timeout(Duration::from_secs(1))),
            Ok("Implemented add and delete items.\nTASK COMPLETE: done".to_string()),
        ]));
        let h = harness(runner);
        let (outcome_id, task_id) = outcome_with_task(
            &h.state,
            "Implement add/delete",
            "Users can add and delete todo items",
        )
        .await;

        let (_worker_id, exit) = run_engine(&h, &outcome_id).await;
        assert_eq!(exit, SupervisorExit::Idle);

        let task = h.state.get_task_required(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn test_fatal_llm_error_fails_worker() {
        let runner = Arc::new(ScriptedRunner::new(vec![Err(LlmError::Spawn(
            "missing binary".to_string(),
        ))]));
        let h = harness(runner);
        let (outcome_id, task_id) = outcome_with_task(&h.state, "Some task", "do something").await;

        let (worker_id, exit) = run_engine(&h, &outcome_id).await;
        assert!(matches!(exit, SupervisorExit::Failed { .. }));

        let worker = h.state.get_worker_required(&worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Failed);

        // The claimed task reverted with attempts unchanged
        let task = h.state.get_task_required(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn test_pause_cancels_inflight_invocation() {
        let h = harness(Arc::new(HangingRunner));
        let (outcome_id, task_id) = outcome_with_task(&h.state, "Slow task", "do slow things").await;
        h.deps.planner.ensure_gate(&outcome_id).await.unwrap();

        let worker_id = h
            .state
            .create_worker(Worker::new(&outcome_id, "pausable"))
            .await
            .unwrap();
        let mut w = h.state.get_worker_required(&worker_id).await.unwrap();
        w.set_status(WorkerStatus::Running);
        h.state.update_worker(w).await.unwrap();

        let (tx, rx) = watch::channel(ControlSignal::Run);
        let engine = RalphEngine::new(
            h.deps.clone(),
            &worker_id,
            &outcome_id,
            h.workspace.ensure_layout(&outcome_id).unwrap(),
            rx,
        );
        let join = tokio::spawn(engine.run());

        // Let the engine reach the invocation, then pause
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(ControlSignal::Pause).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, SupervisorExit::Paused);

        let worker = h.state.get_worker_required(&worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Paused);

        let task = h.state.get_task_required(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn test_ambiguity_waits_then_resumes_after_answer() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Ok("DECISION NEEDED: Should items persist across restarts?\nOPTIONS:\n- yes, file-backed\n- no, memory only\n- break into subtasks".to_string()),
            Ok("Implemented add and delete items.\nTASK COMPLETE: done".to_string()),
        ]));
        let h = harness(runner);
        let (outcome_id, task_id) = outcome_with_task(
            &h.state,
            "Implement add/delete",
            "Users can add and delete todo items",
        )
        .await;
        h.deps.planner.ensure_gate(&outcome_id).await.unwrap();

        let worker_id = h
            .state
            .create_worker(Worker::new(&outcome_id, "asker"))
            .await
            .unwrap();
        let mut w = h.state.get_worker_required(&worker_id).await.unwrap();
        w.set_status(WorkerStatus::Running);
        h.state.update_worker(w).await.unwrap();

        let (_tx, rx) = watch::channel(ControlSignal::Run);
        let engine = RalphEngine::new(
            h.deps.clone(),
            &worker_id,
            &outcome_id,
            h.workspace.ensure_layout(&outcome_id).unwrap(),
            rx,
        );
        let join = tokio::spawn(engine.run());

        // Wait until the escalation is open and the worker is waiting
        let escalation = loop {
            let pending = h
                .state
                .list_escalations(Some(outcome_id.clone()), true)
                .await
                .unwrap();
            if let Some(e) = pending.into_iter().next() {
                break e;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(escalation.trigger_type, "unclear_requirement");
        assert_eq!(escalation.affected_tasks, vec![task_id.clone()]);

        // While pending, the task is not claimable
        assert!(
            h.deps
                .resolver
                .answer(&escalation.id, "yes-file-backed", None)
                .await
                .is_ok()
        );

        let exit = tokio::time::timeout(Duration::from_secs(10), join)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, SupervisorExit::Idle);

        // The answer's context reached the task approach before completion
        let task = h.state.get_task_required(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.task_approach.contains("yes, file-backed"));
    }

    #[tokio::test]
    async fn test_worker_manager_start_validations() {
        let h = harness(Arc::new(ScriptedRunner::new(vec![])));
        let worktrees = Arc::new(WorktreeManager::new(WorktreeConfig::default()));
        let manager = WorkerManager::new(
            h.deps.clone(),
            h.workspace.clone(),
            Arc::clone(&worktrees),
            MergeCoordinator::new(h.state.clone(), Arc::clone(&worktrees)),
            CapabilityScanner::new(h.state.clone(), h.workspace.clone()),
            4,
        );

        // Unknown outcome
        let err = manager
            .start_worker("ghost", StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::EngineError::NotFound(_)));

        // Outcome with no pending tasks
        let empty = h.state.create_outcome(Outcome::new("empty")).await.unwrap();
        let err = manager
            .start_worker(&empty, StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Validation(_)));

        // Parent outcomes cannot host workers
        let parent = h.state.create_outcome(Outcome::new("parent")).await.unwrap();
        let _child = h
            .state
            .create_outcome(Outcome::new("child").with_parent(&parent))
            .await
            .unwrap();
        h.state
            .create_task(Task::new(&parent, "work"))
            .await
            .unwrap();
        let err = manager
            .start_worker(&parent, StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_worker_manager_runs_to_idle() {
        let runner = Arc::new(ScriptedRunner::new(vec![Ok(
            "Implemented add and delete items.\nTASK COMPLETE: done".to_string(),
        )]));
        let h = harness(runner);
        let (outcome_id, _task_id) = outcome_with_task(
            &h.state,
            "Implement add/delete",
            "Users can add and delete todo items",
        )
        .await;

        let worktrees = Arc::new(WorktreeManager::new(WorktreeConfig::default()));
        let manager = WorkerManager::new(
            h.deps.clone(),
            h.workspace.clone(),
            Arc::clone(&worktrees),
            MergeCoordinator::new(h.state.clone(), Arc::clone(&worktrees)),
            CapabilityScanner::new(h.state.clone(), h.workspace.clone()),
            4,
        );

        let worker_id = manager
            .start_worker(&outcome_id, StartOptions::default())
            .await
            .unwrap();
        let exit = manager.join_worker(&worker_id).await.unwrap();
        assert_eq!(exit, SupervisorExit::Idle);

        // Second start now fails validation: no pending work remains
        let err = manager
            .start_worker(&outcome_id, StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Validation(_)));

        let status = manager.live_status(&worker_id).await.unwrap();
        assert_eq!(status.worker.status, WorkerStatus::Idle);
        assert!(status.last_observation.is_some());
    }

    #[tokio::test]
    async fn test_capability_scenario_gate_ordering() {
        // Approach names an API: the capability task must be claimed and
        // completed before the execution task becomes claimable
        let runner = Arc::new(ScriptedRunner::new(vec![
            Ok("Wrote skills/tavily-api.md with frontmatter.\nTASK COMPLETE: skill built".to_string()),
            Ok("Implemented search flow using the skill.\nTASK COMPLETE: search done".to_string()),
        ]));
        let h = harness(runner);

        let mut outcome = Outcome::new("Search thing");
        let mut intent = Intent::default();
        intent.summary = "A search assistant".to_string();
        outcome.set_intent(intent);
        outcome.append_design_doc("Uses Tavily API for search.");
        let outcome_id = h.state.create_outcome(outcome).await.unwrap();

        let exec_task = h
            .state
            .create_task(
                Task::new(&outcome_id, "Implement search flow")
                    .with_intent("Search the web for answers")
                    .with_priority(10)
                    .with_required_capabilities(vec!["skill:tavily-api".to_string()]),
            )
            .await
            .unwrap();

        let (_worker_id, exit) = run_engine(&h, &outcome_id).await;
        assert_eq!(exit, SupervisorExit::Idle);

        // Both phases completed; capability artifact registered; gate open
        let outcome = h.state.get_outcome_required(&outcome_id).await.unwrap();
        assert_eq!(outcome.capability_ready, CapabilityReady::Ready);

        let exec = h.state.get_task_required(&exec_task).await.unwrap();
        assert_eq!(exec.status, TaskStatus::Completed);

        let caps = h.state.list_capabilities(&outcome_id).await.unwrap();
        assert!(caps.iter().any(|c| c.reference() == "skill:tavily-api"));
    }
}
