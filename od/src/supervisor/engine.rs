//! RalphEngine - the per-worker iteration loop
//!
//! One engine per running worker. Each iteration claims a task, builds a
//! prompt, invokes the LLM sidecar, observes the output, and acts on the
//! observation. Pause and stop signals are honored at every suspension
//! point: before claim, before invocation, during invocation, and while
//! waiting on an escalation. The loop restarts each iteration with fresh
//! context; state lives in the store, not in memory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::capability::CapabilityPlanner;
use crate::config::{LlmConfig, ObserverConfig, ReviewConfig};
use crate::domain::{Observation, ProgressEntry, Task, TaskStatus, WorkerStatus};
use crate::escalation::EscalationResolver;
use crate::llm::{LlmRunner, RunnerRequest};
use crate::observer::{ObservationContext, Observer};
use crate::prompts::{CapabilityContext, IterationContext, PromptBuilder};
use crate::review::is_converged;
use crate::scheduler::LlmGate;
use crate::state::{StateError, StateEvent, StateManager};

/// Control signal delivered over the worker's watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSignal {
    #[default]
    Run,
    Pause,
    /// `fail` marks the worker failed instead of paused
    Stop {
        fail: bool,
    },
}

/// How a supervisor run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// All work done and the outcome converged
    Completed,
    /// No eligible work left
    Idle,
    Paused,
    Stopped,
    Failed { reason: String },
}

/// Shared dependencies of every supervisor
#[derive(Clone)]
pub struct SupervisorDeps {
    pub state: StateManager,
    pub runner: Arc<dyn LlmRunner>,
    pub observer: Arc<dyn Observer>,
    pub gate: Arc<LlmGate>,
    pub planner: CapabilityPlanner,
    pub resolver: EscalationResolver,
    pub prompts: Arc<PromptBuilder>,
    pub llm: LlmConfig,
    pub observer_config: ObserverConfig,
    pub review_config: ReviewConfig,
}

/// Safety cap on iterations per run
pub const MAX_ITERATIONS: u32 = 100;

/// The per-worker supervisor loop
pub struct RalphEngine {
    deps: SupervisorDeps,
    worker_id: String,
    outcome_id: String,
    /// Directory the sidecar runs in (worktree or shared workspace)
    work_dir: PathBuf,
    control: watch::Receiver<ControlSignal>,
}

/// Interrupts observed at suspension points
enum Interrupt {
    Pause,
    Stop { fail: bool },
}

impl RalphEngine {
    pub fn new(
        deps: SupervisorDeps,
        worker_id: impl Into<String>,
        outcome_id: impl Into<String>,
        work_dir: PathBuf,
        control: watch::Receiver<ControlSignal>,
    ) -> Self {
        Self {
            deps,
            worker_id: worker_id.into(),
            outcome_id: outcome_id.into(),
            work_dir,
            control,
        }
    }

    /// Run the loop until completion, idleness, or interruption
    pub async fn run(mut self) -> SupervisorExit {
        info!(worker_id = %self.worker_id, outcome_id = %self.outcome_id, "Supervisor starting");

        loop {
            // Suspension point: before claim
            if let Some(interrupt) = self.check_control() {
                return self.interrupted(interrupt, None).await;
            }

            let iteration = match self.advance_iteration().await {
                Ok(i) => i,
                Err(e) => return self.fail_worker(format!("state error: {}", e)).await,
            };
            if iteration > MAX_ITERATIONS {
                return self.fail_worker(format!("exceeded {} iterations", MAX_ITERATIONS)).await;
            }

            let _ = self
                .append_progress(iteration, None, "claiming next task", None, None)
                .await;

            let task = match self.deps.state.claim_task(&self.outcome_id, &self.worker_id).await {
                Ok(Some(task)) => task,
                Ok(None) => return self.finalize().await,
                Err(StateError::CapabilityNotReady(_)) => {
                    // Gate wedged: re-plan capabilities and retry
                    debug!(worker_id = %self.worker_id, "Capability gate closed, re-planning");
                    if let Err(e) = self.deps.planner.ensure_gate(&self.outcome_id).await {
                        return self.fail_worker(format!("capability planning: {}", e)).await;
                    }
                    continue;
                }
                Err(e) => return self.fail_worker(format!("claim: {}", e)).await,
            };

            debug!(worker_id = %self.worker_id, task_id = %task.id, iteration, "Task claimed");
            if let Err(e) = self.deps.state.begin_task(&task.id, &self.worker_id).await {
                return self.fail_worker(format!("begin task: {}", e)).await;
            }

            // Suspension point: before invocation
            if let Some(interrupt) = self.check_control() {
                return self.interrupted(interrupt, Some(&task.id)).await;
            }

            let prompt = match self.build_prompt(&task).await {
                Ok(p) => p,
                Err(e) => return self.fail_worker(format!("prompt: {}", e)).await,
            };

            let output = {
                let _permit = self.deps.gate.acquire().await;
                // Suspension point: during invocation (cancellable)
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let request = RunnerRequest {
                    prompt,
                    model: self.deps.llm.model.clone(),
                    workspace: self.work_dir.clone(),
                };
                let mut control = self.control.clone();
                tokio::select! {
                    result = self.deps.runner.run(request, cancel_rx) => result,
                    interrupt = wait_interrupt(&mut control) => {
                        let _ = cancel_tx.send(true);
                        info!(worker_id = %self.worker_id, "Cancelled in-flight invocation");
                        return self.interrupted(interrupt, Some(&task.id)).await;
                    }
                }
            };

            let output = match output {
                Ok(output) => output,
                Err(e) if e.is_fatal() => {
                    let _ = self.deps.state.release_task(&task.id).await;
                    return self.fail_worker(format!("llm fatal: {}", e)).await;
                }
                Err(e) => {
                    // Transient: the task takes the attempt, not the worker
                    warn!(worker_id = %self.worker_id, error = %e, "Transient invocation failure");
                    match self.deps.state.fail_task(&task.id, &self.worker_id).await {
                        Ok(TaskStatus::Failed) => {
                            return self
                                .fail_worker(format!("task {} exhausted retries: {}", task.id, e))
                                .await;
                        }
                        Ok(_) => continue,
                        Err(e) => return self.fail_worker(format!("fail task: {}", e)).await,
                    }
                }
            };

            if let Err(e) = self.accumulate_cost(output.cost_usd).await {
                warn!(error = %e, "Failed to record cost");
            }

            let observation = self.observe(&task, iteration, &output.text).await;
            let observation_id = match self.deps.state.put_observation(observation.clone()).await {
                Ok(id) => id,
                Err(e) => return self.fail_worker(format!("store observation: {}", e)).await,
            };
            let _ = self
                .append_progress(
                    iteration,
                    Some(&task.id),
                    &observation.summary(),
                    Some(&output.text),
                    Some(&observation_id),
                )
                .await;
            if let Err(e) = self.record_observation(&observation_id, &observation).await {
                warn!(error = %e, "Failed to update worker observation pointer");
            }

            // Ambiguity gates everything else: the task is parked on an
            // escalation and the worker waits for the user
            if let Some(ambiguity) = &observation.ambiguity {
                match self.wait_for_escalation(&task, ambiguity).await {
                    WaitResult::Resumed => continue,
                    WaitResult::Interrupted(interrupt) => {
                        // The escalation open already released the task
                        return self.interrupted(interrupt, None).await;
                    }
                    WaitResult::Error(reason) => return self.fail_worker(reason).await,
                }
            }

            if observation.task_complete {
                if let Err(e) = self.deps.state.complete_task(&task.id, &self.worker_id).await {
                    return self.fail_worker(format!("complete task: {}", e)).await;
                }
                info!(worker_id = %self.worker_id, task_id = %task.id, "Task completed");
                continue;
            }

            // Two consecutive poor/off-track iterations on the same task
            // hand it back to the task engine
            if self.should_strike(&task.id, &observation).await {
                warn!(task_id = %task.id, "Repeated drift/poor quality, failing task");
                match self.deps.state.fail_task(&task.id, &self.worker_id).await {
                    Ok(_) => continue,
                    Err(e) => return self.fail_worker(format!("fail task: {}", e)).await,
                }
            } else {
                // Mid-task: hand the claim back so the next iteration
                // re-claims with fresh context
                let _ = self.deps.state.release_task(&task.id).await;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Bump and persist the worker's iteration counter
    async fn advance_iteration(&self) -> Result<u32, StateError> {
        let mut worker = self.deps.state.get_worker_required(&self.worker_id).await?;
        worker.iteration += 1;
        let iteration = worker.iteration;
        self.deps.state.update_worker(worker).await?;
        Ok(iteration)
    }

    async fn accumulate_cost(&self, cost_usd: f64) -> Result<(), StateError> {
        if cost_usd == 0.0 {
            return Ok(());
        }
        let mut worker = self.deps.state.get_worker_required(&self.worker_id).await?;
        worker.cost_usd += cost_usd;
        self.deps.state.update_worker(worker).await
    }

    async fn record_observation(
        &self,
        observation_id: &str,
        observation: &Observation,
    ) -> Result<(), StateError> {
        let mut worker = self.deps.state.get_worker_required(&self.worker_id).await?;
        worker.last_observation = Some(observation_id.to_string());
        worker.progress_summary = observation.summary();
        self.deps.state.update_worker(worker).await
    }

    async fn append_progress(
        &self,
        iteration: u32,
        task_id: Option<&str>,
        content: &str,
        raw_output: Option<&str>,
        observation_id: Option<&str>,
    ) -> Result<u64, StateError> {
        let mut entry = ProgressEntry::new(&self.worker_id, &self.outcome_id, iteration, content);
        if let Some(task_id) = task_id {
            entry = entry.with_task(task_id);
        }
        if let Some(raw) = raw_output {
            entry = entry.with_raw_output(raw);
        }
        if let Some(obs) = observation_id {
            entry = entry.with_observation(obs);
        }
        self.deps.state.append_progress(entry).await
    }

    /// Deterministic prompt from outcome, task, recent observations, and
    /// the capabilities the task references
    async fn build_prompt(&self, task: &Task) -> Result<String, eyre::Error> {
        let outcome = self.deps.state.get_outcome_required(&self.outcome_id).await?;

        let observations = self
            .deps
            .state
            .list_observations(Some(self.worker_id.clone()), None)
            .await?;
        let start = observations
            .len()
            .saturating_sub(self.deps.observer_config.context_max_entries);
        let mut recent = String::new();
        for obs in &observations[start..] {
            let line: String = obs
                .summary()
                .chars()
                .take(self.deps.observer_config.context_max_chars)
                .collect();
            recent.push_str(&format!("- iteration {}: {}\n", obs.iteration, line));
        }

        let capabilities = self
            .deps
            .state
            .list_capabilities(&self.outcome_id)
            .await?
            .into_iter()
            .filter(|c| task.required_capabilities.contains(&c.reference()))
            .map(|c| CapabilityContext {
                reference: c.reference(),
                description: c.description.unwrap_or_default(),
                triggers: c.triggers,
            })
            .collect();

        self.deps.prompts.iteration_prompt(&IterationContext {
            outcome_name: outcome.name.clone(),
            intent_summary: outcome.intent.summary.clone(),
            approach: outcome.approach_text().unwrap_or("").to_string(),
            task_title: task.title.clone(),
            task_intent: task.task_intent.clone(),
            task_approach: task.task_approach.clone(),
            recent_observations: recent,
            capabilities,
        })
    }

    async fn observe(&self, task: &Task, iteration: u32, raw_output: &str) -> Observation {
        let approach = self
            .deps
            .state
            .get_outcome(&self.outcome_id)
            .await
            .ok()
            .flatten()
            .and_then(|o| o.approach_text().map(String::from))
            .unwrap_or_default();
        let ctx = ObservationContext {
            worker_id: self.worker_id.clone(),
            outcome_id: self.outcome_id.clone(),
            task_id: task.id.clone(),
            iteration,
            approach,
            task_intent: task.task_intent.clone(),
            task_approach: task.task_approach.clone(),
        };
        self.deps.observer.observe(&ctx, raw_output).await
    }

    /// Open an escalation for the ambiguity and wait for its resolution
    async fn wait_for_escalation(
        &mut self,
        task: &Task,
        ambiguity: &crate::domain::Ambiguity,
    ) -> WaitResult {
        // Subscribe before opening so the resolution event cannot slip by
        let mut events = self.deps.state.subscribe_events();
        let mut control = self.control.clone();

        let escalation_id = match self
            .deps
            .resolver
            .open_from_ambiguity(&self.outcome_id, ambiguity, vec![task.id.clone()])
            .await
        {
            Ok(id) => id,
            Err(e) => return WaitResult::Error(format!("open escalation: {}", e)),
        };

        if let Err(e) = self.set_worker_status(WorkerStatus::Waiting).await {
            return WaitResult::Error(format!("worker status: {}", e));
        }
        info!(worker_id = %self.worker_id, %escalation_id, "Waiting on escalation");

        // Auto-resolution may already have answered it
        match self.deps.state.get_escalation(&escalation_id).await {
            Ok(Some(e)) if !e.is_pending() => return self.resume_from_wait().await,
            Ok(_) => {}
            Err(e) => return WaitResult::Error(format!("escalation lookup: {}", e)),
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(StateEvent::EscalationResolved { id, .. }) if id == escalation_id => {
                        return self.resume_from_wait().await;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        // Lagged or closed: fall back to polling the record
                        match self.deps.state.get_escalation(&escalation_id).await {
                            Ok(Some(e)) if !e.is_pending() => return self.resume_from_wait().await,
                            Ok(_) => {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                events = self.deps.state.subscribe_events();
                            }
                            Err(e) => return WaitResult::Error(format!("escalation lookup: {}", e)),
                        }
                    }
                },
                interrupt = wait_interrupt(&mut control) => {
                    return WaitResult::Interrupted(interrupt);
                }
            }
        }
    }

    async fn resume_from_wait(&self) -> WaitResult {
        if let Err(e) = self.set_worker_status(WorkerStatus::Running).await {
            return WaitResult::Error(format!("worker status: {}", e));
        }
        info!(worker_id = %self.worker_id, "Escalation resolved, resuming");
        WaitResult::Resumed
    }

    /// Whether this observation is the second strike on the task
    async fn should_strike(&self, task_id: &str, observation: &Observation) -> bool {
        let struck = !observation.on_track || observation.quality == crate::domain::Quality::Poor;
        if !struck {
            return false;
        }
        let strikes_needed = self.deps.observer_config.strikes_before_fail as usize;
        if strikes_needed <= 1 {
            return true;
        }

        // Count trailing consecutive bad observations for this task
        let observations = self
            .deps
            .state
            .list_observations(Some(self.worker_id.clone()), Some(task_id.to_string()))
            .await
            .unwrap_or_default();
        let trailing_bad = observations
            .iter()
            .rev()
            .take_while(|o| !o.on_track || o.quality == crate::domain::Quality::Poor)
            .count();
        trailing_bad >= strikes_needed
    }

    /// Empty claim: either everything is done or nothing is eligible
    async fn finalize(&self) -> SupervisorExit {
        let stats = match self.deps.state.task_stats(&self.outcome_id).await {
            Ok(stats) => stats,
            Err(e) => return self.fail_worker(format!("stats: {}", e)).await,
        };
        let outcome = match self.deps.state.get_outcome_required(&self.outcome_id).await {
            Ok(outcome) => outcome,
            Err(e) => return self.fail_worker(format!("outcome: {}", e)).await,
        };

        let no_open_work = stats.pending == 0 && stats.claimed == 0 && stats.running == 0;
        let converged = is_converged(
            &outcome.convergence,
            self.deps.review_config.convergence_cycles,
        );

        let status = if no_open_work && converged {
            WorkerStatus::Completed
        } else {
            WorkerStatus::Idle
        };
        if let Err(e) = self.set_worker_status(status).await {
            return SupervisorExit::Failed {
                reason: format!("worker status: {}", e),
            };
        }
        info!(worker_id = %self.worker_id, ?status, "Supervisor finished");
        match status {
            WorkerStatus::Completed => SupervisorExit::Completed,
            _ => SupervisorExit::Idle,
        }
    }

    fn check_control(&mut self) -> Option<Interrupt> {
        match *self.control.borrow_and_update() {
            ControlSignal::Run => None,
            ControlSignal::Pause => Some(Interrupt::Pause),
            ControlSignal::Stop { fail } => Some(Interrupt::Stop { fail }),
        }
    }

    /// Wind down after an interrupt, releasing any claimed task with
    /// attempts unchanged
    async fn interrupted(&self, interrupt: Interrupt, task_id: Option<&str>) -> SupervisorExit {
        if let Some(task_id) = task_id {
            let _ = self.deps.state.release_task(task_id).await;
        }
        match interrupt {
            Interrupt::Pause => {
                let _ = self.set_worker_status(WorkerStatus::Paused).await;
                info!(worker_id = %self.worker_id, "Supervisor paused");
                SupervisorExit::Paused
            }
            Interrupt::Stop { fail } => {
                let status = if fail { WorkerStatus::Failed } else { WorkerStatus::Paused };
                let _ = self.set_worker_status(status).await;
                info!(worker_id = %self.worker_id, ?status, "Supervisor stopped");
                SupervisorExit::Stopped
            }
        }
    }

    async fn fail_worker(&self, reason: String) -> SupervisorExit {
        warn!(worker_id = %self.worker_id, %reason, "Supervisor failing");
        let _ = self.set_worker_status(WorkerStatus::Failed).await;
        SupervisorExit::Failed { reason }
    }

    async fn set_worker_status(&self, status: WorkerStatus) -> Result<(), StateError> {
        let mut worker = self.deps.state.get_worker_required(&self.worker_id).await?;
        worker.set_status(status);
        if !worker.is_active() {
            worker.current_task = None;
        }
        self.deps.state.update_worker(worker).await
    }
}

enum WaitResult {
    Resumed,
    Interrupted(Interrupt),
    Error(String),
}

/// Resolve once the control channel leaves `Run`
async fn wait_interrupt(control: &mut watch::Receiver<ControlSignal>) -> Interrupt {
    loop {
        match *control.borrow_and_update() {
            ControlSignal::Run => {}
            ControlSignal::Pause => return Interrupt::Pause,
            ControlSignal::Stop { fail } => return Interrupt::Stop { fail },
        }
        if control.changed().await.is_err() {
            // Sender gone; treat as a soft stop
            return Interrupt::Stop { fail: false };
        }
    }
}
