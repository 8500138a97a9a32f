//! WorkerManager - spawns and tracks supervisors
//!
//! One supervisor task per running worker, capped by a semaphore. The
//! manager owns the control channels, the per-worker worktree lifecycle
//! (acquire on start, release on every exit path), and the merge hand-off
//! when a worker completes in worktree mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::CapabilityScanner;
use crate::domain::{GitMode, Observation, Worker, WorkerStatus};
use crate::error::{EngineError, EngineResult};
use crate::state::StateManager;
use crate::worktree::{MergeCoordinator, WorktreeManager};
use crate::workspace::Workspace;

use super::engine::{ControlSignal, RalphEngine, SupervisorDeps, SupervisorExit};

/// Options for starting a worker
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Optional display name; generated when absent
    pub name: Option<String>,
    /// Allow multiple running workers on the outcome
    pub parallel: bool,
    /// Isolate the worker in a git worktree with its own branch
    pub worktree: bool,
}

/// Live view of one worker for status surfaces
#[derive(Debug, Clone)]
pub struct LiveStatus {
    pub worker: Worker,
    pub current_task_title: Option<String>,
    pub last_observation: Option<Observation>,
}

struct WorkerHandle {
    control: watch::Sender<ControlSignal>,
    join: JoinHandle<SupervisorExit>,
}

/// Spawns, tracks, and controls worker supervisors
pub struct WorkerManager {
    deps: SupervisorDeps,
    workspace: Workspace,
    worktrees: Arc<WorktreeManager>,
    merges: MergeCoordinator,
    scanner: CapabilityScanner,
    semaphore: Arc<Semaphore>,
    handles: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerManager {
    pub fn new(
        deps: SupervisorDeps,
        workspace: Workspace,
        worktrees: Arc<WorktreeManager>,
        merges: MergeCoordinator,
        scanner: CapabilityScanner,
        max_workers: usize,
    ) -> Self {
        Self {
            deps,
            workspace,
            worktrees,
            merges,
            scanner,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self) -> &StateManager {
        &self.deps.state
    }

    /// Start a new worker on an outcome
    ///
    /// Validates the leaf/work/parallel rules (in the state actor),
    /// prepares the workspace and capability gate, acquires a worktree in
    /// worktree mode, and spawns the supervisor.
    pub async fn start_worker(&self, outcome_id: &str, options: StartOptions) -> EngineResult<String> {
        let mut outcome = self.state().get_outcome_required(outcome_id).await?;

        if options.parallel && !outcome.parallel {
            outcome.parallel = true;
            outcome.touch();
            self.state().update_outcome(outcome.clone()).await?;
        }
        if options.worktree && outcome.git_mode != GitMode::Worktree {
            outcome.git_mode = GitMode::Worktree;
            outcome.touch();
            self.state().update_outcome(outcome.clone()).await?;
        }

        // Workspace directory doubles as the sidecar working dir when the
        // outcome has no dedicated checkout
        let workspace_dir = self
            .workspace
            .ensure_layout(outcome_id)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.scanner
            .sync(outcome_id)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;

        self.deps.planner.ensure_gate(outcome_id).await?;

        let name = options
            .name
            .unwrap_or_else(|| format!("worker-{}", &outcome.id[..6.min(outcome.id.len())]));
        let mut worker = Worker::new(outcome_id, name);

        let work_dir = if outcome.git_mode == GitMode::Worktree {
            let repo_root = outcome.work_dir.clone().ok_or_else(|| {
                EngineError::validation(format!(
                    "outcome {} has worktree mode but no working directory",
                    outcome_id
                ))
            })?;
            let info = self
                .worktrees
                .create(
                    PathBuf::from(&repo_root).as_path(),
                    &worker.id,
                    outcome.work_branch.as_deref(),
                )
                .await
                .map_err(|e| match e {
                    crate::worktree::WorktreeError::BranchExists(b) => {
                        EngineError::conflict(format!("branch {} exists", b))
                    }
                    other => EngineError::internal(other.to_string()),
                })?;
            worker.branch = Some(info.branch.clone());
            info.path
        } else if let Some(dir) = &outcome.work_dir {
            PathBuf::from(dir)
        } else {
            workspace_dir
        };

        let worker_id = match self.state().create_worker(worker.clone()).await {
            Ok(id) => id,
            Err(e) => {
                // Leave no orphaned worktree behind a failed start
                if worker.branch.is_some()
                    && let Some(repo) = outcome.work_dir.as_deref()
                {
                    let _ = self.worktrees.remove(PathBuf::from(repo).as_path(), &worker.id).await;
                }
                return Err(e.into());
            }
        };

        self.spawn_supervisor(&worker_id, outcome_id, work_dir).await?;
        Ok(worker_id)
    }

    /// Resume a paused or idle worker
    pub async fn resume_worker(&self, worker_id: &str) -> EngineResult<()> {
        let worker = self.state().get_worker_required(worker_id).await?;
        if worker.is_active() {
            return Err(EngineError::conflict(format!("worker {} is already live", worker_id)));
        }
        if worker.is_terminal() {
            return Err(EngineError::conflict(format!(
                "worker {} is {} and cannot resume",
                worker_id, worker.status
            )));
        }
        let outcome = self.state().get_outcome_required(&worker.outcome_id).await?;

        let work_dir = if let Some(_branch) = &worker.branch {
            let repo_root = outcome.work_dir.clone().ok_or_else(|| {
                EngineError::validation("outcome lost its working directory".to_string())
            })?;
            let repo = PathBuf::from(&repo_root);
            if self.worktrees.exists(worker_id) {
                self.worktrees.worktree_path(worker_id)
            } else {
                self.worktrees
                    .attach(repo.as_path(), worker_id)
                    .await
                    .map_err(|e| EngineError::internal(e.to_string()))?
                    .path
            }
        } else if let Some(dir) = &outcome.work_dir {
            PathBuf::from(dir)
        } else {
            self.workspace
                .ensure_layout(&worker.outcome_id)
                .map_err(|e| EngineError::internal(e.to_string()))?
        };

        self.spawn_supervisor(worker_id, &worker.outcome_id, work_dir).await
    }

    async fn spawn_supervisor(
        &self,
        worker_id: &str,
        outcome_id: &str,
        work_dir: PathBuf,
    ) -> EngineResult<()> {
        let mut worker = self.state().get_worker_required(worker_id).await?;
        worker.set_status(WorkerStatus::Running);
        self.state().update_worker(worker).await?;

        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
        let engine = RalphEngine::new(
            self.deps.clone(),
            worker_id,
            outcome_id,
            work_dir,
            control_rx,
        );

        let semaphore = Arc::clone(&self.semaphore);
        let state = self.state().clone();
        let worktrees = Arc::clone(&self.worktrees);
        let merges = self.merges.clone();
        let spawned_worker = worker_id.to_string();
        let spawned_outcome = outcome_id.to_string();

        let join = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("worker semaphore closed");
            let exit = engine.run().await;
            finalize_worktree(&state, &worktrees, &merges, &spawned_worker, &spawned_outcome, &exit).await;
            exit
        });

        self.handles.lock().await.insert(
            worker_id.to_string(),
            WorkerHandle {
                control: control_tx,
                join,
            },
        );
        info!(%worker_id, %outcome_id, "Supervisor spawned");
        Ok(())
    }

    /// Pause a running worker at its next suspension point
    pub async fn pause_worker(&self, worker_id: &str) -> EngineResult<()> {
        self.signal(worker_id, ControlSignal::Pause).await
    }

    /// Stop a worker; `fail` marks it failed instead of paused
    pub async fn stop_worker(&self, worker_id: &str, fail: bool) -> EngineResult<()> {
        self.signal(worker_id, ControlSignal::Stop { fail }).await
    }

    async fn signal(&self, worker_id: &str, signal: ControlSignal) -> EngineResult<()> {
        let handles = self.handles.lock().await;
        let Some(handle) = handles.get(worker_id) else {
            // Not running in this process; verify it exists for a clean error
            let worker = self.state().get_worker_required(worker_id).await?;
            return Err(EngineError::conflict(format!(
                "worker {} has no live supervisor (status {})",
                worker_id, worker.status
            )));
        };
        handle
            .control
            .send(signal)
            .map_err(|_| EngineError::internal("control channel closed".to_string()))?;
        debug!(%worker_id, ?signal, "Control signal sent");
        Ok(())
    }

    /// Stop every live worker of an outcome; returns how many were signalled
    pub async fn stop_all(&self, outcome_id: &str) -> EngineResult<usize> {
        let workers = self
            .state()
            .list_workers(Some(outcome_id.to_string()), None)
            .await?;

        let mut signalled = 0;
        {
            let handles = self.handles.lock().await;
            for worker in &workers {
                if let Some(handle) = handles.get(&worker.id)
                    && handle.control.send(ControlSignal::Stop { fail: false }).is_ok()
                {
                    signalled += 1;
                }
            }
        }
        info!(outcome_id, signalled, "Stop-all signalled");
        Ok(signalled)
    }

    /// Wait for a worker's supervisor to finish and return its exit
    pub async fn join_worker(&self, worker_id: &str) -> EngineResult<SupervisorExit> {
        let handle = self.handles.lock().await.remove(worker_id);
        let Some(handle) = handle else {
            return Err(EngineError::not_found(format!("no live supervisor for {}", worker_id)));
        };
        handle
            .join
            .await
            .map_err(|e| EngineError::internal(format!("supervisor task panicked: {}", e)))
    }

    /// Wait for every tracked supervisor to finish
    pub async fn join_all(&self) -> Vec<(String, SupervisorExit)> {
        let handles: Vec<(String, WorkerHandle)> = self.handles.lock().await.drain().collect();
        let mut exits = Vec::with_capacity(handles.len());
        let joins = handles.into_iter().map(|(id, h)| async move {
            let exit = h
                .join
                .await
                .unwrap_or(SupervisorExit::Failed {
                    reason: "supervisor task panicked".to_string(),
                });
            (id, exit)
        });
        for result in futures::future::join_all(joins).await {
            exits.push(result);
        }
        exits
    }

    /// Live status for list/status surfaces
    pub async fn live_status(&self, worker_id: &str) -> EngineResult<LiveStatus> {
        let worker = self.state().get_worker_required(worker_id).await?;
        let current_task_title = match &worker.current_task {
            Some(task_id) => self.state().get_task(task_id).await?.map(|t| t.title),
            None => None,
        };
        let last_observation = match &worker.last_observation {
            Some(obs_id) => self.state().get_observation(obs_id).await?,
            None => None,
        };
        Ok(LiveStatus {
            worker,
            current_task_title,
            last_observation,
        })
    }
}

/// Release the worker's worktree according to how the supervisor ended
///
/// Completion merges the branch and removes the worktree; pause detaches
/// the checkout but keeps the branch; failure detaches so the work stays
/// inspectable.
async fn finalize_worktree(
    state: &StateManager,
    worktrees: &WorktreeManager,
    merges: &MergeCoordinator,
    worker_id: &str,
    outcome_id: &str,
    exit: &SupervisorExit,
) {
    let Ok(Some(worker)) = state.get_worker(worker_id).await else {
        return;
    };
    if worker.branch.is_none() {
        return;
    }
    let Ok(Some(outcome)) = state.get_outcome(outcome_id).await else {
        return;
    };
    let Some(repo_root) = outcome.work_dir else {
        return;
    };
    let repo = PathBuf::from(repo_root);

    match exit {
        SupervisorExit::Completed | SupervisorExit::Idle => {
            match merges.queue(outcome_id, worker_id).await {
                Ok(_) => {
                    if let Err(e) = merges.process_queue(outcome_id).await {
                        warn!(%worker_id, error = %e, "Merge processing failed");
                    }
                }
                Err(e) => warn!(%worker_id, error = %e, "Merge queue failed"),
            }
            if let Err(e) = worktrees.remove(repo.as_path(), worker_id).await {
                warn!(%worker_id, error = %e, "Worktree removal failed");
            }
        }
        SupervisorExit::Paused | SupervisorExit::Stopped | SupervisorExit::Failed { .. } => {
            if let Err(e) = worktrees.detach(repo.as_path(), worker_id).await {
                warn!(%worker_id, error = %e, "Worktree detach failed");
            }
        }
    }
}
