//! StateManager - actor that owns the record store
//!
//! All persistence flows through one actor task, which serializes every
//! mutation and wraps multi-row operations (claim, decomposition,
//! escalation resolution, merge transitions) in store transactions. The
//! handle is cheap to clone; consumers get replies over oneshot channels
//! and live updates over a broadcast channel.

use std::path::Path;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use outcomestore::{Filter, Store, StoreResult, StoreTxn};

use crate::domain::{
    AnalysisJob, BREAK_INTO_SUBTASKS, Capability, CapabilityReady, Escalation, EscalationStatus,
    JobStatus, MergeRequest, MergeStatus, Observation, Outcome, OutcomeStatus, ProgressEntry,
    ReviewCycle, Task, TaskPhase, TaskStatus, Worker,
};
use crate::tasks::{self, TaskStats};

use super::messages::{StateCommand, StateError, StateEvent, StateResponse};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    event_tx: broadcast::Sender<StateEvent>,
}

macro_rules! request {
    ($self:ident, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply_tx, reply_rx) = oneshot::channel();
        $self
            .tx
            .send(StateCommand::$variant { $($field: $value,)* reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }};
}

impl StateManager {
    /// Spawn a new StateManager actor backed by a file store
    pub fn spawn(store_path: impl AsRef<Path>) -> eyre::Result<Self> {
        let store = Store::open(store_path.as_ref())?;
        Ok(Self::spawn_with_store(store))
    }

    /// Spawn over an in-memory store (tests, dry runs)
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        Ok(Self::spawn_with_store(Store::open_in_memory()?))
    }

    fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(256);

        tokio::spawn(actor_loop(store, rx, event_tx.clone()));
        info!("StateManager spawned");

        Self { tx, event_tx }
    }

    /// Subscribe to state change events
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    /// Request actor shutdown
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StateCommand::Shutdown).await;
    }

    // === Outcome operations ===

    pub async fn create_outcome(&self, outcome: Outcome) -> StateResponse<String> {
        request!(self, CreateOutcome { outcome: outcome })
    }

    pub async fn get_outcome(&self, id: &str) -> StateResponse<Option<Outcome>> {
        request!(self, GetOutcome { id: id.to_string() })
    }

    /// Fetch an outcome, failing with NotFound when absent
    pub async fn get_outcome_required(&self, id: &str) -> StateResponse<Outcome> {
        self.get_outcome(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    pub async fn update_outcome(&self, outcome: Outcome) -> StateResponse<()> {
        request!(self, UpdateOutcome { outcome: outcome })
    }

    pub async fn archive_outcome(&self, id: &str) -> StateResponse<()> {
        request!(self, ArchiveOutcome { id: id.to_string() })
    }

    pub async fn delete_outcome(&self, id: &str) -> StateResponse<()> {
        request!(self, DeleteOutcome { id: id.to_string() })
    }

    pub async fn list_outcomes(
        &self,
        status_filter: Option<String>,
        parent_filter: Option<String>,
    ) -> StateResponse<Vec<Outcome>> {
        request!(self, ListOutcomes {
            status_filter: status_filter,
            parent_filter: parent_filter,
        })
    }

    pub async fn children_of(&self, id: &str) -> StateResponse<Vec<Outcome>> {
        request!(self, ChildrenOf { id: id.to_string() })
    }

    // === Task operations ===

    pub async fn create_tasks(&self, tasks: Vec<Task>) -> StateResponse<Vec<String>> {
        request!(self, CreateTasks { tasks: tasks })
    }

    pub async fn create_task(&self, task: Task) -> StateResponse<String> {
        let mut ids = self.create_tasks(vec![task]).await?;
        ids.pop()
            .ok_or_else(|| StateError::Store("empty id batch".to_string()))
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        request!(self, GetTask { id: id.to_string() })
    }

    pub async fn get_task_required(&self, id: &str) -> StateResponse<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    pub async fn update_task(&self, task: Task) -> StateResponse<()> {
        request!(self, UpdateTask { task: task })
    }

    pub async fn delete_task(&self, id: &str) -> StateResponse<bool> {
        request!(self, DeleteTask { id: id.to_string() })
    }

    pub async fn list_tasks(
        &self,
        outcome_id: &str,
        status_filter: Option<TaskStatus>,
    ) -> StateResponse<Vec<Task>> {
        request!(self, ListTasks {
            outcome_id: outcome_id.to_string(),
            status_filter: status_filter,
        })
    }

    pub async fn task_stats(&self, outcome_id: &str) -> StateResponse<TaskStats> {
        request!(self, TaskStats { outcome_id: outcome_id.to_string() })
    }

    pub async fn claim_task(&self, outcome_id: &str, worker_id: &str) -> StateResponse<Option<Task>> {
        request!(self, ClaimTask {
            outcome_id: outcome_id.to_string(),
            worker_id: worker_id.to_string(),
        })
    }

    pub async fn begin_task(&self, task_id: &str, worker_id: &str) -> StateResponse<()> {
        request!(self, BeginTask {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        })
    }

    pub async fn complete_task(&self, task_id: &str, worker_id: &str) -> StateResponse<()> {
        request!(self, CompleteTask {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        })
    }

    pub async fn fail_task(&self, task_id: &str, worker_id: &str) -> StateResponse<TaskStatus> {
        request!(self, FailTask {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        })
    }

    pub async fn release_task(&self, task_id: &str) -> StateResponse<()> {
        request!(self, ReleaseTask { task_id: task_id.to_string() })
    }

    pub async fn decompose_task(
        &self,
        task_id: &str,
        subtasks: Vec<Task>,
    ) -> StateResponse<Vec<String>> {
        request!(self, DecomposeTask {
            task_id: task_id.to_string(),
            subtasks: subtasks,
        })
    }

    // === Worker operations ===

    pub async fn create_worker(&self, worker: Worker) -> StateResponse<String> {
        request!(self, CreateWorker { worker: worker })
    }

    pub async fn get_worker(&self, id: &str) -> StateResponse<Option<Worker>> {
        request!(self, GetWorker { id: id.to_string() })
    }

    pub async fn get_worker_required(&self, id: &str) -> StateResponse<Worker> {
        self.get_worker(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    pub async fn update_worker(&self, worker: Worker) -> StateResponse<()> {
        request!(self, UpdateWorker { worker: worker })
    }

    pub async fn list_workers(
        &self,
        outcome_filter: Option<String>,
        status_filter: Option<String>,
    ) -> StateResponse<Vec<Worker>> {
        request!(self, ListWorkers {
            outcome_filter: outcome_filter,
            status_filter: status_filter,
        })
    }

    // === Progress operations ===

    pub async fn append_progress(&self, entry: ProgressEntry) -> StateResponse<u64> {
        request!(self, AppendProgress { entry: entry })
    }

    pub async fn list_progress(&self, worker_id: &str) -> StateResponse<Vec<ProgressEntry>> {
        request!(self, ListProgress { worker_id: worker_id.to_string() })
    }

    // === Observation operations ===

    pub async fn put_observation(&self, observation: Observation) -> StateResponse<String> {
        request!(self, PutObservation { observation: observation })
    }

    pub async fn get_observation(&self, id: &str) -> StateResponse<Option<Observation>> {
        request!(self, GetObservation { id: id.to_string() })
    }

    pub async fn list_observations(
        &self,
        worker_filter: Option<String>,
        task_filter: Option<String>,
    ) -> StateResponse<Vec<Observation>> {
        request!(self, ListObservations {
            worker_filter: worker_filter,
            task_filter: task_filter,
        })
    }

    // === Escalation operations ===

    pub async fn open_escalation(&self, escalation: Escalation) -> StateResponse<String> {
        request!(self, OpenEscalation { escalation: escalation })
    }

    pub async fn get_escalation(&self, id: &str) -> StateResponse<Option<Escalation>> {
        request!(self, GetEscalation { id: id.to_string() })
    }

    pub async fn get_escalation_required(&self, id: &str) -> StateResponse<Escalation> {
        self.get_escalation(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    pub async fn resolve_escalation(
        &self,
        id: &str,
        selected_option: Option<String>,
        context: Option<String>,
        confidence: Option<f64>,
        dismiss: bool,
    ) -> StateResponse<Escalation> {
        request!(self, ResolveEscalation {
            id: id.to_string(),
            selected_option: selected_option,
            context: context,
            confidence: confidence,
            dismiss: dismiss,
        })
    }

    pub async fn update_escalation(&self, escalation: Escalation) -> StateResponse<()> {
        request!(self, UpdateEscalation { escalation: escalation })
    }

    pub async fn list_escalations(
        &self,
        outcome_filter: Option<String>,
        pending_only: bool,
    ) -> StateResponse<Vec<Escalation>> {
        request!(self, ListEscalations {
            outcome_filter: outcome_filter,
            pending_only: pending_only,
        })
    }

    // === Capability operations ===

    pub async fn put_capability(&self, capability: Capability) -> StateResponse<String> {
        request!(self, PutCapability { capability: capability })
    }

    pub async fn list_capabilities(&self, outcome_id: &str) -> StateResponse<Vec<Capability>> {
        request!(self, ListCapabilities { outcome_id: outcome_id.to_string() })
    }

    pub async fn delete_capability(&self, id: &str) -> StateResponse<bool> {
        request!(self, DeleteCapability { id: id.to_string() })
    }

    // === Review operations ===

    pub async fn put_review_cycle(&self, cycle: ReviewCycle) -> StateResponse<String> {
        request!(self, PutReviewCycle { cycle: cycle })
    }

    pub async fn latest_review_cycle(&self, outcome_id: &str) -> StateResponse<Option<ReviewCycle>> {
        request!(self, LatestReviewCycle { outcome_id: outcome_id.to_string() })
    }

    pub async fn list_review_cycles(&self, outcome_id: &str) -> StateResponse<Vec<ReviewCycle>> {
        request!(self, ListReviewCycles { outcome_id: outcome_id.to_string() })
    }

    // === Retro operations ===

    pub async fn create_analysis_job(&self, job: AnalysisJob) -> StateResponse<String> {
        request!(self, CreateAnalysisJob { job: job })
    }

    pub async fn get_analysis_job(&self, id: &str) -> StateResponse<Option<AnalysisJob>> {
        request!(self, GetAnalysisJob { id: id.to_string() })
    }

    pub async fn update_analysis_job(&self, job: AnalysisJob) -> StateResponse<()> {
        request!(self, UpdateAnalysisJob { job: job })
    }

    pub async fn list_analysis_jobs(&self, outcome_id: &str) -> StateResponse<Vec<AnalysisJob>> {
        request!(self, ListAnalysisJobs { outcome_id: outcome_id.to_string() })
    }

    // === Merge queue operations ===

    pub async fn create_merge(&self, merge: MergeRequest) -> StateResponse<String> {
        request!(self, CreateMerge { merge: merge })
    }

    pub async fn get_merge(&self, id: &str) -> StateResponse<Option<MergeRequest>> {
        request!(self, GetMerge { id: id.to_string() })
    }

    pub async fn update_merge_status(
        &self,
        id: &str,
        status: MergeStatus,
        conflicts: Vec<String>,
        error: Option<String>,
    ) -> StateResponse<()> {
        request!(self, UpdateMergeStatus {
            id: id.to_string(),
            status: status,
            conflicts: conflicts,
            error: error,
        })
    }

    pub async fn list_merges(
        &self,
        outcome_id: &str,
        status_filter: Option<MergeStatus>,
    ) -> StateResponse<Vec<MergeRequest>> {
        request!(self, ListMerges {
            outcome_id: outcome_id.to_string(),
            status_filter: status_filter,
        })
    }
}

/// The actor task: single owner of the store
async fn actor_loop(
    mut store: Store,
    mut rx: mpsc::Receiver<StateCommand>,
    event_tx: broadcast::Sender<StateEvent>,
) {
    info!("State actor started");

    let emit = |event: StateEvent| {
        // No subscribers is fine; events are best-effort
        let _ = event_tx.send(event);
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateOutcome { outcome, reply } => {
                let _ = reply.send(op_create_outcome(&mut store, outcome));
            }
            StateCommand::GetOutcome { id, reply } => {
                let _ = reply.send(store.get::<Outcome>(&id).map_err(Into::into));
            }
            StateCommand::UpdateOutcome { outcome, reply } => {
                let _ = reply.send(op_update_outcome(&mut store, outcome));
            }
            StateCommand::ArchiveOutcome { id, reply } => {
                let _ = reply.send(op_archive_outcome(&mut store, &id));
            }
            StateCommand::DeleteOutcome { id, reply } => {
                let _ = reply.send(op_delete_outcome(&mut store, &id));
            }
            StateCommand::ListOutcomes {
                status_filter,
                parent_filter,
                reply,
            } => {
                let mut filters = Vec::new();
                if let Some(status) = status_filter {
                    filters.push(Filter::eq("status", status));
                }
                if let Some(parent) = parent_filter {
                    filters.push(Filter::eq("parent", parent));
                }
                let _ = reply.send(store.list::<Outcome>(&filters).map_err(Into::into));
            }
            StateCommand::ChildrenOf { id, reply } => {
                let _ = reply.send(
                    store
                        .list::<Outcome>(&[Filter::eq("parent", id.as_str())])
                        .map_err(Into::into),
                );
            }

            StateCommand::CreateTasks { tasks, reply } => {
                let result = op_create_tasks(&mut store, tasks);
                if let Ok(ids) = &result {
                    for id in ids {
                        emit(StateEvent::TaskUpdated { id: id.clone() });
                    }
                }
                let _ = reply.send(result);
            }
            StateCommand::GetTask { id, reply } => {
                let _ = reply.send(store.get::<Task>(&id).map_err(Into::into));
            }
            StateCommand::UpdateTask { task, reply } => {
                let id = task.id.clone();
                let result = op_update_task(&mut store, task);
                if result.is_ok() {
                    emit(StateEvent::TaskUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::DeleteTask { id, reply } => {
                let _ = reply.send(store.delete::<Task>(&id).map_err(Into::into));
            }
            StateCommand::ListTasks {
                outcome_id,
                status_filter,
                reply,
            } => {
                let mut filters = vec![Filter::eq("outcome", outcome_id.as_str())];
                if let Some(status) = status_filter {
                    filters.push(Filter::eq("status", status.to_string()));
                }
                let _ = reply.send(store.list::<Task>(&filters).map_err(Into::into));
            }
            StateCommand::TaskStats { outcome_id, reply } => {
                let result = store
                    .list::<Task>(&[Filter::eq("outcome", outcome_id.as_str())])
                    .map(|tasks| tasks::task_stats(&tasks))
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            StateCommand::ClaimTask {
                outcome_id,
                worker_id,
                reply,
            } => {
                let result = op_claim_task(&mut store, &outcome_id, &worker_id);
                if let Ok(Some(task)) = &result {
                    emit(StateEvent::TaskUpdated { id: task.id.clone() });
                    emit(StateEvent::WorkerUpdated { id: worker_id.clone() });
                }
                let _ = reply.send(result);
            }
            StateCommand::BeginTask {
                task_id,
                worker_id,
                reply,
            } => {
                let result = op_begin_task(&mut store, &task_id, &worker_id);
                if result.is_ok() {
                    emit(StateEvent::TaskUpdated { id: task_id });
                }
                let _ = reply.send(result);
            }
            StateCommand::CompleteTask {
                task_id,
                worker_id,
                reply,
            } => {
                let result = op_complete_task(&mut store, &task_id, &worker_id);
                if result.is_ok() {
                    emit(StateEvent::TaskUpdated { id: task_id });
                    emit(StateEvent::WorkerUpdated { id: worker_id });
                }
                let _ = reply.send(result);
            }
            StateCommand::FailTask {
                task_id,
                worker_id,
                reply,
            } => {
                let result = op_fail_task(&mut store, &task_id, &worker_id);
                if result.is_ok() {
                    emit(StateEvent::TaskUpdated { id: task_id });
                }
                let _ = reply.send(result);
            }
            StateCommand::ReleaseTask { task_id, reply } => {
                let result = op_release_task(&mut store, &task_id);
                if result.is_ok() {
                    emit(StateEvent::TaskUpdated { id: task_id });
                }
                let _ = reply.send(result);
            }
            StateCommand::DecomposeTask {
                task_id,
                subtasks,
                reply,
            } => {
                let result = op_decompose_task(&mut store, &task_id, subtasks);
                if result.is_ok() {
                    emit(StateEvent::TaskUpdated { id: task_id });
                }
                let _ = reply.send(result);
            }

            StateCommand::CreateWorker { worker, reply } => {
                let result = op_create_worker(&mut store, worker);
                if let Ok(id) = &result {
                    emit(StateEvent::WorkerUpdated { id: id.clone() });
                }
                let _ = reply.send(result);
            }
            StateCommand::GetWorker { id, reply } => {
                let _ = reply.send(store.get::<Worker>(&id).map_err(Into::into));
            }
            StateCommand::UpdateWorker { worker, reply } => {
                let id = worker.id.clone();
                let result = store.put(&worker).map_err(Into::into);
                if result.is_ok() {
                    emit(StateEvent::WorkerUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::ListWorkers {
                outcome_filter,
                status_filter,
                reply,
            } => {
                let mut filters = Vec::new();
                if let Some(outcome) = outcome_filter {
                    filters.push(Filter::eq("outcome", outcome));
                }
                if let Some(status) = status_filter {
                    filters.push(Filter::eq("status", status));
                }
                let _ = reply.send(store.list::<Worker>(&filters).map_err(Into::into));
            }

            StateCommand::AppendProgress { entry, reply } => {
                let _ = reply.send(op_append_progress(&mut store, entry));
            }
            StateCommand::ListProgress { worker_id, reply } => {
                let result = store
                    .list::<ProgressEntry>(&[Filter::eq("worker", worker_id.as_str())])
                    .map(|mut entries| {
                        entries.sort_by_key(|e| e.seq);
                        entries
                    })
                    .map_err(Into::into);
                let _ = reply.send(result);
            }

            StateCommand::PutObservation { observation, reply } => {
                let id = observation.id.clone();
                let _ = reply.send(store.put(&observation).map(|_| id).map_err(Into::into));
            }
            StateCommand::GetObservation { id, reply } => {
                let _ = reply.send(store.get::<Observation>(&id).map_err(Into::into));
            }
            StateCommand::ListObservations {
                worker_filter,
                task_filter,
                reply,
            } => {
                let mut filters = Vec::new();
                if let Some(worker) = worker_filter {
                    filters.push(Filter::eq("worker", worker));
                }
                if let Some(task) = task_filter {
                    filters.push(Filter::eq("task", task));
                }
                let result = store
                    .list::<Observation>(&filters)
                    .map(|mut obs| {
                        obs.sort_by_key(|o| o.iteration);
                        obs
                    })
                    .map_err(Into::into);
                let _ = reply.send(result);
            }

            StateCommand::OpenEscalation { escalation, reply } => {
                let outcome_id = escalation.outcome_id.clone();
                let result = op_open_escalation(&mut store, escalation);
                if let Ok(id) = &result {
                    emit(StateEvent::EscalationOpened {
                        id: id.clone(),
                        outcome_id,
                    });
                }
                let _ = reply.send(result);
            }
            StateCommand::GetEscalation { id, reply } => {
                let _ = reply.send(store.get::<Escalation>(&id).map_err(Into::into));
            }
            StateCommand::ResolveEscalation {
                id,
                selected_option,
                context,
                confidence,
                dismiss,
                reply,
            } => {
                let result =
                    op_resolve_escalation(&mut store, &id, selected_option, context, confidence, dismiss);
                if let Ok(escalation) = &result {
                    emit(StateEvent::EscalationResolved {
                        id: escalation.id.clone(),
                        outcome_id: escalation.outcome_id.clone(),
                    });
                }
                let _ = reply.send(result);
            }
            StateCommand::UpdateEscalation { escalation, reply } => {
                let _ = reply.send(store.put(&escalation).map_err(Into::into));
            }
            StateCommand::ListEscalations {
                outcome_filter,
                pending_only,
                reply,
            } => {
                let mut filters = Vec::new();
                if let Some(outcome) = outcome_filter {
                    filters.push(Filter::eq("outcome", outcome));
                }
                if pending_only {
                    filters.push(Filter::eq("status", "pending"));
                }
                let _ = reply.send(store.list::<Escalation>(&filters).map_err(Into::into));
            }

            StateCommand::PutCapability { capability, reply } => {
                let _ = reply.send(op_put_capability(&mut store, capability));
            }
            StateCommand::ListCapabilities { outcome_id, reply } => {
                let _ = reply.send(
                    store
                        .list::<Capability>(&[Filter::eq("outcome", outcome_id.as_str())])
                        .map_err(Into::into),
                );
            }
            StateCommand::DeleteCapability { id, reply } => {
                let _ = reply.send(store.delete::<Capability>(&id).map_err(Into::into));
            }

            StateCommand::PutReviewCycle { cycle, reply } => {
                let id = cycle.id.clone();
                let _ = reply.send(store.put(&cycle).map(|_| id).map_err(Into::into));
            }
            StateCommand::LatestReviewCycle { outcome_id, reply } => {
                let result = store
                    .list::<ReviewCycle>(&[Filter::eq("outcome", outcome_id.as_str())])
                    .map(|cycles| cycles.into_iter().max_by_key(|c| c.cycle_index))
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            StateCommand::ListReviewCycles { outcome_id, reply } => {
                let result = store
                    .list::<ReviewCycle>(&[Filter::eq("outcome", outcome_id.as_str())])
                    .map(|mut cycles| {
                        cycles.sort_by_key(|c| c.cycle_index);
                        cycles
                    })
                    .map_err(Into::into);
                let _ = reply.send(result);
            }

            StateCommand::CreateAnalysisJob { job, reply } => {
                let _ = reply.send(op_create_analysis_job(&mut store, job));
            }
            StateCommand::GetAnalysisJob { id, reply } => {
                let _ = reply.send(store.get::<AnalysisJob>(&id).map_err(Into::into));
            }
            StateCommand::UpdateAnalysisJob { job, reply } => {
                let _ = reply.send(store.put(&job).map_err(Into::into));
            }
            StateCommand::ListAnalysisJobs { outcome_id, reply } => {
                let _ = reply.send(
                    store
                        .list::<AnalysisJob>(&[Filter::eq("outcome", outcome_id.as_str())])
                        .map_err(Into::into),
                );
            }

            StateCommand::CreateMerge { merge, reply } => {
                let id = merge.id.clone();
                let result = store.put(&merge).map(|_| id.clone()).map_err(Into::into);
                if result.is_ok() {
                    emit(StateEvent::MergeUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::GetMerge { id, reply } => {
                let _ = reply.send(store.get::<MergeRequest>(&id).map_err(Into::into));
            }
            StateCommand::UpdateMergeStatus {
                id,
                status,
                conflicts,
                error,
                reply,
            } => {
                let result = op_update_merge_status(&mut store, &id, status, conflicts, error);
                if result.is_ok() {
                    emit(StateEvent::MergeUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::ListMerges {
                outcome_id,
                status_filter,
                reply,
            } => {
                let mut filters = vec![Filter::eq("outcome", outcome_id.as_str())];
                if let Some(status) = status_filter {
                    filters.push(Filter::eq("status", status.to_string()));
                }
                let result = store
                    .list::<MergeRequest>(&filters)
                    .map(|mut merges| {
                        merges.sort_by_key(|m| m.created_at);
                        merges
                    })
                    .map_err(Into::into);
                let _ = reply.send(result);
            }

            StateCommand::Shutdown => {
                info!("State actor shutting down");
                break;
            }
        }
    }

    info!("State actor stopped");
}

// === Operation implementations ===

fn op_create_outcome(store: &mut Store, outcome: Outcome) -> StateResponse<String> {
    if outcome.name.trim().is_empty() {
        return Err(StateError::Validation("outcome name is empty".to_string()));
    }
    if let Some(parent) = &outcome.parent
        && store.get::<Outcome>(parent)?.is_none()
    {
        return Err(StateError::NotFound(parent.clone()));
    }
    let id = outcome.id.clone();
    store.put(&outcome)?;
    debug!(outcome_id = %id, name = %outcome.name, "Outcome created");
    Ok(id)
}

fn op_update_outcome(store: &mut Store, outcome: Outcome) -> StateResponse<()> {
    if store.get::<Outcome>(&outcome.id)?.is_none() {
        return Err(StateError::NotFound(outcome.id.clone()));
    }
    if outcome.name.trim().is_empty() {
        return Err(StateError::Validation("outcome name is empty".to_string()));
    }
    store.put(&outcome)?;
    Ok(())
}

fn op_archive_outcome(store: &mut Store, id: &str) -> StateResponse<()> {
    let mut outcome = store
        .get::<Outcome>(id)?
        .ok_or_else(|| StateError::NotFound(id.to_string()))?;
    if outcome.status == OutcomeStatus::Archived {
        return Ok(());
    }
    outcome.set_status(OutcomeStatus::Archived);
    store.put(&outcome)?;
    info!(outcome_id = %id, "Outcome archived");
    Ok(())
}

fn op_delete_outcome(store: &mut Store, id: &str) -> StateResponse<()> {
    if store.get::<Outcome>(id)?.is_none() {
        return Err(StateError::NotFound(id.to_string()));
    }
    let children = store.list::<Outcome>(&[Filter::eq("parent", id)])?;
    if !children.is_empty() {
        return Err(StateError::Validation(format!(
            "outcome {} has {} children",
            id,
            children.len()
        )));
    }
    let tasks = store.list::<Task>(&[Filter::eq("outcome", id)])?;
    if !tasks.is_empty() {
        return Err(StateError::Validation(format!(
            "outcome {} has {} tasks",
            id,
            tasks.len()
        )));
    }
    store.delete::<Outcome>(id)?;
    Ok(())
}

fn op_create_tasks(store: &mut Store, tasks: Vec<Task>) -> StateResponse<Vec<String>> {
    if tasks.is_empty() {
        return Err(StateError::Validation("empty task batch".to_string()));
    }
    for task in &tasks {
        if task.title.trim().is_empty() {
            return Err(StateError::Validation("task title is empty".to_string()));
        }
    }
    let outcome_id = tasks[0].outcome_id.clone();
    if tasks.iter().any(|t| t.outcome_id != outcome_id) {
        return Err(StateError::Validation(
            "task batch spans multiple outcomes".to_string(),
        ));
    }
    if store.get::<Outcome>(&outcome_id)?.is_none() {
        return Err(StateError::NotFound(outcome_id));
    }

    let existing = store.list::<Task>(&[Filter::eq("outcome", tasks[0].outcome_id.as_str())])?;
    tasks::validate_dependencies(&tasks, &existing).map_err(StateError::Validation)?;

    let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    store.transaction(|txn| {
        for task in &tasks {
            txn.put(task)?;
        }
        Ok(())
    })?;
    debug!(count = ids.len(), "Tasks created");
    Ok(ids)
}

fn op_update_task(store: &mut Store, task: Task) -> StateResponse<()> {
    let stored = store
        .get::<Task>(&task.id)?
        .ok_or_else(|| StateError::NotFound(task.id.clone()))?;
    if stored.outcome_id != task.outcome_id {
        return Err(StateError::Validation(format!(
            "task {} belongs to another outcome",
            task.id
        )));
    }
    if task.title.trim().is_empty() {
        return Err(StateError::Validation("task title is empty".to_string()));
    }
    let existing = store.list::<Task>(&[Filter::eq("outcome", task.outcome_id.as_str())])?;
    tasks::validate_dependencies(std::slice::from_ref(&task), &existing)
        .map_err(StateError::Validation)?;
    store.put(&task)?;
    Ok(())
}

fn op_claim_task(store: &mut Store, outcome_id: &str, worker_id: &str) -> StateResponse<Option<Task>> {
    let claimed = store.transaction(|txn| {
        let outcome = txn.get_required::<Outcome>(outcome_id)?;
        let mut worker = txn.get_required::<Worker>(worker_id)?;
        let all_tasks = txn.list::<Task>(&[Filter::eq("outcome", outcome_id)])?;
        let escalations = txn.list::<Escalation>(&[
            Filter::eq("outcome", outcome_id),
            Filter::eq("status", "pending"),
        ])?;
        let capabilities = txn.list::<Capability>(&[Filter::eq("outcome", outcome_id)])?;

        let Some(selected) = tasks::select_claimable(&outcome, &all_tasks, &escalations, &capabilities)
        else {
            return Ok(None);
        };

        let mut task = selected.clone();
        task.set_status(TaskStatus::Claimed);
        task.claimed_by = Some(worker_id.to_string());
        txn.put(&task)?;

        worker.current_task = Some(task.id.clone());
        worker.updated_at = outcomestore::now_ms();
        txn.put(&worker)?;

        Ok(Some(task))
    })?;

    if claimed.is_none() {
        // Distinguish a wedged capability gate from genuinely empty work
        let outcome = store
            .get::<Outcome>(outcome_id)?
            .ok_or_else(|| StateError::NotFound(outcome_id.to_string()))?;
        if outcome.capability_ready != CapabilityReady::Ready {
            let all_tasks = store.list::<Task>(&[Filter::eq("outcome", outcome_id)])?;
            let pending_capability = all_tasks
                .iter()
                .any(|t| t.status == TaskStatus::Pending && t.phase == TaskPhase::Capability);
            let pending_execution = all_tasks
                .iter()
                .any(|t| t.status == TaskStatus::Pending && t.phase == TaskPhase::Execution);
            if !pending_capability && pending_execution {
                return Err(StateError::CapabilityNotReady(outcome_id.to_string()));
            }
        }
    }

    Ok(claimed)
}

fn op_begin_task(store: &mut Store, task_id: &str, worker_id: &str) -> StateResponse<()> {
    let mut task = store
        .get::<Task>(task_id)?
        .ok_or_else(|| StateError::NotFound(task_id.to_string()))?;
    if task.status != TaskStatus::Claimed || task.claimed_by.as_deref() != Some(worker_id) {
        return Err(StateError::Conflict(format!(
            "task {} is not claimed by worker {}",
            task_id, worker_id
        )));
    }
    task.set_status(TaskStatus::Running);
    store.put(&task)?;
    Ok(())
}

fn op_complete_task(store: &mut Store, task_id: &str, worker_id: &str) -> StateResponse<()> {
    // The actor serializes commands, so this pre-check cannot race the
    // transaction below
    let current = store
        .get::<Task>(task_id)?
        .ok_or_else(|| StateError::NotFound(task_id.to_string()))?;
    if current.claimed_by.as_deref() != Some(worker_id)
        || !matches!(current.status, TaskStatus::Claimed | TaskStatus::Running)
    {
        return Err(StateError::Conflict(format!(
            "task {} has no active claim by worker {}",
            task_id, worker_id
        )));
    }

    store.transaction(|txn| {
        let mut task = txn.get_required::<Task>(task_id)?;
        task.set_status(TaskStatus::Completed);
        task.claimed_by = None;
        txn.put(&task)?;

        if let Some(mut worker) = txn.get::<Worker>(worker_id)? {
            worker.current_task = None;
            worker.updated_at = outcomestore::now_ms();
            txn.put(&worker)?;
        }

        // Completing a capability task may publish its artifact and flip
        // the outcome gate
        if task.phase == TaskPhase::Capability {
            publish_capability(txn, &task)?;
            maybe_flip_gate(txn, &task.outcome_id)?;
        }
        Ok(())
    })?;
    debug!(%task_id, "Task completed");
    Ok(())
}

/// Register the capability artifact a completed capability task provides
fn publish_capability(txn: &mut StoreTxn<'_>, task: &Task) -> StoreResult<()> {
    let Some(reference) = &task.provides else {
        return Ok(());
    };
    let Some(need) = crate::domain::CapabilityNeed::parse(reference) else {
        warn!(%reference, "Unparseable capability reference on task");
        return Ok(());
    };

    let existing = txn.list::<Capability>(&[
        Filter::eq("outcome", task.outcome_id.as_str()),
        Filter::eq("name", need.name.as_str()),
        Filter::eq("kind", need.kind.to_string()),
    ])?;
    if !existing.is_empty() {
        return Ok(());
    }

    let mut capability = Capability::new(&task.outcome_id, need.kind, &need.name);
    capability.source_task = Some(task.id.clone());
    txn.put(&capability)
}

/// Flip capability_ready to ready when no capability work remains
fn maybe_flip_gate(txn: &mut StoreTxn<'_>, outcome_id: &str) -> StoreResult<()> {
    let all_tasks = txn.list::<Task>(&[Filter::eq("outcome", outcome_id)])?;
    let unfinished_capability = all_tasks
        .iter()
        .any(|t| t.phase == TaskPhase::Capability && t.status != TaskStatus::Completed);
    if unfinished_capability {
        return Ok(());
    }
    let mut outcome = txn.get_required::<Outcome>(outcome_id)?;
    if outcome.capability_ready != CapabilityReady::Ready {
        outcome.set_capability_ready(CapabilityReady::Ready);
        txn.put(&outcome)?;
        info!(%outcome_id, "Capability gate flipped to ready");
    }
    Ok(())
}

fn op_fail_task(store: &mut Store, task_id: &str, worker_id: &str) -> StateResponse<TaskStatus> {
    let mut task = store
        .get::<Task>(task_id)?
        .ok_or_else(|| StateError::NotFound(task_id.to_string()))?;
    if task.claimed_by.as_deref() != Some(worker_id) {
        return Err(StateError::Conflict(format!(
            "task {} is not claimed by worker {}",
            task_id, worker_id
        )));
    }
    task.attempts += 1;
    task.claimed_by = None;
    let status = if task.retries_left() {
        TaskStatus::Pending
    } else {
        TaskStatus::Failed
    };
    task.set_status(status);
    store.put(&task)?;

    if let Some(mut worker) = store.get::<Worker>(worker_id)? {
        if worker.current_task.as_deref() == Some(task_id) {
            worker.current_task = None;
            worker.updated_at = outcomestore::now_ms();
            store.put(&worker)?;
        }
    }

    debug!(%task_id, attempts = task.attempts, ?status, "Task failed");
    Ok(status)
}

fn op_release_task(store: &mut Store, task_id: &str) -> StateResponse<()> {
    let mut task = store
        .get::<Task>(task_id)?
        .ok_or_else(|| StateError::NotFound(task_id.to_string()))?;
    if !matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
        return Ok(());
    }
    let holder = task.claimed_by.take();
    task.set_status(TaskStatus::Pending);
    store.put(&task)?;

    if let Some(worker_id) = holder
        && let Some(mut worker) = store.get::<Worker>(&worker_id)?
        && worker.current_task.as_deref() == Some(task_id)
    {
        worker.current_task = None;
        worker.updated_at = outcomestore::now_ms();
        store.put(&worker)?;
    }
    Ok(())
}

fn op_decompose_task(store: &mut Store, task_id: &str, subtasks: Vec<Task>) -> StateResponse<Vec<String>> {
    if subtasks.is_empty() {
        return Err(StateError::Validation("decomposition produced no subtasks".to_string()));
    }
    let original = store
        .get::<Task>(task_id)?
        .ok_or_else(|| StateError::NotFound(task_id.to_string()))?;
    if !matches!(
        original.status,
        TaskStatus::DecompositionPending | TaskStatus::DecompositionInProgress
    ) {
        return Err(StateError::Conflict(format!(
            "task {} is not awaiting decomposition",
            task_id
        )));
    }
    if subtasks.iter().any(|t| t.outcome_id != original.outcome_id) {
        return Err(StateError::Validation(
            "subtask belongs to another outcome".to_string(),
        ));
    }

    let existing = store.list::<Task>(&[Filter::eq("outcome", original.outcome_id.as_str())])?;

    // Dependents of the original now depend on every subtask
    let subtask_ids: Vec<String> = subtasks.iter().map(|t| t.id.clone()).collect();
    let mut rewired: Vec<Task> = Vec::new();
    for task in &existing {
        if task.id != original.id && task.depends_on.iter().any(|d| d == task_id) {
            let mut updated = task.clone();
            updated.depends_on.retain(|d| d != task_id);
            updated.depends_on.extend(subtask_ids.iter().cloned());
            rewired.push(updated);
        }
    }

    // Validate the post-swap graph before touching anything
    let mut future: Vec<Task> = existing.iter().filter(|t| t.id != original.id).cloned().collect();
    for task in &mut future {
        if let Some(r) = rewired.iter().find(|r| r.id == task.id) {
            *task = r.clone();
        }
    }
    tasks::validate_dependencies(&subtasks, &future).map_err(StateError::Validation)?;

    store.transaction(|txn| {
        txn.delete::<Task>(task_id)?;
        for task in &rewired {
            txn.put(task)?;
        }
        for subtask in &subtasks {
            txn.put(subtask)?;
        }
        Ok(())
    })?;

    info!(%task_id, subtask_count = subtask_ids.len(), "Task decomposed");
    Ok(subtask_ids)
}

fn op_create_worker(store: &mut Store, worker: Worker) -> StateResponse<String> {
    let outcome = store
        .get::<Outcome>(&worker.outcome_id)?
        .ok_or_else(|| StateError::NotFound(worker.outcome_id.clone()))?;

    if outcome.is_terminal() {
        return Err(StateError::Validation(format!(
            "outcome {} is {}",
            outcome.id, outcome.status
        )));
    }

    let children = store.list::<Outcome>(&[Filter::eq("parent", outcome.id.as_str())])?;
    if !children.is_empty() {
        return Err(StateError::Validation(format!(
            "outcome {} is not a leaf ({} children)",
            outcome.id,
            children.len()
        )));
    }

    let tasks = store.list::<Task>(&[Filter::eq("outcome", outcome.id.as_str())])?;
    let has_work = tasks.iter().any(|t| t.status == TaskStatus::Pending);
    if !has_work {
        return Err(StateError::Validation(format!(
            "outcome {} has no pending tasks",
            outcome.id
        )));
    }

    if !outcome.parallel {
        let live = store.list::<Worker>(&[Filter::eq("outcome", outcome.id.as_str())])?;
        if live.iter().any(|w| w.is_active()) {
            return Err(StateError::Conflict(format!(
                "outcome {} already has a running worker",
                outcome.id
            )));
        }
    }

    let id = worker.id.clone();
    store.put(&worker)?;
    info!(worker_id = %id, outcome_id = %worker.outcome_id, "Worker created");
    Ok(id)
}

fn op_append_progress(store: &mut Store, mut entry: ProgressEntry) -> StateResponse<u64> {
    let existing = store.list::<ProgressEntry>(&[Filter::eq("worker", entry.worker_id.as_str())])?;
    let next_seq = existing.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
    entry.seq = next_seq;
    store.put(&entry)?;
    Ok(next_seq)
}

fn op_open_escalation(store: &mut Store, escalation: Escalation) -> StateResponse<String> {
    if escalation.question.trim().is_empty() {
        return Err(StateError::Validation("escalation question is empty".to_string()));
    }
    if escalation.options.len() < 2 {
        return Err(StateError::Validation(
            "escalation needs at least two options".to_string(),
        ));
    }
    if store.get::<Outcome>(&escalation.outcome_id)?.is_none() {
        return Err(StateError::NotFound(escalation.outcome_id.clone()));
    }
    for task_id in &escalation.affected_tasks {
        let task = store
            .get::<Task>(task_id)?
            .ok_or_else(|| StateError::NotFound(task_id.clone()))?;
        if task.outcome_id != escalation.outcome_id {
            return Err(StateError::Validation(format!(
                "affected task {} belongs to another outcome",
                task_id
            )));
        }
    }

    let id = escalation.id.clone();
    let offers_decomposition = escalation.offers_decomposition();
    let affected = escalation.affected_tasks.clone();

    store.transaction(|txn| {
        txn.put(&escalation)?;
        // Release claimed work so no affected task stays claimed while
        // the escalation is pending
        for task_id in &affected {
            let mut task = txn.get_required::<Task>(task_id)?;
            if matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
                let holder = task.claimed_by.take();
                let status = if offers_decomposition {
                    TaskStatus::DecompositionPending
                } else {
                    TaskStatus::Pending
                };
                task.set_status(status);
                txn.put(&task)?;

                if let Some(worker_id) = holder
                    && let Some(mut worker) = txn.get::<Worker>(&worker_id)?
                    && worker.current_task.as_deref() == Some(task_id.as_str())
                {
                    worker.current_task = None;
                    worker.updated_at = outcomestore::now_ms();
                    txn.put(&worker)?;
                }
            }
        }
        Ok(())
    })?;

    info!(escalation_id = %id, trigger = %escalation.trigger_type, "Escalation opened");
    Ok(id)
}

fn op_resolve_escalation(
    store: &mut Store,
    id: &str,
    selected_option: Option<String>,
    context: Option<String>,
    confidence: Option<f64>,
    dismiss: bool,
) -> StateResponse<Escalation> {
    let escalation = store
        .get::<Escalation>(id)?
        .ok_or_else(|| StateError::NotFound(id.to_string()))?;
    if !escalation.is_pending() {
        return Err(StateError::Conflict(format!(
            "escalation {} is already {}",
            id, escalation.status
        )));
    }

    if dismiss {
        let mut escalation = escalation;
        escalation.resolve(EscalationStatus::Dismissed, None);
        escalation.user_context = context;
        store.put(&escalation)?;
        info!(escalation_id = %id, "Escalation dismissed");
        return Ok(escalation);
    }

    let selected = selected_option
        .ok_or_else(|| StateError::Validation("no option selected".to_string()))?;
    let option = escalation
        .option(&selected)
        .ok_or_else(|| StateError::Validation(format!("unknown option {}", selected)))?
        .clone();

    let affected = escalation.affected_tasks.clone();
    let decompose = selected == BREAK_INTO_SUBTASKS;

    let resolved = store.transaction(|txn| {
        // Task-side effects land before the escalation flips so a crash
        // never leaves an answered escalation with untouched tasks
        for task_id in &affected {
            let mut task = txn.get_required::<Task>(task_id)?;
            if decompose {
                task.set_status(TaskStatus::DecompositionPending);
            } else {
                let mut note = format!("User decision: {}", option.label);
                if let Some(ctx) = &context {
                    note.push_str(&format!(" ({})", ctx));
                }
                task.append_approach_context(&note);
                if task.status == TaskStatus::DecompositionPending {
                    task.set_status(TaskStatus::Pending);
                }
            }
            txn.put(&task)?;
        }

        let mut escalation = escalation;
        escalation.resolve(EscalationStatus::Answered, Some(selected.clone()));
        escalation.user_context = context.clone();
        escalation.resolution_confidence = confidence;
        txn.put(&escalation)?;
        Ok(escalation)
    })?;

    info!(escalation_id = %id, option = %selected, "Escalation answered");
    Ok(resolved)
}

fn op_put_capability(store: &mut Store, capability: Capability) -> StateResponse<String> {
    // Upsert keyed by (outcome, kind, name)
    let existing = store.list::<Capability>(&[
        Filter::eq("outcome", capability.outcome_id.as_str()),
        Filter::eq("kind", capability.kind.to_string()),
        Filter::eq("name", capability.name.as_str()),
    ])?;

    let record = if let Some(current) = existing.into_iter().next() {
        let mut updated = capability;
        updated.id = current.id;
        updated.created_at = current.created_at;
        updated.updated_at = outcomestore::now_ms();
        updated
    } else {
        capability
    };

    let id = record.id.clone();
    store.put(&record)?;
    Ok(id)
}

fn op_create_analysis_job(store: &mut Store, job: AnalysisJob) -> StateResponse<String> {
    if store.get::<Outcome>(&job.outcome_id)?.is_none() {
        return Err(StateError::NotFound(job.outcome_id.clone()));
    }
    let jobs = store.list::<AnalysisJob>(&[Filter::eq("outcome", job.outcome_id.as_str())])?;
    if jobs
        .iter()
        .any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
    {
        return Err(StateError::Conflict(format!(
            "analysis job already running for {}",
            job.outcome_id
        )));
    }
    let id = job.id.clone();
    store.put(&job)?;
    Ok(id)
}

fn op_update_merge_status(
    store: &mut Store,
    id: &str,
    status: MergeStatus,
    conflicts: Vec<String>,
    error: Option<String>,
) -> StateResponse<()> {
    let mut merge = store
        .get::<MergeRequest>(id)?
        .ok_or_else(|| StateError::NotFound(id.to_string()))?;
    merge.conflicts = conflicts;
    merge.error = error;
    merge.set_status(status);
    store.put(&merge)?;
    Ok(())
}
