//! State manager messages
//!
//! Commands and responses for the actor pattern. Compound commands exist
//! wherever a multi-row mutation must land atomically: claim,
//! decomposition, escalation resolution, merge transitions.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{
    AnalysisJob, Capability, Escalation, MergeRequest, MergeStatus, Observation, Outcome,
    ProgressEntry, ReviewCycle, Task, TaskStatus, Worker,
};
use crate::tasks::TaskStats;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Capabilities not ready: {0}")]
    CapabilityNotReady(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Channel error")]
    ChannelError,
}

impl From<outcomestore::StoreError> for StateError {
    fn from(err: outcomestore::StoreError) -> Self {
        match err {
            outcomestore::StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other.to_string()),
        }
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Event broadcast when state changes that live consumers react to
#[derive(Debug, Clone)]
pub enum StateEvent {
    WorkerUpdated { id: String },
    TaskUpdated { id: String },
    EscalationOpened { id: String, outcome_id: String },
    EscalationResolved { id: String, outcome_id: String },
    MergeUpdated { id: String },
}

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Outcome operations
    CreateOutcome {
        outcome: Outcome,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetOutcome {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Outcome>>>,
    },
    UpdateOutcome {
        outcome: Outcome,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    /// Idempotent; archiving an archived outcome is a no-op
    ArchiveOutcome {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    /// Refused while children or tasks exist
    DeleteOutcome {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListOutcomes {
        status_filter: Option<String>,
        parent_filter: Option<String>,
        reply: oneshot::Sender<StateResponse<Vec<Outcome>>>,
    },
    ChildrenOf {
        id: String,
        reply: oneshot::Sender<StateResponse<Vec<Outcome>>>,
    },

    // Task operations
    /// Batch create; validates titles, ownership, and the dependency
    /// closure. Nothing persists on failure.
    CreateTasks {
        tasks: Vec<Task>,
        reply: oneshot::Sender<StateResponse<Vec<String>>>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },
    UpdateTask {
        task: Task,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    DeleteTask {
        id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    ListTasks {
        outcome_id: String,
        status_filter: Option<TaskStatus>,
        reply: oneshot::Sender<StateResponse<Vec<Task>>>,
    },
    TaskStats {
        outcome_id: String,
        reply: oneshot::Sender<StateResponse<TaskStats>>,
    },
    /// Atomic claim: selects an eligible task, marks it claimed by the
    /// worker, and points the worker at it. Returns None when nothing is
    /// eligible; CapabilityNotReady when only the gate is in the way.
    ClaimTask {
        outcome_id: String,
        worker_id: String,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },
    /// Claimed -> running, by the claimant only
    BeginTask {
        task_id: String,
        worker_id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    CompleteTask {
        task_id: String,
        worker_id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    /// Increments attempts; re-queues as pending while retries remain
    FailTask {
        task_id: String,
        worker_id: String,
        reply: oneshot::Sender<StateResponse<TaskStatus>>,
    },
    /// Claimed/running -> pending with attempts unchanged (pause/stop)
    ReleaseTask {
        task_id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    /// Replace a task with subtasks; dependents are rewired atomically
    DecomposeTask {
        task_id: String,
        subtasks: Vec<Task>,
        reply: oneshot::Sender<StateResponse<Vec<String>>>,
    },

    // Worker operations
    /// Validates leaf outcome, available work, and the one-running-worker
    /// rule before persisting
    CreateWorker {
        worker: Worker,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetWorker {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Worker>>>,
    },
    UpdateWorker {
        worker: Worker,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListWorkers {
        outcome_filter: Option<String>,
        status_filter: Option<String>,
        reply: oneshot::Sender<StateResponse<Vec<Worker>>>,
    },

    // Progress operations
    /// Assigns the per-worker monotonic sequence number
    AppendProgress {
        entry: ProgressEntry,
        reply: oneshot::Sender<StateResponse<u64>>,
    },
    ListProgress {
        worker_id: String,
        reply: oneshot::Sender<StateResponse<Vec<ProgressEntry>>>,
    },

    // Observation operations
    PutObservation {
        observation: Observation,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetObservation {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Observation>>>,
    },
    ListObservations {
        worker_filter: Option<String>,
        task_filter: Option<String>,
        reply: oneshot::Sender<StateResponse<Vec<Observation>>>,
    },

    // Escalation operations
    /// Opens pending and releases affected claimed tasks so the claim
    /// exclusion holds
    OpenEscalation {
        escalation: Escalation,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetEscalation {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Escalation>>>,
    },
    /// Answer or dismiss; Conflict unless pending. Applies task-side
    /// effects (approach context, decomposition_pending) atomically.
    ResolveEscalation {
        id: String,
        selected_option: Option<String>,
        context: Option<String>,
        confidence: Option<f64>,
        dismiss: bool,
        reply: oneshot::Sender<StateResponse<Escalation>>,
    },
    UpdateEscalation {
        escalation: Escalation,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListEscalations {
        outcome_filter: Option<String>,
        pending_only: bool,
        reply: oneshot::Sender<StateResponse<Vec<Escalation>>>,
    },

    // Capability operations
    /// Upsert keyed by (outcome, kind, name)
    PutCapability {
        capability: Capability,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    ListCapabilities {
        outcome_id: String,
        reply: oneshot::Sender<StateResponse<Vec<Capability>>>,
    },
    DeleteCapability {
        id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },

    // Review operations
    PutReviewCycle {
        cycle: ReviewCycle,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    LatestReviewCycle {
        outcome_id: String,
        reply: oneshot::Sender<StateResponse<Option<ReviewCycle>>>,
    },
    ListReviewCycles {
        outcome_id: String,
        reply: oneshot::Sender<StateResponse<Vec<ReviewCycle>>>,
    },

    // Retro operations
    /// Conflict when a non-terminal job exists for the outcome
    CreateAnalysisJob {
        job: AnalysisJob,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetAnalysisJob {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<AnalysisJob>>>,
    },
    UpdateAnalysisJob {
        job: AnalysisJob,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListAnalysisJobs {
        outcome_id: String,
        reply: oneshot::Sender<StateResponse<Vec<AnalysisJob>>>,
    },

    // Merge queue operations
    CreateMerge {
        merge: MergeRequest,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetMerge {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<MergeRequest>>>,
    },
    /// Queue transition with conflict/error payload
    UpdateMergeStatus {
        id: String,
        status: MergeStatus,
        conflicts: Vec<String>,
        error: Option<String>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListMerges {
        outcome_id: String,
        status_filter: Option<MergeStatus>,
        reply: oneshot::Sender<StateResponse<Vec<MergeRequest>>>,
    },

    // Shutdown
    Shutdown,
}
