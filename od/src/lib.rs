//! Outcomed - autonomous outcome orchestration engine
//!
//! A user declares an *outcome* (a goal with intent and approach); the
//! engine decomposes it into tasks, builds prerequisite capabilities,
//! spawns long-running workers that iteratively drive an external LLM
//! sidecar toward completion, observes each iteration for quality and
//! drift, escalates ambiguities to the user, merges worker output through
//! git worktrees, and reviews finished work against success criteria.
//!
//! # Core Concepts
//!
//! - **Fresh Context Always**: every iteration rebuilds its prompt from
//!   stored state; raw LLM output never feeds back in
//! - **State in the Store**: all coordination state lives in SQLite
//!   behind one actor, not in memory
//! - **Concrete Signals**: completion, blockers, and decisions are parsed
//!   markers, not vibes
//! - **Escalate, Don't Guess**: ambiguity pauses the task and asks the
//!   user
//!
//! # Modules
//!
//! - [`domain`] - entities: outcomes, tasks, workers, observations,
//!   escalations, capabilities, review cycles
//! - [`state`] - the store actor and crash recovery
//! - [`tasks`] - claim selection and dependency validation
//! - [`supervisor`] - the Ralph loop and the worker manager
//! - [`observer`] - per-iteration evaluation (HOMЯ)
//! - [`escalation`] - user questions and auto-resolution
//! - [`capability`] - skill/tool planning, discovery, and gating
//! - [`review`] - success-criteria review and convergence
//! - [`worktree`] - branch-per-worker isolation and the merge queue
//! - [`retro`] - escalation clustering into improvement proposals
//! - [`llm`] - the sidecar runner
//! - [`daemon`] - composition root and programmatic surface

pub mod capability;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod escalation;
pub mod llm;
pub mod observer;
pub mod prompts;
pub mod retro;
pub mod review;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod tasks;
pub mod worktree;
pub mod workspace;

// Re-export commonly used types
pub use config::Config;
pub use daemon::Daemon;
pub use domain::{
    Capability, CapabilityNeed, CapabilityReady, Escalation, GitMode, Intent, Observation,
    Outcome, OutcomeStatus, ProgressEntry, ReviewCycle, Task, TaskPhase, TaskStatus, Worker,
    WorkerStatus,
};
pub use error::{EngineError, EngineResult};
pub use llm::{LlmError, LlmRunner, RunnerOutput, RunnerRequest};
pub use observer::{HomrObserver, ObservationContext, Observer};
pub use review::{EvidenceReviewer, Reviewer};
pub use state::{StateError, StateEvent, StateManager};
pub use supervisor::{ControlSignal, StartOptions, SupervisorExit, WorkerManager};
