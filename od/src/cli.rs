//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Outcomed - autonomous outcome orchestration engine
#[derive(Parser)]
#[command(
    name = "od",
    about = "Declare outcomes, let workers drive them to convergence",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level command groups
#[derive(Subcommand)]
pub enum Command {
    /// Outcome operations
    #[command(subcommand)]
    Outcome(OutcomeCommand),

    /// Task operations
    #[command(subcommand)]
    Task(TaskCommand),

    /// Worker operations
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Capability operations
    #[command(subcommand)]
    Capability(CapabilityCommand),

    /// Escalation operations
    #[command(subcommand)]
    Escalation(EscalationCommand),

    /// Review operations
    #[command(subcommand)]
    Review(ReviewCommand),

    /// Retrospective operations
    #[command(subcommand)]
    Retro(RetroCommand),

    /// Merge queue operations
    #[command(subcommand)]
    Merge(MergeCommand),
}

#[derive(Subcommand)]
pub enum OutcomeCommand {
    /// Create a new outcome
    Create {
        name: String,

        /// Free-text brief
        #[arg(short, long)]
        brief: Option<String>,

        /// Parent outcome id
        #[arg(short, long)]
        parent: Option<String>,

        /// Working directory (git checkout) for the outcome
        #[arg(short = 'd', long)]
        work_dir: Option<String>,

        /// Git mode: none, shared, worktree
        #[arg(short, long, default_value = "none")]
        git_mode: String,
    },

    /// Show one outcome
    Show { id: String },

    /// List outcomes, optionally by status
    List {
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Print the outcome forest
    Tree,

    /// Archive an outcome (idempotent)
    Archive { id: String },

    /// Replace the structured intent from free text
    Intent {
        id: String,
        /// Free text; reads stdin when omitted
        text: Option<String>,
    },

    /// Append a design-doc version
    Approach {
        id: String,
        /// Approach text; reads stdin when omitted
        text: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Add a task to an outcome
    Add {
        outcome_id: String,
        title: String,

        #[arg(short, long)]
        description: Option<String>,

        /// What the task must achieve
        #[arg(short, long)]
        intent: Option<String>,

        /// How to achieve it
        #[arg(short, long)]
        approach: Option<String>,

        /// Lower is more urgent
        #[arg(short, long, default_value_t = 0)]
        priority: i64,

        /// Task ids this task depends on
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,

        /// Required capability references (skill:x, tool:y)
        #[arg(long, value_delimiter = ',')]
        requires: Vec<String>,
    },

    /// Show one task
    Show { id: String },

    /// List tasks for an outcome
    List {
        outcome_id: String,

        #[arg(short, long)]
        status: Option<String>,
    },

    /// Per-status counts for an outcome
    Stats { outcome_id: String },

    /// Delete a task
    Delete { id: String },
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Start a worker on an outcome
    Start {
        outcome_id: String,

        /// Worker display name
        #[arg(short, long)]
        name: Option<String>,

        /// Allow multiple running workers on the outcome
        #[arg(long)]
        parallel: bool,

        /// Isolate in a git worktree with a dedicated branch
        #[arg(long)]
        worktree: bool,

        /// Block until the worker finishes
        #[arg(long)]
        wait: bool,
    },

    /// Pause a running worker
    Pause { worker_id: String },

    /// Resume a paused worker
    Resume {
        worker_id: String,

        /// Block until the worker finishes
        #[arg(long)]
        wait: bool,
    },

    /// Stop a worker
    Stop {
        worker_id: String,

        /// Mark failed instead of paused
        #[arg(long)]
        fail: bool,
    },

    /// Stop every worker of an outcome
    StopAll { outcome_id: String },

    /// List workers
    List {
        #[arg(short, long)]
        outcome: Option<String>,
    },

    /// Live status of one worker
    Status { worker_id: String },
}

#[derive(Subcommand)]
pub enum CapabilityCommand {
    /// Detect capability needs from text or the stored design doc
    Detect {
        outcome_id: String,

        /// Analyze this text instead of the stored approach
        #[arg(short, long)]
        text: Option<String>,
    },

    /// List the outcome's capabilities
    List { outcome_id: String },

    /// Create capability tasks for detected needs
    Plan {
        outcome_id: String,

        /// Independent tasks instead of a chain
        #[arg(long)]
        parallel: bool,
    },

    /// Write a skill or tool scaffold into the workspace
    CreateFile {
        outcome_id: String,

        /// skill or tool
        kind: String,
        name: String,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(long, value_delimiter = ',')]
        triggers: Vec<String>,

        /// Env-key names the capability needs
        #[arg(long, value_delimiter = ',')]
        requires: Vec<String>,
    },

    /// Re-evaluate the capability gate after an approach change
    Replan { outcome_id: String },
}

#[derive(Subcommand)]
pub enum EscalationCommand {
    /// List escalations
    List {
        #[arg(short, long)]
        outcome: Option<String>,

        /// Pending only
        #[arg(short, long)]
        pending: bool,
    },

    /// Answer a pending escalation
    Answer {
        id: String,
        option_id: String,

        /// Extra context appended to affected task approaches
        #[arg(long)]
        context: Option<String>,
    },

    /// Dismiss a pending escalation
    Dismiss {
        id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Auto-resolve pending escalations from known context
    AutoResolve { outcome_id: String },
}

#[derive(Subcommand)]
pub enum ReviewCommand {
    /// Run a review cycle
    Run {
        outcome_id: String,

        /// Evaluate criteria without issue hunting or remediation
        #[arg(long)]
        criteria_only: bool,
    },

    /// Show the latest review cycle
    Show { outcome_id: String },
}

#[derive(Subcommand)]
pub enum RetroCommand {
    /// Start a retrospective analysis job
    Trigger { outcome_id: String },

    /// Job status and progress
    Status { job_id: String },

    /// Full job result (clusters and proposals)
    Result { job_id: String },

    /// Materialize a proposal as a child outcome
    Accept {
        job_id: String,

        /// Proposal id; all proposals consolidated when omitted
        proposal_id: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum MergeCommand {
    /// Queue a worker's branch for merge and drain the queue
    Queue {
        outcome_id: String,
        worker_id: String,
    },

    /// Merge queue state for an outcome
    Status { outcome_id: String },

    /// Dry-run a worker's branch against the outcome base
    DryRun { worker_id: String },
}
