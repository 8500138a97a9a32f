//! Outcomed CLI entry point

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use std::io::Read;

use outcomed::cli::{
    CapabilityCommand, Cli, Command, EscalationCommand, MergeCommand, OutcomeCommand, RetroCommand,
    ReviewCommand, TaskCommand, WorkerCommand,
};
use outcomed::config::Config;
use outcomed::daemon::Daemon;
use outcomed::domain::{CapabilityType, GitMode, Task, TaskStatus};
use outcomed::supervisor::StartOptions;

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Positional-or-stdin text argument
fn text_or_stdin(text: Option<String>) -> Result<String> {
    match text {
        Some(text) => Ok(text),
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read stdin")?;
            Ok(buffer)
        }
    }
}

fn parse_git_mode(s: &str) -> Result<GitMode> {
    match s {
        "none" => Ok(GitMode::None),
        "shared" => Ok(GitMode::Shared),
        "worktree" => Ok(GitMode::Worktree),
        other => eyre::bail!("unknown git mode '{}', use none|shared|worktree", other),
    }
}

fn parse_task_status(s: &str) -> Result<TaskStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .context(format!("unknown task status '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let daemon = Daemon::start(config).await?;

    let result = dispatch(&daemon, cli.command).await;
    daemon.shutdown().await;
    result
}

async fn dispatch(daemon: &Daemon, command: Command) -> Result<()> {
    match command {
        Command::Outcome(cmd) => outcome_cmd(daemon, cmd).await,
        Command::Task(cmd) => task_cmd(daemon, cmd).await,
        Command::Worker(cmd) => worker_cmd(daemon, cmd).await,
        Command::Capability(cmd) => capability_cmd(daemon, cmd).await,
        Command::Escalation(cmd) => escalation_cmd(daemon, cmd).await,
        Command::Review(cmd) => review_cmd(daemon, cmd).await,
        Command::Retro(cmd) => retro_cmd(daemon, cmd).await,
        Command::Merge(cmd) => merge_cmd(daemon, cmd).await,
    }
}

async fn outcome_cmd(daemon: &Daemon, cmd: OutcomeCommand) -> Result<()> {
    match cmd {
        OutcomeCommand::Create {
            name,
            brief,
            parent,
            work_dir,
            git_mode,
        } => {
            let outcome = daemon
                .create_outcome(&name, brief, parent, work_dir, parse_git_mode(&git_mode)?)
                .await?;
            println!("{} {}", "created".green(), outcome.id);
        }
        OutcomeCommand::Show { id } => {
            let outcome = daemon.get_outcome(&id).await?;
            println!("{} ({})", outcome.name.bold(), outcome.id);
            println!("  status: {}", outcome.status);
            println!("  capability gate: {}", outcome.capability_ready);
            if !outcome.intent.summary.is_empty() {
                println!("  intent: {}", outcome.intent.summary);
            }
            for criterion in &outcome.intent.success_criteria {
                println!("  criterion: {}", criterion);
            }
            if let Some(doc) = &outcome.design_doc {
                println!("  approach (v{}): {}", doc.version, doc.approach);
            }
            println!(
                "  convergence: {} consecutive clean cycles",
                outcome.convergence.consecutive_zero_issues
            );
        }
        OutcomeCommand::List { status } => {
            for outcome in daemon.list_outcomes(status).await? {
                println!("{}  {}  {}", outcome.id, outcome.status, outcome.name);
            }
        }
        OutcomeCommand::Tree => {
            for (depth, outcome) in daemon.outcome_tree().await? {
                println!("{}{} ({})", "  ".repeat(depth), outcome.name, outcome.status);
            }
        }
        OutcomeCommand::Archive { id } => {
            daemon.archive_outcome(&id).await?;
            println!("{} {}", "archived".yellow(), id);
        }
        OutcomeCommand::Intent { id, text } => {
            let text = text_or_stdin(text)?;
            let outcome = daemon.optimize_intent(&id, &text).await?;
            println!(
                "{} intent: {} items, {} criteria",
                "updated".green(),
                outcome.intent.items.len(),
                outcome.intent.success_criteria.len()
            );
        }
        OutcomeCommand::Approach { id, text } => {
            let text = text_or_stdin(text)?;
            let outcome = daemon.optimize_approach(&id, &text).await?;
            let version = outcome.design_doc.map(|d| d.version).unwrap_or(0);
            println!("{} approach v{}", "updated".green(), version);
        }
    }
    Ok(())
}

async fn task_cmd(daemon: &Daemon, cmd: TaskCommand) -> Result<()> {
    match cmd {
        TaskCommand::Add {
            outcome_id,
            title,
            description,
            intent,
            approach,
            priority,
            depends_on,
            requires,
        } => {
            let mut task = Task::new(&outcome_id, title).with_priority(priority);
            if let Some(description) = description {
                task = task.with_description(description);
            }
            if let Some(intent) = intent {
                task = task.with_intent(intent);
            }
            if let Some(approach) = approach {
                task = task.with_approach(approach);
            }
            task = task.with_depends_on(depends_on).with_required_capabilities(requires);
            let id = daemon.create_task(task).await?;
            println!("{} {}", "created".green(), id);
        }
        TaskCommand::Show { id } => {
            let task = daemon.get_task(&id).await?;
            println!("{} ({})", task.title.bold(), task.id);
            println!("  status: {}  phase: {}  priority: {}", task.status, task.phase, task.priority);
            println!("  attempts: {}/{}", task.attempts, task.max_attempts);
            if !task.task_intent.is_empty() {
                println!("  intent: {}", task.task_intent);
            }
            if !task.task_approach.is_empty() {
                println!("  approach: {}", task.task_approach);
            }
            if !task.depends_on.is_empty() {
                println!("  depends on: {}", task.depends_on.join(", "));
            }
        }
        TaskCommand::List { outcome_id, status } => {
            let status = status.map(|s| parse_task_status(&s)).transpose()?;
            for task in daemon.list_tasks(&outcome_id, status).await? {
                println!("{}  {}  p{}  {}", task.id, task.status, task.priority, task.title);
            }
        }
        TaskCommand::Stats { outcome_id } => {
            let stats = daemon.task_stats(&outcome_id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        TaskCommand::Delete { id } => {
            if daemon.delete_task(&id).await? {
                println!("{} {}", "deleted".yellow(), id);
            } else {
                println!("not found: {}", id);
            }
        }
    }
    Ok(())
}

async fn worker_cmd(daemon: &Daemon, cmd: WorkerCommand) -> Result<()> {
    match cmd {
        WorkerCommand::Start {
            outcome_id,
            name,
            parallel,
            worktree,
            wait,
        } => {
            let worker_id = daemon
                .start_worker(
                    &outcome_id,
                    StartOptions {
                        name,
                        parallel,
                        worktree,
                    },
                )
                .await?;
            println!("{} {}", "started".green(), worker_id);
            if wait {
                let exit = daemon.join_worker(&worker_id).await?;
                println!("worker finished: {:?}", exit);
            }
        }
        WorkerCommand::Pause { worker_id } => {
            daemon.pause_worker(&worker_id).await?;
            println!("{} {}", "pausing".yellow(), worker_id);
        }
        WorkerCommand::Resume { worker_id, wait } => {
            daemon.resume_worker(&worker_id).await?;
            println!("{} {}", "resumed".green(), worker_id);
            if wait {
                let exit = daemon.join_worker(&worker_id).await?;
                println!("worker finished: {:?}", exit);
            }
        }
        WorkerCommand::Stop { worker_id, fail } => {
            daemon.stop_worker(&worker_id, fail).await?;
            println!("{} {}", "stopping".yellow(), worker_id);
        }
        WorkerCommand::StopAll { outcome_id } => {
            let count = daemon.stop_all_workers(&outcome_id).await?;
            println!("{} {} workers", "stopping".yellow(), count);
        }
        WorkerCommand::List { outcome } => {
            for worker in daemon.list_workers(outcome).await? {
                println!(
                    "{}  {}  iter {}  ${:.2}  {}",
                    worker.id, worker.status, worker.iteration, worker.cost_usd, worker.name
                );
            }
        }
        WorkerCommand::Status { worker_id } => {
            let status = daemon.live_status(&worker_id).await?;
            println!("{} ({})", status.worker.name.bold(), status.worker.id);
            println!("  status: {}  iteration: {}", status.worker.status, status.worker.iteration);
            println!("  cost: ${:.4}", status.worker.cost_usd);
            if let Some(started) = status.worker.started_at
                && let Some(ts) = chrono::DateTime::from_timestamp_millis(started)
            {
                println!("  started: {}", ts.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if let Some(title) = status.current_task_title {
                println!("  current task: {}", title);
            }
            if let Some(observation) = status.last_observation {
                println!("  last observation: {}", observation.summary());
            }
        }
    }
    Ok(())
}

async fn capability_cmd(daemon: &Daemon, cmd: CapabilityCommand) -> Result<()> {
    match cmd {
        CapabilityCommand::Detect { outcome_id, text } => {
            let needs = daemon.detect_capabilities(&outcome_id, text.as_deref()).await?;
            if needs.is_empty() {
                println!("no new capability needs");
            }
            for need in needs {
                println!("{}", need.reference());
            }
        }
        CapabilityCommand::List { outcome_id } => {
            for capability in daemon.list_capabilities(&outcome_id).await? {
                println!(
                    "{}  {}",
                    capability.reference(),
                    capability.description.unwrap_or_default()
                );
            }
        }
        CapabilityCommand::Plan { outcome_id, parallel } => {
            let needs = daemon.detect_capabilities(&outcome_id, None).await?;
            let ids = daemon.create_capability_tasks(&outcome_id, &needs, parallel).await?;
            println!("{} {} capability tasks", "created".green(), ids.len());
        }
        CapabilityCommand::CreateFile {
            outcome_id,
            kind,
            name,
            description,
            triggers,
            requires,
        } => {
            let kind = match kind.as_str() {
                "skill" => CapabilityType::Skill,
                "tool" => CapabilityType::Tool,
                other => eyre::bail!("unknown capability kind '{}', use skill|tool", other),
            };
            let path = daemon
                .create_capability_file(
                    &outcome_id,
                    kind,
                    &name,
                    description.as_deref(),
                    &triggers,
                    &requires,
                )
                .await?;
            println!("{} {}", "created".green(), path.display());
        }
        CapabilityCommand::Replan { outcome_id } => {
            daemon.replan_capabilities(&outcome_id).await?;
            let outcome = daemon.get_outcome(&outcome_id).await?;
            println!("capability gate: {}", outcome.capability_ready);
        }
    }
    Ok(())
}

async fn escalation_cmd(daemon: &Daemon, cmd: EscalationCommand) -> Result<()> {
    match cmd {
        EscalationCommand::List { outcome, pending } => {
            for escalation in daemon.list_escalations(outcome, pending).await? {
                println!(
                    "{}  {}  [{}]  {}",
                    escalation.id, escalation.status, escalation.trigger_type, escalation.question
                );
                for option in &escalation.options {
                    println!("    {} - {}", option.id, option.label);
                }
            }
        }
        EscalationCommand::Answer { id, option_id, context } => {
            let escalation = daemon.answer_escalation(&id, &option_id, context).await?;
            println!(
                "{} {} with {}",
                "answered".green(),
                escalation.id,
                escalation.selected_option.unwrap_or_default()
            );
        }
        EscalationCommand::Dismiss { id, reason } => {
            daemon.dismiss_escalation(&id, reason).await?;
            println!("{} {}", "dismissed".yellow(), id);
        }
        EscalationCommand::AutoResolve { outcome_id } => {
            let report = daemon.auto_resolve_escalations(&outcome_id).await?;
            println!("resolved {}, deferred {}", report.resolved, report.deferred);
        }
    }
    Ok(())
}

async fn review_cmd(daemon: &Daemon, cmd: ReviewCommand) -> Result<()> {
    match cmd {
        ReviewCommand::Run { outcome_id, criteria_only } => {
            let cycle = daemon.run_review(&outcome_id, criteria_only).await?;
            println!(
                "cycle {}: {} issues, criteria {}",
                cycle.cycle_index,
                cycle.issues_found,
                if cycle.all_criteria_pass() {
                    "pass".green()
                } else {
                    "fail".red()
                }
            );
            for result in cycle.item_results.iter().chain(&cycle.criterion_results) {
                let mark = if result.passed { "✓".green() } else { "✗".red() };
                println!("  {} {} ({})", mark, result.subject, result.evidence);
            }
            for issue in &cycle.issues {
                println!("  {} [{}] {}", "issue".red(), issue.severity, issue.description);
            }
        }
        ReviewCommand::Show { outcome_id } => match daemon.latest_review(&outcome_id).await? {
            Some(cycle) => {
                println!("{}", serde_json::to_string_pretty(&cycle)?);
            }
            None => println!("no review cycles yet"),
        },
    }
    Ok(())
}

async fn retro_cmd(daemon: &Daemon, cmd: RetroCommand) -> Result<()> {
    match cmd {
        RetroCommand::Trigger { outcome_id } => {
            let job_id = daemon.trigger_retro(&outcome_id).await?;
            println!("{} {}", "triggered".green(), job_id);
        }
        RetroCommand::Status { job_id } => {
            let job = daemon.retro_status(&job_id).await?;
            println!("{}  {}  {}", job.id, job.status, job.progress);
        }
        RetroCommand::Result { job_id } => {
            let job = daemon.retro_status(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        RetroCommand::Accept { job_id, proposal_id } => {
            let child = match proposal_id {
                Some(proposal_id) => daemon.accept_retro_proposal(&job_id, &proposal_id).await?,
                None => daemon.accept_retro_consolidated(&job_id).await?,
            };
            println!("{} child outcome {}", "created".green(), child);
        }
    }
    Ok(())
}

async fn merge_cmd(daemon: &Daemon, cmd: MergeCommand) -> Result<()> {
    match cmd {
        MergeCommand::Queue { outcome_id, worker_id } => {
            let merge_id = daemon.queue_merge(&outcome_id, &worker_id).await?;
            let merges = daemon.merge_status(&outcome_id).await?;
            let status = merges
                .iter()
                .find(|m| m.id == merge_id)
                .map(|m| m.status.to_string())
                .unwrap_or_default();
            println!("{}  {}", merge_id, status);
        }
        MergeCommand::Status { outcome_id } => {
            for merge in daemon.merge_status(&outcome_id).await? {
                println!("{}  {}  {}", merge.id, merge.status, merge.branch);
                for conflict in &merge.conflicts {
                    println!("    conflict: {}", conflict);
                }
            }
        }
        MergeCommand::DryRun { worker_id } => {
            let (clean, conflicts) = daemon.merge_dry_run(&worker_id).await?;
            if clean {
                println!("{}", "clean".green());
            } else {
                println!("{}", "conflicts".red());
                for file in conflicts {
                    println!("  {}", file);
                }
            }
        }
    }
    Ok(())
}
