//! Claim selection and task accounting
//!
//! The selection logic here is pure over loaded records; the state actor
//! runs it inside a transaction so two concurrent claims can never pick
//! the same task.

use std::collections::HashSet;

use crate::domain::{
    Capability, CapabilityReady, Escalation, Outcome, Task, TaskPhase, TaskStatus,
};

/// Per-status counts for an outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub decomposing: usize,
    pub total: usize,
}

/// Count tasks by status
pub fn task_stats(tasks: &[Task]) -> TaskStats {
    let mut stats = TaskStats {
        total: tasks.len(),
        ..Default::default()
    };
    for task in tasks {
        match task.status {
            TaskStatus::Pending => stats.pending += 1,
            TaskStatus::Claimed => stats.claimed += 1,
            TaskStatus::Running => stats.running += 1,
            TaskStatus::Completed => stats.completed += 1,
            TaskStatus::Failed => stats.failed += 1,
            TaskStatus::Blocked => stats.blocked += 1,
            TaskStatus::DecompositionPending | TaskStatus::DecompositionInProgress => {
                stats.decomposing += 1
            }
        }
    }
    stats
}

/// Select the next claimable task for an outcome
///
/// Implements the claim algorithm:
/// 1. pending tasks whose dependencies are all completed and whose
///    required capabilities exist,
/// 2. capability phase only while the gate is not ready,
/// 3. tasks referenced by a pending escalation are excluded,
/// 4. decomposition states are excluded,
/// 5. order by (priority ascending, created_at ascending).
pub fn select_claimable<'a>(
    outcome: &Outcome,
    tasks: &'a [Task],
    pending_escalations: &[Escalation],
    capabilities: &[Capability],
) -> Option<&'a Task> {
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();

    let present_refs: HashSet<String> = capabilities.iter().map(|c| c.reference()).collect();

    let escalated: HashSet<&str> = pending_escalations
        .iter()
        .filter(|e| e.is_pending())
        .flat_map(|e| e.affected_tasks.iter().map(String::as_str))
        .collect();

    let gate_open = outcome.capability_ready == CapabilityReady::Ready;

    let mut eligible: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| t.depends_on.iter().all(|d| completed.contains(d.as_str())))
        .filter(|t| {
            t.required_capabilities
                .iter()
                .all(|r| present_refs.contains(r))
        })
        .filter(|t| gate_open || t.phase == TaskPhase::Capability)
        .filter(|t| !escalated.contains(t.id.as_str()))
        .collect();

    eligible.sort_by_key(|t| (t.priority, t.created_at, t.id.clone()));
    eligible.into_iter().next()
}
