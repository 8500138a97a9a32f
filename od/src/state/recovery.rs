//! Crash recovery at daemon start
//!
//! A previous process may have died with workers marked running and
//! tasks claimed. Nothing of that survives the process, so on startup
//! live-looking workers become paused and their claims revert to
//! pending with attempts unchanged. Progress history is never touched.

use tracing::{info, warn};

use crate::domain::{TaskStatus, WorkerStatus};

use super::StateManager;

/// What recovery changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    pub workers_paused: usize,
    pub tasks_released: usize,
}

/// Reset orphaned workers and claims left over from a dead process
pub async fn recover(state: &StateManager) -> eyre::Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    let workers = state.list_workers(None, None).await?;
    for mut worker in workers {
        if !worker.is_active() {
            continue;
        }
        warn!(
            worker_id = %worker.id,
            status = %worker.status,
            "Resetting orphaned worker to paused"
        );

        if let Some(task_id) = worker.current_task.clone() {
            match state.release_task(&task_id).await {
                Ok(()) => stats.tasks_released += 1,
                Err(e) => warn!(%task_id, error = %e, "Failed to release orphaned claim"),
            }
        }

        worker.set_status(WorkerStatus::Paused);
        worker.current_task = None;
        state.update_worker(worker).await?;
        stats.workers_paused += 1;
    }

    // Claims whose holder is gone entirely (no active worker) also revert
    let outcomes = state.list_outcomes(None, None).await?;
    for outcome in outcomes {
        let tasks = state.list_tasks(&outcome.id, None).await?;
        for task in tasks {
            if matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
                let holder_alive = match &task.claimed_by {
                    Some(worker_id) => state
                        .get_worker(worker_id)
                        .await?
                        .map(|w| w.is_active())
                        .unwrap_or(false),
                    None => false,
                };
                if !holder_alive {
                    state.release_task(&task.id).await?;
                    stats.tasks_released += 1;
                }
            }
        }
    }

    if stats != RecoveryStats::default() {
        info!(
            workers_paused = stats.workers_paused,
            tasks_released = stats.tasks_released,
            "Recovery complete"
        );
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Outcome, Task, Worker};

    #[tokio::test]
    async fn test_recover_orphaned_worker() {
        let state = StateManager::spawn_in_memory().unwrap();

        let outcome = Outcome::new("test");
        let outcome_id = state.create_outcome(outcome).await.unwrap();
        let task_id = state
            .create_task(Task::new(&outcome_id, "work"))
            .await
            .unwrap();

        let worker = Worker::new(&outcome_id, "w");
        let worker_id = state.create_worker(worker).await.unwrap();

        // Simulate a dead process: worker running with a claimed task
        let claimed = state.claim_task(&outcome_id, &worker_id).await.unwrap().unwrap();
        assert_eq!(claimed.id, task_id);
        let mut worker = state.get_worker_required(&worker_id).await.unwrap();
        worker.set_status(WorkerStatus::Running);
        state.update_worker(worker).await.unwrap();

        let stats = recover(&state).await.unwrap();
        assert_eq!(stats.workers_paused, 1);
        assert_eq!(stats.tasks_released, 1);

        let worker = state.get_worker_required(&worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Paused);
        assert!(worker.current_task.is_none());

        let task = state.get_task_required(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn test_recover_noop_when_clean() {
        let state = StateManager::spawn_in_memory().unwrap();
        let outcome = Outcome::new("clean");
        state.create_outcome(outcome).await.unwrap();

        let stats = recover(&state).await.unwrap();
        assert_eq!(stats, RecoveryStats::default());
    }
}
