//! Merge coordinator - FIFO integration of worker branches
//!
//! Merges for one outcome are serialized: at most one in progress, the
//! rest queued in arrival order. A conflicted merge never modifies the
//! base branch; the conflict set is persisted on the merge record.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use eyre::Result;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{MergeRequest, MergeStatus};
use crate::error::{EngineError, EngineResult};
use crate::state::StateManager;

use super::manager::WorktreeManager;

/// Result of one merge attempt against the base branch
#[derive(Debug, Clone)]
enum MergeAttempt {
    Clean,
    Conflicted { files: Vec<String> },
    Failed { message: String },
}

/// Dry-run a merge without touching the base branch
///
/// Uses `git merge-tree`, which works entirely in the object database.
/// Returns `(clean, conflicting_paths)`.
pub async fn can_merge_cleanly(
    repo_root: &Path,
    base_branch: &str,
    branch: &str,
) -> Result<(bool, Vec<String>)> {
    let output = Command::new("git")
        .args(["merge-tree", "--write-tree", "--name-only", base_branch, branch])
        .current_dir(repo_root)
        .output()
        .await?;

    if output.status.success() {
        return Ok((true, Vec::new()));
    }

    // Exit code 1 with --name-only: first line is the tree OID, the
    // following non-empty lines name the conflicted paths
    let stdout = String::from_utf8_lossy(&output.stdout);
    let conflicts: Vec<String> = stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .take_while(|l| !l.is_empty())
        .map(String::from)
        .collect();

    if output.status.code() == Some(1) {
        Ok((false, conflicts))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(eyre::eyre!("merge-tree failed: {}", stderr))
    }
}

/// Serializes merges per outcome and tracks them in the store
#[derive(Clone)]
pub struct MergeCoordinator {
    state: StateManager,
    worktrees: Arc<WorktreeManager>,
    /// One lock per outcome; taken for the duration of a queue drain
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl MergeCoordinator {
    pub fn new(state: StateManager, worktrees: Arc<WorktreeManager>) -> Self {
        Self {
            state,
            worktrees,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn outcome_lock(&self, outcome_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(outcome_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Enqueue a merge for a worker's branch
    pub async fn queue(&self, outcome_id: &str, worker_id: &str) -> EngineResult<String> {
        let worker = self.state.get_worker_required(worker_id).await?;
        let branch = worker.branch.clone().ok_or_else(|| {
            EngineError::validation(format!("worker {} has no work branch", worker_id))
        })?;

        let merge = MergeRequest::new(outcome_id, worker_id, branch);
        let id = self.state.create_merge(merge).await?;
        debug!(merge_id = %id, %worker_id, "Merge queued");
        Ok(id)
    }

    /// Drain the outcome's merge queue in FIFO order
    ///
    /// Returns the ids of merges that reached a terminal state during
    /// this drain.
    pub async fn process_queue(&self, outcome_id: &str) -> EngineResult<Vec<String>> {
        let lock = self.outcome_lock(outcome_id).await;
        let _guard = lock.lock().await;

        let outcome = self.state.get_outcome_required(outcome_id).await?;
        let Some(repo_root) = outcome.work_dir.clone() else {
            return Err(EngineError::validation(format!(
                "outcome {} has no working directory",
                outcome_id
            )));
        };
        let base_branch = outcome.work_branch.clone().unwrap_or_else(|| "main".to_string());

        let mut processed = Vec::new();
        loop {
            let queued = self
                .state
                .list_merges(outcome_id, Some(MergeStatus::Queued))
                .await?;
            let Some(next) = queued.into_iter().min_by_key(|m| m.created_at) else {
                break;
            };

            self.state
                .update_merge_status(&next.id, MergeStatus::InProgress, Vec::new(), None)
                .await?;

            let attempt = self
                .attempt_merge(Path::new(&repo_root), &base_branch, &next)
                .await;

            let (status, conflicts, error) = match attempt {
                Ok(MergeAttempt::Clean) => (MergeStatus::Completed, Vec::new(), None),
                Ok(MergeAttempt::Conflicted { files }) => {
                    warn!(merge_id = %next.id, ?files, "Merge conflicted");
                    (MergeStatus::Conflicted, files, None)
                }
                Ok(MergeAttempt::Failed { message }) => {
                    (MergeStatus::Failed, Vec::new(), Some(message))
                }
                Err(e) => (MergeStatus::Failed, Vec::new(), Some(e.to_string())),
            };

            self.state
                .update_merge_status(&next.id, status, conflicts, error)
                .await?;
            info!(merge_id = %next.id, %status, "Merge finished");
            processed.push(next.id);
        }

        Ok(processed)
    }

    async fn attempt_merge(
        &self,
        repo_root: &Path,
        base_branch: &str,
        merge: &MergeRequest,
    ) -> Result<MergeAttempt> {
        // Flush uncommitted work in the worker's checkout first
        let worktree_path = self.worktrees.worktree_path(&merge.worker_id);
        if worktree_path.exists() {
            self.worktrees
                .auto_commit(&worktree_path, &format!("Checkpoint before merge of {}", merge.branch))
                .await
                .map_err(|e| eyre::eyre!(e.to_string()))?;
        }

        // Conflicts are detected without touching the base
        let (clean, conflicts) = can_merge_cleanly(repo_root, base_branch, &merge.branch).await?;
        if !clean {
            return Ok(MergeAttempt::Conflicted { files: conflicts });
        }

        let checkout = Command::new("git")
            .args(["checkout", base_branch])
            .current_dir(repo_root)
            .output()
            .await?;
        if !checkout.status.success() {
            return Ok(MergeAttempt::Failed {
                message: String::from_utf8_lossy(&checkout.stderr).to_string(),
            });
        }

        let output = Command::new("git")
            .args([
                "merge",
                "--no-ff",
                &merge.branch,
                "-m",
                &format!("Merge {}", merge.branch),
            ])
            .current_dir(repo_root)
            .output()
            .await?;

        if output.status.success() {
            Ok(MergeAttempt::Clean)
        } else {
            // Roll the base back so a surprise failure leaves it intact
            let _ = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(repo_root)
                .output()
                .await;
            Ok(MergeAttempt::Failed {
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Outcome, Task, Worker};
    use crate::worktree::manager::tests::{git, setup_git_repo};
    use crate::worktree::{WorktreeConfig, WorktreeManager};
    use tempfile::tempdir;

    async fn setup(
        repo: &Path,
        worktree_base: &Path,
    ) -> (StateManager, MergeCoordinator, Arc<WorktreeManager>, String) {
        setup_git_repo(repo).await;

        let state = StateManager::spawn_in_memory().unwrap();
        let mut outcome = Outcome::new("merge-test");
        outcome.parallel = true;
        outcome.work_dir = Some(repo.to_string_lossy().to_string());
        outcome.work_branch = Some("main".to_string());
        let outcome_id = state.create_outcome(outcome).await.unwrap();
        // Workers need pending work to be created
        state.create_task(Task::new(&outcome_id, "work")).await.unwrap();
        state.create_task(Task::new(&outcome_id, "more work")).await.unwrap();

        let worktrees = Arc::new(WorktreeManager::new(WorktreeConfig {
            base_dir: worktree_base.to_path_buf(),
            branch_prefix: "test".to_string(),
        }));
        let coordinator = MergeCoordinator::new(state.clone(), Arc::clone(&worktrees));
        (state, coordinator, worktrees, outcome_id)
    }

    async fn add_worker(
        state: &StateManager,
        worktrees: &WorktreeManager,
        repo: &Path,
        outcome_id: &str,
        name: &str,
    ) -> (String, std::path::PathBuf) {
        let mut worker = Worker::new(outcome_id, name);
        let info = worktrees.create(repo, &worker.id, Some("main")).await.unwrap();
        worker.branch = Some(info.branch.clone());
        let worker_id = state.create_worker(worker).await.unwrap();
        (worker_id, info.path)
    }

    #[tokio::test]
    async fn test_clean_merge_completes() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        let (state, coordinator, worktrees, outcome_id) = setup(repo.path(), base.path()).await;

        let (worker_id, wt_path) = add_worker(&state, &worktrees, repo.path(), &outcome_id, "a").await;
        std::fs::write(wt_path.join("a.txt"), "from worker a\n").unwrap();

        let merge_id = coordinator.queue(&outcome_id, &worker_id).await.unwrap();
        let processed = coordinator.process_queue(&outcome_id).await.unwrap();
        assert_eq!(processed, vec![merge_id.clone()]);

        let merge = state.get_merge(&merge_id).await.unwrap().unwrap();
        assert_eq!(merge.status, MergeStatus::Completed);

        // The file landed on main
        git(repo.path(), &["checkout", "main"]).await;
        assert!(repo.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_conflicting_merge_leaves_base_unchanged() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        let (state, coordinator, worktrees, outcome_id) = setup(repo.path(), base.path()).await;

        // Both workers branch from the same commit and edit the same file
        let (worker_a, path_a) = add_worker(&state, &worktrees, repo.path(), &outcome_id, "a").await;
        let (worker_b, path_b) = add_worker(&state, &worktrees, repo.path(), &outcome_id, "b").await;

        std::fs::write(path_a.join("x.txt"), "version a\n").unwrap();
        std::fs::write(path_b.join("x.txt"), "version b\n").unwrap();

        // Worker A merges first, cleanly
        let merge_a = coordinator.queue(&outcome_id, &worker_a).await.unwrap();
        coordinator.process_queue(&outcome_id).await.unwrap();
        assert_eq!(
            state.get_merge(&merge_a).await.unwrap().unwrap().status,
            MergeStatus::Completed
        );

        // Worker B now conflicts on x.txt
        let merge_b = coordinator.queue(&outcome_id, &worker_b).await.unwrap();
        coordinator.process_queue(&outcome_id).await.unwrap();

        let merge = state.get_merge(&merge_b).await.unwrap().unwrap();
        assert_eq!(merge.status, MergeStatus::Conflicted);
        assert!(merge.conflicts.iter().any(|f| f.contains("x.txt")));

        // Base still holds worker A's version
        git(repo.path(), &["checkout", "main"]).await;
        let content = std::fs::read_to_string(repo.path().join("x.txt")).unwrap();
        assert_eq!(content, "version a\n");
    }

    #[tokio::test]
    async fn test_dry_run_reports_conflicts() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        let (state, coordinator, worktrees, outcome_id) = setup(repo.path(), base.path()).await;

        let (worker_a, path_a) = add_worker(&state, &worktrees, repo.path(), &outcome_id, "a").await;
        let (worker_b, path_b) = add_worker(&state, &worktrees, repo.path(), &outcome_id, "b").await;

        std::fs::write(path_a.join("y.txt"), "a\n").unwrap();
        std::fs::write(path_b.join("y.txt"), "b\n").unwrap();
        worktrees.auto_commit(&path_a, "a work").await.unwrap();
        worktrees.auto_commit(&path_b, "b work").await.unwrap();

        let branch_b = state
            .get_worker_required(&worker_b)
            .await
            .unwrap()
            .branch
            .unwrap();

        // Before A merges, B applies cleanly
        let (clean, conflicts) = can_merge_cleanly(repo.path(), "main", &branch_b).await.unwrap();
        assert!(clean);
        assert!(conflicts.is_empty());

        // Merge A into main so B's branch now conflicts
        coordinator.queue(&outcome_id, &worker_a).await.unwrap();
        coordinator.process_queue(&outcome_id).await.unwrap();

        let (clean, conflicts) = can_merge_cleanly(repo.path(), "main", &branch_b).await.unwrap();
        assert!(!clean);
        assert!(conflicts.iter().any(|f| f.contains("y.txt")));
    }
}
