//! Worktree manager - branch-per-worker isolation
//!
//! In worktree git-mode every worker gets a dedicated branch and an
//! isolated checkout under the configured base directory. Creation fails
//! when the branch already exists; removal also deletes the branch.

use eyre::Result;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Worktree not found: {0}")]
    NotFound(String),

    #[error("Worktree corrupted: {0}")]
    Corrupted(String),

    #[error("Git command failed: {0}")]
    GitError(String),
}

/// Configuration for worktree placement and branch naming
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Base directory for worktree checkouts
    pub base_dir: PathBuf,

    /// Branch prefix for worker branches
    pub branch_prefix: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/outcomed/worktrees"),
            branch_prefix: "outcomed".to_string(),
        }
    }
}

/// Information about a created worktree
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub worker_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Manager for git worktrees
pub struct WorktreeManager {
    config: WorktreeConfig,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        Self { config }
    }

    /// Branch name for a worker
    pub fn branch_name(&self, worker_id: &str) -> String {
        format!("{}/{}", self.config.branch_prefix, worker_id)
    }

    /// Checkout path for a worker
    pub fn worktree_path(&self, worker_id: &str) -> PathBuf {
        self.config.base_dir.join(worker_id)
    }

    pub fn exists(&self, worker_id: &str) -> bool {
        self.worktree_path(worker_id).exists()
    }

    /// Create a worktree for a worker, branching from the outcome base
    ///
    /// Fails with `BranchExists` when the worker branch is already
    /// present in the repository.
    pub async fn create(
        &self,
        repo_root: &Path,
        worker_id: &str,
        base_branch: Option<&str>,
    ) -> Result<WorktreeInfo, WorktreeError> {
        tokio::fs::create_dir_all(&self.config.base_dir)
            .await
            .map_err(|e| WorktreeError::CreateFailed(format!("base dir: {}", e)))?;

        let branch = self.branch_name(worker_id);
        let path = self.worktree_path(worker_id);

        // Refuse to reuse a branch; stale ones must be cleaned up first
        let verify = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if verify.status.success() {
            return Err(WorktreeError::BranchExists(branch));
        }

        let base = base_branch.unwrap_or("HEAD");
        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                path.to_str().unwrap_or_default(),
                "-b",
                &branch,
                base,
            ])
            .current_dir(repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::CreateFailed(stderr.to_string()));
        }

        info!(%worker_id, branch = %branch, path = %path.display(), "Created worktree");
        Ok(WorktreeInfo {
            worker_id: worker_id.to_string(),
            path,
            branch,
        })
    }

    /// Remove a worker's worktree and branch
    ///
    /// Safe to call on every supervisor exit path; missing worktrees are
    /// not an error.
    pub async fn remove(&self, repo_root: &Path, worker_id: &str) -> Result<(), WorktreeError> {
        let path = self.worktree_path(worker_id);

        if path.exists() {
            let output = Command::new("git")
                .args(["worktree", "remove", path.to_str().unwrap_or_default(), "--force"])
                .current_dir(repo_root)
                .output()
                .await
                .map_err(|e| WorktreeError::GitError(e.to_string()))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("is not a working tree") {
                    return Err(WorktreeError::RemoveFailed(stderr.to_string()));
                }
            }
        } else {
            debug!(%worker_id, "Worktree already gone, removing branch only");
        }

        let branch = self.branch_name(worker_id);
        let _ = Command::new("git")
            .args(["branch", "-D", &branch])
            .current_dir(repo_root)
            .output()
            .await;

        info!(%worker_id, "Removed worktree");
        Ok(())
    }

    /// Re-create the checkout for an existing worker branch
    ///
    /// Used when resuming a paused worker whose directory was detached
    /// but whose branch survived.
    pub async fn attach(&self, repo_root: &Path, worker_id: &str) -> Result<WorktreeInfo, WorktreeError> {
        tokio::fs::create_dir_all(&self.config.base_dir)
            .await
            .map_err(|e| WorktreeError::CreateFailed(format!("base dir: {}", e)))?;

        let branch = self.branch_name(worker_id);
        let path = self.worktree_path(worker_id);

        let output = Command::new("git")
            .args(["worktree", "add", path.to_str().unwrap_or_default(), &branch])
            .current_dir(repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::CreateFailed(stderr.to_string()));
        }

        info!(%worker_id, branch = %branch, "Re-attached worktree");
        Ok(WorktreeInfo {
            worker_id: worker_id.to_string(),
            path,
            branch,
        })
    }

    /// Remove the checkout but keep the branch
    ///
    /// The pause path: committed work stays reachable on the branch and
    /// the directory is released.
    pub async fn detach(&self, repo_root: &Path, worker_id: &str) -> Result<(), WorktreeError> {
        let path = self.worktree_path(worker_id);
        if !path.exists() {
            return Ok(());
        }

        self.auto_commit(&path, "Checkpoint before detach").await?;

        let output = Command::new("git")
            .args(["worktree", "remove", path.to_str().unwrap_or_default(), "--force"])
            .current_dir(repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::RemoveFailed(stderr.to_string()));
            }
        }
        info!(%worker_id, "Detached worktree (branch kept)");
        Ok(())
    }

    /// Commit anything left uncommitted in a worktree
    pub async fn auto_commit(&self, worktree_path: &Path, message: &str) -> Result<(), WorktreeError> {
        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if status.stdout.is_empty() {
            return Ok(());
        }

        let _ = Command::new("git")
            .args(["add", "-A"])
            .current_dir(worktree_path)
            .output()
            .await;
        let _ = Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(worktree_path)
            .output()
            .await;
        debug!(path = %worktree_path.display(), "Auto-committed worktree changes");
        Ok(())
    }

    /// Check a worktree is healthy
    pub async fn validate(&self, worker_id: &str) -> Result<(), WorktreeError> {
        let path = self.worktree_path(worker_id);
        if !path.exists() {
            return Err(WorktreeError::NotFound(worker_id.to_string()));
        }
        let output = Command::new("git")
            .args(["status"])
            .current_dir(&path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if !output.status.success() {
            return Err(WorktreeError::Corrupted(worker_id.to_string()));
        }
        Ok(())
    }

    /// Remove worktrees whose workers are no longer active
    pub async fn cleanup_orphaned(&self, repo_root: &Path, active_worker_ids: &[String]) -> Result<usize> {
        if !self.config.base_dir.exists() {
            return Ok(0);
        }

        let mut cleaned = 0;
        let mut entries = tokio::fs::read_dir(&self.config.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.path().is_dir() {
                continue;
            }
            let worker_id = entry.file_name().to_string_lossy().to_string();
            if active_worker_ids.contains(&worker_id) {
                continue;
            }
            info!(%worker_id, "Cleaning up orphaned worktree");
            if let Err(e) = self.remove(repo_root, &worker_id).await {
                warn!(%worker_id, error = %e, "Failed to remove orphaned worktree");
            } else {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub async fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git").args(args).current_dir(dir).output().await.unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    pub async fn setup_git_repo(dir: &Path) {
        git(dir, &["init", "-b", "main"]).await;
        git(dir, &["config", "user.email", "test@test.com"]).await;
        git(dir, &["config", "user.name", "Test"]).await;
        git(dir, &["commit", "--allow-empty", "-m", "initial"]).await;
    }

    fn manager(base: &Path) -> WorktreeManager {
        WorktreeManager::new(WorktreeConfig {
            base_dir: base.to_path_buf(),
            branch_prefix: "test".to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let mgr = manager(base.path());
        let info = mgr.create(repo.path(), "worker-1", Some("main")).await.unwrap();
        assert!(info.path.exists());
        assert_eq!(info.branch, "test/worker-1");

        mgr.validate("worker-1").await.unwrap();

        mgr.remove(repo.path(), "worker-1").await.unwrap();
        assert!(!info.path.exists());
    }

    #[tokio::test]
    async fn test_create_fails_on_existing_branch() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let mgr = manager(base.path());
        mgr.create(repo.path(), "worker-1", Some("main")).await.unwrap();

        // Same worker id again: branch collision
        let err = mgr.create(repo.path(), "worker-1", Some("main")).await.unwrap_err();
        assert!(matches!(err, WorktreeError::BranchExists(_)));
    }

    #[tokio::test]
    async fn test_detach_then_attach() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let mgr = manager(base.path());
        let info = mgr.create(repo.path(), "worker-1", Some("main")).await.unwrap();
        std::fs::write(info.path.join("wip.txt"), "work in progress\n").unwrap();

        mgr.detach(repo.path(), "worker-1").await.unwrap();
        assert!(!mgr.exists("worker-1"));

        // The branch survived with the checkpoint commit on it
        let reattached = mgr.attach(repo.path(), "worker-1").await.unwrap();
        assert!(reattached.path.join("wip.txt").exists());
    }

    #[tokio::test]
    async fn test_validate_missing() {
        let base = tempdir().unwrap();
        let mgr = manager(base.path());
        assert!(matches!(
            mgr.validate("ghost").await,
            Err(WorktreeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_orphaned() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let mgr = manager(base.path());
        mgr.create(repo.path(), "worker-1", Some("main")).await.unwrap();
        mgr.create(repo.path(), "worker-2", Some("main")).await.unwrap();

        let cleaned = mgr
            .cleanup_orphaned(repo.path(), &["worker-2".to_string()])
            .await
            .unwrap();
        assert_eq!(cleaned, 1);
        assert!(!mgr.exists("worker-1"));
        assert!(mgr.exists("worker-2"));
    }
}
