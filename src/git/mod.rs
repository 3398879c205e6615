//! Git worktree isolation and branch merging for task agents.
//!
//! Each agent works inside its own `git worktree`, committing to its own
//! branch; the merge manager later merges these branches back onto the
//! target branch through this module.

use crate::models::MergeStrategy;
use crate::{RalphError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A git worktree dedicated to one agent.
#[derive(Debug, Clone)]
pub struct AgentWorktree {
    pub agent_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

/// Outcome of merging one branch into the target.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub success: bool,
    pub modified_files: Vec<String>,
    pub conflicted_files: Vec<String>,
    pub commit_hash: Option<String>,
    pub error: Option<String>,
}

/// Manages per-agent worktrees and branch merges against one target repo.
///
/// Git operations that mutate shared repo state (checkout, merge) are
/// serialized behind `git_lock` — worktree creation/removal for distinct
/// agents can run concurrently since they touch independent directories.
pub struct GitWorktreeManager {
    repo_root: PathBuf,
    worktree_root: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl GitWorktreeManager {
    pub fn new(repo_root: PathBuf, team_id: &str) -> Self {
        let worktree_root = repo_root
            .join(crate::constants::WORKTREE_DIR_NAME)
            .join(team_id);
        Self {
            repo_root,
            worktree_root,
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The main repo checkout merges run against — where conflicted files
    /// actually land, as distinct from any per-agent worktree path.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await?;
        Ok(output)
    }

    fn git_err(context: &str, output: &std::process::Output) -> RalphError {
        RalphError::Git {
            message: format!("{context}: {}", String::from_utf8_lossy(&output.stderr)),
        }
    }

    /// Creates a fresh worktree on a new branch based on `base_branch`.
    pub async fn create_worktree(&self, agent_id: &str, base_branch: &str) -> Result<AgentWorktree> {
        let _lock = self.git_lock.lock().await;

        let branch = format!("ralph/{agent_id}");
        let path = self.worktree_root.join(agent_id);

        tokio::fs::create_dir_all(&self.worktree_root).await?;

        let output = self
            .run_git(
                &self.repo_root,
                &[
                    "worktree",
                    "add",
                    "-b",
                    &branch,
                    path.to_str().ok_or_else(|| RalphError::Git {
                        message: "worktree path is not valid UTF-8".to_string(),
                    })?,
                    base_branch,
                ],
            )
            .await?;

        if !output.status.success() {
            return Err(Self::git_err("failed to create worktree", &output));
        }

        info!(agent_id, branch = %branch, "created worktree");
        Ok(AgentWorktree {
            agent_id: agent_id.to_string(),
            path,
            branch,
            base_branch: base_branch.to_string(),
        })
    }

    /// Removes the worktree directory and deletes its branch.
    pub async fn remove_worktree(&self, worktree: &AgentWorktree) -> Result<()> {
        let _lock = self.git_lock.lock().await;

        let path_str = worktree.path.to_string_lossy().to_string();
        let output = self
            .run_git(&self.repo_root, &["worktree", "remove", &path_str])
            .await?;

        if !output.status.success() {
            warn!(agent_id = %worktree.agent_id, "worktree remove failed, forcing");
            let _ = self
                .run_git(&self.repo_root, &["worktree", "remove", "--force", &path_str])
                .await;
        }

        let _ = self
            .run_git(&self.repo_root, &["branch", "-D", &worktree.branch])
            .await;

        Ok(())
    }

    /// Removes any worktree directories under the team's worktree root
    /// that git no longer tracks — leftovers from a prior crashed run.
    pub async fn cleanup_stale_worktrees(&self) -> Result<()> {
        let _lock = self.git_lock.lock().await;

        if !self.worktree_root.exists() {
            return Ok(());
        }

        let output = self.run_git(&self.repo_root, &["worktree", "prune"]).await?;
        if !output.status.success() {
            warn!("git worktree prune failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    /// Stages and commits all changes in the worktree. Returns `None` if
    /// there was nothing to commit.
    pub async fn commit_worktree(&self, worktree: &AgentWorktree, message: &str) -> Result<Option<String>> {
        let add = self.run_git(&worktree.path, &["add", "-A"]).await?;
        if !add.status.success() {
            return Err(Self::git_err("git add failed", &add));
        }

        let commit = self.run_git(&worktree.path, &["commit", "-m", message]).await?;
        if !commit.status.success() {
            let stderr = String::from_utf8_lossy(&commit.stderr);
            if stderr.contains("nothing to commit") {
                return Ok(None);
            }
            return Err(Self::git_err("git commit failed", &commit));
        }

        let rev = self.run_git(&worktree.path, &["rev-parse", "HEAD"]).await?;
        Ok(Some(String::from_utf8_lossy(&rev.stdout).trim().to_string()))
    }

    pub async fn list_modified_files(&self, worktree: &AgentWorktree) -> Result<Vec<String>> {
        let output = self
            .run_git(
                &worktree.path,
                &["diff", "--name-only", &format!("{}^", worktree.branch), &worktree.branch],
            )
            .await?;
        Ok(lines(&output.stdout))
    }

    /// Merges `worktree`'s branch onto `target_branch` in the main repo,
    /// per the configured strategy (spec.md 4.6).
    pub async fn merge_branch(
        &self,
        worktree: &AgentWorktree,
        target_branch: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome> {
        let _lock = self.git_lock.lock().await;

        let checkout = self
            .run_git(&self.repo_root, &["checkout", target_branch])
            .await?;
        if !checkout.status.success() {
            return Ok(MergeOutcome {
                success: false,
                error: Some(format!(
                    "failed to checkout {target_branch}: {}",
                    String::from_utf8_lossy(&checkout.stderr)
                )),
                ..Default::default()
            });
        }

        if matches!(strategy, MergeStrategy::RebaseThenMerge) {
            let rebase = self
                .run_git(&worktree.path, &["rebase", target_branch])
                .await?;
            if !rebase.status.success() {
                let _ = self.run_git(&worktree.path, &["rebase", "--abort"]).await;
                debug!(agent_id = %worktree.agent_id, "rebase failed, falling back to direct merge");
            }
        }

        let merge_args: Vec<&str> = match strategy {
            MergeStrategy::Sequential | MergeStrategy::MergeDirect | MergeStrategy::RebaseThenMerge => {
                vec!["merge", "--no-ff", &worktree.branch]
            }
        };

        let merge = self.run_git(&self.repo_root, &merge_args).await?;

        if merge.status.success() {
            let modified = self.list_modified_files(worktree).await.unwrap_or_default();
            let rev = self.run_git(&self.repo_root, &["rev-parse", "HEAD"]).await?;
            return Ok(MergeOutcome {
                success: true,
                modified_files: modified,
                commit_hash: Some(String::from_utf8_lossy(&rev.stdout).trim().to_string()),
                ..Default::default()
            });
        }

        let stderr = String::from_utf8_lossy(&merge.stderr);
        if stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let conflicts = self.list_conflicts().await?;
            return Ok(MergeOutcome {
                success: false,
                conflicted_files: conflicts,
                error: Some(format!("merge conflict: {stderr}")),
                ..Default::default()
            });
        }

        Ok(MergeOutcome {
            success: false,
            error: Some(format!("merge failed: {stderr}")),
            ..Default::default()
        })
    }

    /// Aborts an in-progress conflicted merge.
    pub async fn abort_merge(&self) -> Result<()> {
        let _ = self.run_git(&self.repo_root, &["merge", "--abort"]).await;
        Ok(())
    }

    /// Commits the resolved state after a successful conflict resolution.
    pub async fn commit_resolved_merge(&self, message: &str) -> Result<String> {
        let commit = self.run_git(&self.repo_root, &["commit", "-m", message]).await?;
        if !commit.status.success() {
            return Err(Self::git_err("failed to commit resolved merge", &commit));
        }
        let rev = self.run_git(&self.repo_root, &["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&rev.stdout).trim().to_string())
    }

    pub async fn list_conflicts(&self) -> Result<Vec<String>> {
        let output = self
            .run_git(&self.repo_root, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(lines(&output.stdout))
    }
}

fn lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &Path) {
        StdCommand::new("git").args(["init", "-b", "main"]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["config", "user.email", "test@example.com"]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["config", "user.name", "Test"]).current_dir(dir).output().unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        StdCommand::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["commit", "-m", "init"]).current_dir(dir).output().unwrap();
    }

    #[tokio::test]
    async fn create_and_remove_worktree_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let manager = GitWorktreeManager::new(dir.path().to_path_buf(), "team-a");

        let worktree = manager.create_worktree("agent-1", "main").await.unwrap();
        assert!(worktree.path.exists());

        manager.remove_worktree(&worktree).await.unwrap();
        assert!(!worktree.path.exists());
    }

    #[tokio::test]
    async fn commit_worktree_returns_none_when_nothing_changed() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let manager = GitWorktreeManager::new(dir.path().to_path_buf(), "team-a");
        let worktree = manager.create_worktree("agent-1", "main").await.unwrap();

        let result = manager.commit_worktree(&worktree, "no-op").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn merge_clean_branch_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let manager = GitWorktreeManager::new(dir.path().to_path_buf(), "team-a");
        let worktree = manager.create_worktree("agent-1", "main").await.unwrap();

        std::fs::write(worktree.path.join("feature.txt"), "new feature\n").unwrap();
        manager.commit_worktree(&worktree, "add feature").await.unwrap();

        let outcome = manager
            .merge_branch(&worktree, "main", MergeStrategy::MergeDirect)
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.modified_files.contains(&"feature.txt".to_string()));
    }

    #[tokio::test]
    async fn merge_conflicting_branch_reports_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let manager = GitWorktreeManager::new(dir.path().to_path_buf(), "team-a");

        let worktree_a = manager.create_worktree("agent-1", "main").await.unwrap();
        std::fs::write(worktree_a.path.join("README.md"), "agent-1 change\n").unwrap();
        manager.commit_worktree(&worktree_a, "agent-1 edit").await.unwrap();
        manager
            .merge_branch(&worktree_a, "main", MergeStrategy::MergeDirect)
            .await
            .unwrap();

        let worktree_b = manager.create_worktree("agent-2", "main").await.unwrap();
        std::fs::write(worktree_b.path.join("README.md"), "agent-2 conflicting change\n").unwrap();
        manager.commit_worktree(&worktree_b, "agent-2 edit").await.unwrap();

        let outcome = manager
            .merge_branch(&worktree_b, "main", MergeStrategy::MergeDirect)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.conflicted_files.contains(&"README.md".to_string()));

        manager.abort_merge().await.unwrap();
    }
}
