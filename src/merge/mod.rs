//! Incremental, dependency-ordered merging of per-agent branches with
//! file-overlap detection and AI-assisted conflict resolution
//! (spec.md 4.6).

use crate::conflict_resolver;
use crate::fs_lock;
use crate::git::{AgentWorktree, GitWorktreeManager};
use crate::models::{FileOwnership, MergeStatus, MergeStrategy, Task};
use crate::task_store::TaskStore;
use crate::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Severity of a file touched by more than one task (spec.md 4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone)]
pub struct FileConflictWarning {
    pub file: String,
    pub task_ids: Vec<String>,
    pub severity: OverlapSeverity,
}

pub struct MergeManager {
    merge_lock_path: PathBuf,
    merge_lock_timeout: Duration,
    git: Arc<GitWorktreeManager>,
    conflict_resolver_executable: String,
    conflict_resolver_timeout: Option<Duration>,
    queue: Mutex<VecDeque<String>>,
    ownership: Mutex<FileOwnership>,
}

impl MergeManager {
    pub fn new(
        merge_lock_path: PathBuf,
        merge_lock_timeout: Duration,
        git: Arc<GitWorktreeManager>,
        conflict_resolver_executable: String,
        conflict_resolver_timeout: Option<Duration>,
    ) -> Self {
        Self {
            merge_lock_path,
            merge_lock_timeout,
            git,
            conflict_resolver_executable,
            conflict_resolver_timeout,
            queue: Mutex::new(VecDeque::new()),
            ownership: Mutex::new(FileOwnership::default()),
        }
    }

    /// Flags every file touched by two or more independent tasks.
    /// "Independent" means no dependency path connects them.
    pub fn detect_file_overlap(&self, tasks: &[Task]) -> Vec<FileConflictWarning> {
        let mut by_file: HashMap<&str, Vec<&Task>> = HashMap::new();
        for task in tasks {
            for file in &task.files {
                by_file.entry(file.as_str()).or_default().push(task);
            }
        }

        let mut warnings = Vec::new();
        for (file, owners) in by_file {
            if owners.len() < 2 {
                continue;
            }
            let independent_count = count_independent(&owners);
            let severity = if independent_count >= 3 {
                OverlapSeverity::Critical
            } else if independent_count == 2 {
                OverlapSeverity::High
            } else if owners.len() >= 2 {
                OverlapSeverity::Medium
            } else {
                OverlapSeverity::Low
            };
            warnings.push(FileConflictWarning {
                file: file.to_string(),
                task_ids: owners.iter().map(|t| t.id.clone()).collect(),
                severity,
            });
        }
        warnings
    }

    /// Enqueues `task_id` if not already queued — caller is responsible
    /// for having already verified the task is `completed`.
    pub async fn queue_for_merge(&self, task_id: &str) {
        let mut queue = self.queue.lock().await;
        if !queue.contains(&task_id.to_string()) {
            queue.push_back(task_id.to_string());
        }
    }

    /// True iff every dependency of `task_id` has merge status `merged`.
    pub fn is_ready_to_merge(&self, task_id: &str, all_tasks: &[Task]) -> bool {
        let Some(task) = all_tasks.iter().find(|t| t.id == task_id) else {
            return false;
        };
        task.depends_on.iter().all(|dep| {
            all_tasks
                .iter()
                .any(|t| &t.id == dep && t.merge_status == MergeStatus::Merged)
        })
    }

    /// Kahn's-algorithm topological order over the sub-graph restricted
    /// to `completed` tasks. Tasks left over due to a cycle (should not
    /// occur) are appended in arbitrary order, best-effort.
    pub fn topological_order(completed_tasks: &[Task]) -> Vec<String> {
        let ids: HashSet<&str> = completed_tasks.iter().map(|t| t.id.as_str()).collect();
        let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for task in completed_tasks {
            for dep in &task.depends_on {
                if ids.contains(dep.as_str()) {
                    *in_degree.get_mut(task.id.as_str()).unwrap() += 1;
                    dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
                }
            }
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut ordered = Vec::new();
        let mut visited = HashSet::new();

        while let Some(id) = ready.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            ordered.push(id.to_string());
            if let Some(deps) = dependents.get(id) {
                for dependent in deps {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        for id in ids {
            if !visited.contains(id) {
                ordered.push(id.to_string());
            }
        }

        ordered
    }

    /// Picks the next queued task whose dependencies are all merged, in
    /// topological order, and executes the merge. Returns `None` if
    /// nothing in the queue is currently mergeable.
    pub async fn process_next_merge(
        &self,
        task_store: &TaskStore,
        worktrees: &HashMap<String, AgentWorktree>,
        target_branch: &str,
        strategy: MergeStrategy,
    ) -> Result<Option<String>> {
        let all_tasks = task_store.get_all().await;
        let completed: Vec<Task> = all_tasks
            .iter()
            .filter(|t| t.status == crate::models::TaskStatus::Completed)
            .cloned()
            .collect();
        let order = Self::topological_order(&completed);

        let next_id = {
            let queue = self.queue.lock().await;
            order
                .iter()
                .find(|id| queue.contains(id) && self.is_ready_to_merge(id, &all_tasks))
                .cloned()
        };

        let Some(task_id) = next_id else {
            return Ok(None);
        };

        self.merge_one(&task_id, task_store, worktrees, target_branch, strategy)
            .await?;

        let mut queue = self.queue.lock().await;
        queue.retain(|id| id != &task_id);

        Ok(Some(task_id))
    }

    /// Drains every readily-mergeable task until none remain.
    pub async fn process_all_merges(
        &self,
        task_store: &TaskStore,
        worktrees: &HashMap<String, AgentWorktree>,
        target_branch: &str,
        strategy: MergeStrategy,
    ) -> Result<Vec<String>> {
        let mut merged = Vec::new();
        while let Some(task_id) =
            self.process_next_merge(task_store, worktrees, target_branch, strategy).await?
        {
            merged.push(task_id);
        }
        Ok(merged)
    }

    async fn merge_one(
        &self,
        task_id: &str,
        task_store: &TaskStore,
        worktrees: &HashMap<String, AgentWorktree>,
        target_branch: &str,
        strategy: MergeStrategy,
    ) -> Result<()> {
        let _lock = fs_lock::acquire(&self.merge_lock_path, self.merge_lock_timeout).await?;

        let Some(worktree) = worktrees.get(task_id) else {
            warn!(task_id, "no worktree registered for task, skipping merge");
            return Ok(());
        };

        mark_merge_status(task_store, task_id, MergeStatus::Merging).await?;

        let outcome = self.git.merge_branch(worktree, target_branch, strategy).await?;

        if outcome.success {
            info!(task_id, "merge succeeded");
            self.register_ownership(task_id, &outcome.modified_files).await;
            mark_merge_status(task_store, task_id, MergeStatus::Merged).await?;
            return Ok(());
        }

        if outcome.conflicted_files.is_empty() {
            warn!(task_id, error = ?outcome.error, "merge failed without conflicts");
            mark_merge_status(task_store, task_id, MergeStatus::Failed).await?;
            return Ok(());
        }

        mark_merge_status(task_store, task_id, MergeStatus::ConflictDetected).await?;

        let task_description = task_store
            .get_by_id(task_id)
            .await
            .map(|t| t.description)
            .unwrap_or_default();

        let resolution = conflict_resolver::resolve(
            &self.conflict_resolver_executable,
            self.git.repo_root(),
            &outcome.conflicted_files,
            outcome.error.as_deref().unwrap_or(""),
            &task_description,
            self.conflict_resolver_timeout,
        )
        .await?;

        if resolution.success {
            self.git
                .commit_resolved_merge(&format!("resolve conflicts for {task_id}"))
                .await?;
            self.register_ownership(task_id, &outcome.conflicted_files).await;
            mark_merge_status(task_store, task_id, MergeStatus::Resolved).await?;
            mark_merge_status(task_store, task_id, MergeStatus::Merged).await?;
        } else {
            warn!(task_id, error = ?resolution.error, "conflict resolution failed");
            self.git.abort_merge().await?;
            mark_merge_status(task_store, task_id, MergeStatus::Failed).await?;
        }

        Ok(())
    }

    async fn register_ownership(&self, task_id: &str, files: &[String]) {
        let mut ownership = self.ownership.lock().await;
        for file in files {
            if let Some(previous) = ownership.claim(file.clone(), task_id.to_string()) {
                if previous != task_id {
                    warn!(file, previous_owner = previous, new_owner = task_id, "file ownership overlap");
                }
            }
        }
    }
}

fn count_independent(tasks: &[&Task]) -> usize {
    let mut independent_groups: Vec<&Task> = Vec::new();
    'outer: for task in tasks {
        for existing in &independent_groups {
            if task.depends_on.contains(&existing.id) || existing.depends_on.contains(&task.id) {
                continue 'outer;
            }
        }
        independent_groups.push(task);
    }
    independent_groups.len()
}

async fn mark_merge_status(task_store: &TaskStore, task_id: &str, status: MergeStatus) -> Result<()> {
    // TaskStore doesn't expose merge_status mutation directly in its
    // public contract (spec.md 4.2 lists task-lifecycle operations
    // only); the merge manager owns this field exclusively per spec.md
    // 3's ownership summary, so it mutates through a dedicated helper.
    task_store.set_merge_status(task_id, status).await
}
