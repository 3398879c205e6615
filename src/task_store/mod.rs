//! Dependency-aware, file-locked, crash-safe shared work queue.
//!
//! Persists to `<base>/teams/<team>/tasks/tasks.json` and arbitrates
//! claims through the `claims.lock` file lock. A `Clone`-able service
//! struct backed by disk rather than an in-process `Vec`.

use crate::fs_lock;
use crate::models::{MergeStatus, Task, TaskResult, TaskStatus};
use crate::{RalphError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Fire-and-forget notifications the store emits outside the lock.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskAdded(String),
    TaskClaimed { task_id: String, agent_id: String },
    TaskCompleted(String),
    TaskUnblocked(String),
    TaskFailed { task_id: String, error: String },
}

#[derive(Clone)]
pub struct TaskStore {
    tasks_path: PathBuf,
    claims_lock_path: PathBuf,
    claim_timeout: Duration,
    lock_timeout: Duration,
    tasks: Arc<Mutex<Vec<Task>>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    /// Loads the store from disk, resetting any `in_progress` task to
    /// `pending` (the claiming agent is presumed dead) per spec.md 4.2's
    /// crash-safety rule.
    pub async fn load(
        tasks_path: PathBuf,
        claims_lock_path: PathBuf,
        claim_timeout: Duration,
        lock_timeout: Duration,
    ) -> Result<Self> {
        let tasks = if tasks_path.exists() {
            let raw = tokio::fs::read_to_string(&tasks_path).await?;
            match serde_json::from_str::<Vec<Task>>(&raw) {
                Ok(mut loaded) => {
                    for task in &mut loaded {
                        if task.status == TaskStatus::InProgress {
                            warn!(task_id = %task.id, "resetting in_progress task to pending on load");
                            task.status = TaskStatus::Pending;
                            task.claimed_by_agent_id = None;
                            task.claimed_at = None;
                        }
                    }
                    loaded
                }
                Err(e) => {
                    warn!("failed to parse {:?}: {} — starting with empty store", tasks_path, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let (events, _) = broadcast::channel(256);
        let store = Self {
            tasks_path,
            claims_lock_path,
            claim_timeout,
            lock_timeout,
            tasks: Arc::new(Mutex::new(tasks)),
            events,
        };
        store.persist().await;
        Ok(store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    async fn persist(&self) {
        let tasks = self.tasks.lock().await;
        match serde_json::to_string_pretty(&*tasks) {
            Ok(json) => {
                if let Some(parent) = self.tasks_path.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        warn!("failed to create {:?}: {}", parent, e);
                        return;
                    }
                }
                if let Err(e) = tokio::fs::write(&self.tasks_path, json).await {
                    warn!("failed to persist tasks to {:?}: {}", self.tasks_path, e);
                }
            }
            Err(e) => warn!("failed to serialize tasks: {}", e),
        }
    }

    /// Merges the given tasks into the store by ID and persists.
    pub async fn add_tasks(&self, new_tasks: Vec<Task>) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            for task in new_tasks {
                if let Some(existing) = tasks.iter_mut().find(|t| t.id == task.id) {
                    *existing = task;
                } else {
                    tasks.push(task.clone());
                    self.emit(TaskEvent::TaskAdded(task.id.clone()));
                }
            }
        }
        self.persist().await;
        Ok(())
    }

    pub async fn get_all(&self) -> Vec<Task> {
        self.tasks.lock().await.clone()
    }

    pub async fn get_by_id(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.iter().find(|t| t.id == task_id).cloned()
    }

    pub async fn get_claimable(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .filter(|t| t.is_claimable(&tasks))
            .cloned()
            .collect()
    }

    pub async fn get_in_progress(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .cloned()
            .collect()
    }

    /// Claim algorithm (spec.md 4.2): under `claims.lock`, release stale
    /// claims, compute the claimable set, pick the head ordered by
    /// `(priority asc, created_at asc)`, mutate to `in_progress`, persist.
    pub async fn try_claim(&self, agent_id: &str) -> Result<Option<Task>> {
        let guard = fs_lock::try_acquire(&self.claims_lock_path, self.lock_timeout).await?;
        let Some(_guard) = guard else {
            return Ok(None);
        };

        self.release_stale_claims_locked().await;

        let claimed = {
            let mut tasks = self.tasks.lock().await;
            let snapshot = tasks.clone();
            let head = tasks
                .iter_mut()
                .filter(|t| t.is_claimable(&snapshot))
                .min_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));

            match head {
                Some(task) => {
                    task.status = TaskStatus::InProgress;
                    task.claimed_by_agent_id = Some(agent_id.to_string());
                    task.claimed_at = Some(chrono::Utc::now());
                    Some(task.clone())
                }
                None => None,
            }
        };

        self.persist().await;

        if let Some(task) = &claimed {
            info!(task_id = %task.id, agent_id, "task claimed");
            self.emit(TaskEvent::TaskClaimed {
                task_id: task.id.clone(),
                agent_id: agent_id.to_string(),
            });
        }

        Ok(claimed)
    }

    /// Claims a specific task by ID, for lead-driven assignment.
    pub async fn try_claim_task(&self, task_id: &str, agent_id: &str) -> Result<bool> {
        let guard = fs_lock::try_acquire(&self.claims_lock_path, self.lock_timeout).await?;
        let Some(_guard) = guard else {
            return Ok(false);
        };

        self.release_stale_claims_locked().await;

        let claimed = {
            let mut tasks = self.tasks.lock().await;
            let snapshot = tasks.clone();
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task) if task.is_claimable(&snapshot) => {
                    task.status = TaskStatus::InProgress;
                    task.claimed_by_agent_id = Some(agent_id.to_string());
                    task.claimed_at = Some(chrono::Utc::now());
                    true
                }
                _ => false,
            }
        };

        if claimed {
            self.persist().await;
            self.emit(TaskEvent::TaskClaimed {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }

        Ok(claimed)
    }

    /// Completion algorithm (spec.md 4.2): mutate to completed under the
    /// lock, persist, then outside the lock recompute claimability of
    /// every pending dependent and emit `TaskUnblocked` for each newly
    /// claimable one.
    pub async fn complete(&self, task_id: &str, result: TaskResult) -> Result<()> {
        let completed = {
            let mut tasks = self.tasks.lock().await;
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result);
                    task.completed_at = Some(chrono::Utc::now());
                    task.merge_status = MergeStatus::Pending;
                    true
                }
                None => false,
            }
        };

        if !completed {
            debug!(task_id, "complete() called on unknown task, ignoring");
            return Ok(());
        }

        self.persist().await;
        self.emit(TaskEvent::TaskCompleted(task_id.to_string()));

        let newly_claimable = {
            let tasks = self.tasks.lock().await;
            let snapshot = tasks.clone();
            tasks
                .iter()
                .filter(|t| {
                    t.status == TaskStatus::Pending
                        && t.depends_on.contains(&task_id.to_string())
                        && t.is_claimable(&snapshot)
                })
                .map(|t| t.id.clone())
                .collect::<Vec<_>>()
        };

        for id in newly_claimable {
            self.emit(TaskEvent::TaskUnblocked(id));
        }

        Ok(())
    }

    /// `fail`: bumps retry count; retries while under the cap, else
    /// terminal failure.
    pub async fn fail(&self, task_id: &str, error: String) -> Result<()> {
        let failed_terminal = {
            let mut tasks = self.tasks.lock().await;
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task) => {
                    task.retry_count += 1;
                    task.last_error = Some(error.clone());
                    task.claimed_by_agent_id = None;
                    task.claimed_at = None;
                    if task.retry_count < task.max_retries {
                        task.status = TaskStatus::Pending;
                        false
                    } else {
                        task.status = TaskStatus::Failed;
                        true
                    }
                }
                None => return Ok(()),
            }
        };

        self.persist().await;
        if failed_terminal {
            self.emit(TaskEvent::TaskFailed {
                task_id: task_id.to_string(),
                error,
            });
        }
        Ok(())
    }

    /// Moves or releases a claim.
    pub async fn reassign(&self, task_id: &str, new_agent_id: Option<String>) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
                match &new_agent_id {
                    Some(agent_id) => {
                        task.claimed_by_agent_id = Some(agent_id.clone());
                        task.claimed_at = Some(chrono::Utc::now());
                        task.status = TaskStatus::InProgress;
                    }
                    None => {
                        task.claimed_by_agent_id = None;
                        task.claimed_at = None;
                        task.status = TaskStatus::Pending;
                    }
                }
            } else {
                return Err(RalphError::NotFound(format!("task {task_id}")));
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Sets a task's `merge_status`, the one field of `Task` the merge
    /// manager exclusively owns (spec.md 3's ownership summary).
    pub async fn set_merge_status(&self, task_id: &str, status: MergeStatus) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task) => task.merge_status = status,
                None => return Err(RalphError::NotFound(format!("task {task_id}"))),
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Resets `in_progress` claims older than `claim_timeout` back to
    /// `pending`, without acquiring `claims.lock` itself (callers that
    /// already hold it call this directly).
    async fn release_stale_claims_locked(&self) {
        let now = chrono::Utc::now();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.iter_mut() {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let Some(claimed_at) = task.claimed_at else {
                continue;
            };
            let age = now.signed_duration_since(claimed_at);
            if age.num_seconds() as u64 >= self.claim_timeout.as_secs() {
                warn!(task_id = %task.id, "reclaiming stale in_progress task");
                task.status = TaskStatus::Pending;
                task.claimed_by_agent_id = None;
                task.claimed_at = None;
            }
        }
    }

    /// Public entry point: acquires the lock itself before reclaiming.
    pub async fn release_stale_claims(&self) -> Result<()> {
        let _guard = fs_lock::acquire(&self.claims_lock_path, self.lock_timeout).await?;
        self.release_stale_claims_locked().await;
        self.persist().await;
        Ok(())
    }

    /// Removes `tasks.json` and `claims.lock` from disk, used at the end
    /// of a team's lifecycle (spec.md 4.7 "Merge & cleanup"). Leaves the
    /// in-memory snapshot untouched.
    pub async fn delete_persistence_files(&self) -> Result<()> {
        for path in [&self.tasks_path, &self.claims_lock_path] {
            if path.exists() {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    async fn new_store(dir: &std::path::Path) -> TaskStore {
        TaskStore::load(
            dir.join("tasks.json"),
            dir.join("claims.lock"),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn claim_skips_tasks_with_incomplete_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path()).await;

        let mut blocked = Task::new("task-2", "second", "d");
        blocked.depends_on.push("task-1".to_string());
        store.add_tasks(vec![blocked]).await.unwrap();

        let claimed = store.try_claim("agent-1").await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path()).await;

        let mut low = Task::new("task-1", "low", "d");
        low.priority = Priority::Low;
        let mut critical = Task::new("task-2", "critical", "d");
        critical.priority = Priority::Critical;

        store.add_tasks(vec![low, critical]).await.unwrap();

        let claimed = store.try_claim("agent-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, "task-2");
    }

    #[tokio::test]
    async fn completion_unblocks_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path()).await;

        let root = Task::new("task-1", "root", "d");
        let mut dependent = Task::new("task-2", "dependent", "d");
        dependent.depends_on.push("task-1".to_string());
        store.add_tasks(vec![root, dependent]).await.unwrap();

        let mut events = store.subscribe();
        store.try_claim("agent-1").await.unwrap();
        store
            .complete(
                "task-1",
                TaskResult {
                    success: true,
                    summary: "done".to_string(),
                    files_modified: vec![],
                    raw_output: String::new(),
                    duration_secs: 1.0,
                    completed_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        let claimable = store.get_claimable().await;
        assert_eq!(claimable.len(), 1);
        assert_eq!(claimable[0].id, "task-2");

        let mut saw_unblocked = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TaskEvent::TaskUnblocked(id) if id == "task-2") {
                saw_unblocked = true;
            }
        }
        assert!(saw_unblocked);
    }

    #[tokio::test]
    async fn parallel_fan_out_claims_all_independent_tasks_in_priority_then_age_order() {
        // S2: three independent tasks a/b/c, priorities high/normal/normal,
        // three agents claiming in sequence. `a` goes first on priority;
        // `b` and `c` follow in creation order; a fourth claim attempt
        // finds nothing left, and completing all three unblocks nothing.
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path()).await;

        let mut a = Task::new("task-a", "a", "d");
        a.priority = Priority::High;
        let b = Task::new("task-b", "b", "d");
        let c = Task::new("task-c", "c", "d");
        store.add_tasks(vec![a, b, c]).await.unwrap();

        let first = store.try_claim("agent-1").await.unwrap().unwrap();
        assert_eq!(first.id, "task-a");
        let second = store.try_claim("agent-2").await.unwrap().unwrap();
        assert_eq!(second.id, "task-b");
        let third = store.try_claim("agent-3").await.unwrap().unwrap();
        assert_eq!(third.id, "task-c");

        assert!(store.get_claimable().await.is_empty());
        assert!(store.try_claim("agent-4").await.unwrap().is_none());

        let mut events = store.subscribe();
        for id in ["task-a", "task-b", "task-c"] {
            store
                .complete(
                    id,
                    TaskResult {
                        success: true,
                        summary: "done".to_string(),
                        files_modified: vec![],
                        raw_output: String::new(),
                        duration_secs: 1.0,
                        completed_at: chrono::Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let mut unblocked_count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TaskEvent::TaskUnblocked(_)) {
                unblocked_count += 1;
            }
        }
        assert_eq!(unblocked_count, 0);
    }

    #[tokio::test]
    async fn fail_retries_until_max_then_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path()).await;

        let mut task = Task::new("task-1", "t", "d");
        task.max_retries = 1;
        store.add_tasks(vec![task]).await.unwrap();

        store.try_claim("agent-1").await.unwrap();
        store.fail("task-1", "boom".to_string()).await.unwrap();
        let after_first = store.get_by_id("task-1").await.unwrap();
        assert_eq!(after_first.status, TaskStatus::Pending);

        store.try_claim("agent-1").await.unwrap();
        store.fail("task-1", "boom again".to_string()).await.unwrap();
        let after_second = store.get_by_id("task-1").await.unwrap();
        assert_eq!(after_second.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn stale_claim_is_reclaimed_by_the_next_claim_attempt() {
        // S4: agent-1 claims t1 with a short claim timeout; once the
        // timeout has elapsed with no completion, the next try_claim by
        // any agent observes release_stale_claims putting it back to
        // pending and claims it itself.
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(
            dir.path().join("tasks.json"),
            dir.path().join("claims.lock"),
            Duration::from_millis(50),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        store.add_tasks(vec![Task::new("task-1", "t", "d")]).await.unwrap();

        let first = store.try_claim("agent-1").await.unwrap().unwrap();
        assert_eq!(first.claimed_by_agent_id.as_deref(), Some("agent-1"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = store.try_claim("agent-2").await.unwrap().unwrap();
        assert_eq!(second.id, "task-1");
        assert_eq!(second.claimed_by_agent_id.as_deref(), Some("agent-2"));
    }

    #[tokio::test]
    async fn crash_recovery_resets_in_progress_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let tasks_path = dir.path().join("tasks.json");
        let mut task = Task::new("task-1", "t", "d");
        task.status = TaskStatus::InProgress;
        task.claimed_by_agent_id = Some("agent-1".to_string());
        tokio::fs::write(&tasks_path, serde_json::to_string(&vec![task]).unwrap())
            .await
            .unwrap();

        let store = TaskStore::load(
            tasks_path,
            dir.path().join("claims.lock"),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let reloaded = store.get_by_id("task-1").await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert!(reloaded.claimed_by_agent_id.is_none());
    }
}
