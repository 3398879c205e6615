//! Shared data model: the record types every component reads and writes.
//!
//! These types mirror the on-disk JSON/JSONL shapes in `<base>/teams/<team>/`
//! exactly — field names and enum spellings here are the wire format.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// Priority of a task. Ordered `Critical > High > Normal > Low`; claim
/// selection sorts ascending, so `Critical` sorts first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Status of a task in the dependency-aware claim pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-task merge lifecycle, independent of `TaskStatus`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Pending,
    Queued,
    Merging,
    Merged,
    ConflictDetected,
    Resolved,
    Failed,
}

/// Result of a completed task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub summary: String,
    pub files_modified: Vec<String>,
    pub raw_output: String,
    pub duration_secs: f64,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Unit of work tracked by the task store.
///
/// Status transitions are monotonic except `in_progress -> pending`
/// (stale-claim reclaim or retry) and `failed -> pending` (retry while
/// `retry_count < max_retries`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(rename = "taskId")]
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub depends_on: Vec<String>,
    pub files: Vec<String>,
    pub source_line: Option<String>,
    pub category: Option<String>,

    pub status: TaskStatus,
    pub claimed_by_agent_id: Option<String>,
    pub claimed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "error")]
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<TaskResult>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub merge_status: MergeStatus,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            priority: Priority::Normal,
            depends_on: Vec::new(),
            files: Vec::new(),
            source_line: None,
            category: None,
            status: TaskStatus::Pending,
            claimed_by_agent_id: None,
            claimed_at: None,
            last_error: None,
            retry_count: 0,
            max_retries: 2,
            result: None,
            created_at: now(),
            completed_at: None,
            merge_status: MergeStatus::Pending,
        }
    }

    /// True iff pending and every dependency names an existing, completed task.
    pub fn is_claimable(&self, all: &[Task]) -> bool {
        self.status == TaskStatus::Pending
            && self.depends_on.iter().all(|dep| {
                all.iter()
                    .any(|t| &t.id == dep && t.status == TaskStatus::Completed)
            })
    }
}

/// Lifecycle state of a worker agent, per spec.md 4.4.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Spawning,
    Ready,
    Claiming,
    Working,
    Merging,
    Idle,
    ShuttingDown,
    Stopped,
    Error,
}

/// Running totals tracked per agent for stuck-agent detection and reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub output_bytes: u64,
    pub elapsed_secs: f64,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
}

/// A worker running in a dedicated git worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub model: String,
    pub worktree_path: String,
    pub branch_name: String,
    pub spawn_prompt: Option<String>,
    pub require_plan_approval: bool,
    pub state: AgentState,
    pub current_task_id: Option<String>,
    pub stats: AgentStats,
}

impl Agent {
    pub fn new(id: impl Into<String>, model: impl Into<String>, worktree_path: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            worktree_path: worktree_path.into(),
            branch_name: branch_name.into(),
            spawn_prompt: None,
            require_plan_approval: false,
            state: AgentState::Spawning,
            current_task_id: None,
            stats: AgentStats::default(),
        }
    }
}

/// Type of a single mailbox entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    StatusUpdate,
    ShutdownRequest,
    ShutdownResponse,
    PlanSubmission,
    PlanApproval,
    TaskAssignment,
    Broadcast,
}

/// One append-only inbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "messageId")]
    pub id: String,
    #[serde(rename = "fromAgentId")]
    pub from: String,
    #[serde(rename = "toAgentId")]
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub metadata: Option<HashMap<String, String>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Message {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message_type: MessageType, content: impl Into<String>) -> Self {
        let id: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
        Self {
            id,
            from: from.into(),
            to: to.into(),
            message_type,
            content: content.into(),
            metadata: None,
            timestamp: now(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Runtime map from normalized repository path to the agent that most
/// recently claimed or modified it. Used to surface overlap warnings, not
/// to enforce exclusivity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileOwnership {
    pub owners: HashMap<String, String>,
}

impl FileOwnership {
    pub fn claim(&mut self, path: impl Into<String>, agent_id: impl Into<String>) -> Option<String> {
        self.owners.insert(path.into(), agent_id.into())
    }

    pub fn owner_of(&self, path: &str) -> Option<&String> {
        self.owners.get(path)
    }
}

/// Per-team settings read from `teams/<team>/config.json` (spec.md 6,
/// expanded by SPEC_FULL.md 3). Every field tolerates absence so older
/// config files keep loading as new fields are added.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    pub agent_count: usize,
    pub models: Vec<String>,
    pub model_assignment: ModelAssignment,
    pub merge_strategy: MergeStrategy,
    pub max_concurrent_merges: usize,
    pub claim_timeout_secs: u64,
    pub lock_timeout_ms: LockTimeouts,
    pub require_plan_approval: bool,
    pub target_branch: Option<String>,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            agent_count: crate::constants::MIN_AGENT_COUNT,
            models: vec!["default".to_string()],
            model_assignment: ModelAssignment::RoundRobin,
            merge_strategy: MergeStrategy::RebaseThenMerge,
            max_concurrent_merges: crate::constants::DEFAULT_MAX_CONCURRENT_MERGES,
            claim_timeout_secs: crate::constants::DEFAULT_CLAIM_TIMEOUT_SECS,
            lock_timeout_ms: LockTimeouts::default(),
            require_plan_approval: false,
            target_branch: None,
        }
    }
}

impl TeamConfig {
    /// Clamp `agent_count` into the supported range (spec.md 4.7).
    pub fn clamped_agent_count(&self) -> usize {
        self.agent_count
            .clamp(crate::constants::MIN_AGENT_COUNT, crate::constants::MAX_AGENT_COUNT)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelAssignment {
    SameAsLead,
    PerAgent,
    #[default]
    RoundRobin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    RebaseThenMerge,
    MergeDirect,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockTimeouts {
    pub store: u64,
    pub mailbox_write: u64,
    pub mailbox_read: u64,
    pub merge: u64,
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self {
            store: crate::constants::STORE_LOCK_TIMEOUT_MS,
            mailbox_write: crate::constants::MAILBOX_WRITE_LOCK_TIMEOUT_MS,
            mailbox_read: crate::constants::MAILBOX_READ_LOCK_TIMEOUT_MS,
            merge: crate::constants::MERGE_LOCK_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_claimable_with_no_deps() {
        let task = Task::new("task-1", "t", "d");
        assert!(task.is_claimable(&[]));
    }

    #[test]
    fn task_not_claimable_until_dependency_completes() {
        let mut dep = Task::new("task-1", "t", "d");
        let mut task = Task::new("task-2", "t2", "d2");
        task.depends_on.push("task-1".to_string());
        assert!(!task.is_claimable(&[dep.clone(), task.clone()]));
        dep.status = TaskStatus::Completed;
        assert!(task.is_claimable(&[dep, task]));
    }

    #[test]
    fn priority_orders_critical_first() {
        let mut v = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        v.sort();
        assert_eq!(v, vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn message_id_is_twelve_chars() {
        let m = Message::new("lead", "agent-1", MessageType::Text, "hi");
        assert_eq!(m.id.len(), 12);
    }

    #[test]
    fn team_config_tolerates_missing_fields() {
        let cfg: TeamConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.agent_count, crate::constants::MIN_AGENT_COUNT);
        assert_eq!(cfg.merge_strategy, MergeStrategy::RebaseThenMerge);
    }

    #[test]
    fn agent_count_clamped_into_range() {
        let mut cfg = TeamConfig::default();
        cfg.agent_count = 100;
        assert_eq!(cfg.clamped_agent_count(), crate::constants::MAX_AGENT_COUNT);
        cfg.agent_count = 0;
        assert_eq!(cfg.clamped_agent_count(), crate::constants::MIN_AGENT_COUNT);
    }
}
