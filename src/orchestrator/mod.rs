//! Lead Orchestrator (spec.md 4.7): decompose -> spawn -> coordinate ->
//! synthesize -> merge & cleanup.

pub mod decompose;

use crate::agent::state::StateChanged;
use crate::agent::task_agent::TaskAgentConfig;
use crate::agent::AgentRuntime;
use crate::constants::{
    COORDINATION_TICK_MS, MAX_CONSECUTIVE_PARSE_FAILURES, PLAN_LONG_CHARS, PLAN_MIN_CHARS,
    PLAN_MIN_KEYWORD_HITS, STUCK_AGENT_MULTIPLIER,
};
use crate::git::GitWorktreeManager;
use crate::merge::MergeManager;
use crate::message_bus::MessageBus;
use crate::models::{Agent, AgentState, MessageType, ModelAssignment, Task, TaskStatus, TeamConfig};
use crate::task_store::TaskStore;
use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Disposition the lead AI chooses for a failed task in lead-driven mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedTaskDisposition {
    RetryTask,
    SkipTask,
    DeclareComplete,
}

/// Events the orchestrator surfaces to its embedder (CLI or library
/// caller) — the typed-channel replacement for reference-captured
/// multicast handlers (SPEC_FULL.md 7 / spec.md 9 REDESIGN FLAGS).
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    QueueUpdate { pending: usize, in_progress: usize, completed: usize, failed: usize },
    StuckAgent { agent_id: String },
    Warning(String),
    Error { source: String, message: String },
}

struct AgentHandle {
    runtime_cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
    state_watcher: JoinHandle<()>,
}

pub struct LeadOrchestrator {
    team_id: String,
    repo_root: PathBuf,
    target_branch: String,
    team_config: TeamConfig,
    task_store: TaskStore,
    message_bus: MessageBus,
    git: Arc<GitWorktreeManager>,
    merge_manager: Arc<MergeManager>,
    agents: Arc<Mutex<HashMap<String, Agent>>>,
    agent_worktrees: Mutex<HashMap<String, crate::git::AgentWorktree>>,
    handles: Mutex<HashMap<String, AgentHandle>>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    consecutive_parse_failures: Mutex<u32>,
}

impl LeadOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        team_id: String,
        repo_root: PathBuf,
        team_config: TeamConfig,
        task_store: TaskStore,
        message_bus: MessageBus,
        git: Arc<GitWorktreeManager>,
        merge_manager: Arc<MergeManager>,
        events: mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> Self {
        let target_branch = team_config.target_branch.clone().unwrap_or_else(|| "main".to_string());
        Self {
            team_id,
            repo_root,
            target_branch,
            team_config,
            task_store,
            message_bus,
            git,
            merge_manager,
            agents: Arc::new(Mutex::new(HashMap::new())),
            agent_worktrees: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            events,
            consecutive_parse_failures: Mutex::new(0),
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    /// Resumes from a persisted store if it has pending work; otherwise
    /// parses `plan_markdown` (checklist) or `ai_team_tasks` (a prior
    /// `---TEAM_TASKS---` response) into the initial backlog.
    pub async fn decompose(&self, plan_markdown: Option<&str>, ai_team_tasks: Option<&str>) -> Result<()> {
        let existing = self.task_store.get_all().await;
        if existing.iter().any(|t| t.status == TaskStatus::Pending || t.status == TaskStatus::InProgress) {
            info!(team_id = %self.team_id, "resuming from persisted task store");
            return Ok(());
        }

        let tasks = if let Some(response) = ai_team_tasks {
            decompose::parse_team_tasks_block(response)
        } else if let Some(markdown) = plan_markdown {
            decompose::parse_plan_markdown(markdown)
        } else {
            Vec::new()
        };

        if tasks.is_empty() {
            warn!(team_id = %self.team_id, "decompose produced no tasks");
        }
        self.task_store.add_tasks(tasks).await
    }

    /// Spawns the configured number of task agents (clamped [2, 8]),
    /// each in its own worktree, and starts its run loop. A worktree
    /// creation failure is isolated to that one agent (`spawning ->
    /// error`, spec.md 4.4) rather than aborting the whole team — the
    /// other agents still spawn and the team proceeds short-handed.
    pub async fn spawn(&self) -> Result<()> {
        self.git.cleanup_stale_worktrees().await?;

        let agent_count = self.team_config.clamped_agent_count();
        let mut agents = self.agents.lock().await;
        let mut agent_worktrees = self.agent_worktrees.lock().await;
        let mut handles = self.handles.lock().await;

        for index in 0..agent_count {
            let agent_id = format!("agent-{}", index + 1);
            let model = assign_model(&self.team_config, index);

            let worktree = match self.git.create_worktree(&agent_id, &self.target_branch).await {
                Ok(worktree) => worktree,
                Err(e) => {
                    warn!(agent_id, "worktree creation failed, agent enters error state: {}", e);
                    let mut failed_agent = Agent::new(agent_id.clone(), model, "", "");
                    failed_agent.state = AgentState::Error;
                    agents.insert(agent_id.clone(), failed_agent);
                    self.emit(OrchestratorEvent::Error {
                        source: format!("spawn:{agent_id}"),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let task_agent_config = TaskAgentConfig {
                model: model.clone(),
                executable: "claude".to_string(),
                phase_timeout: Duration::from_secs(crate::constants::DEFAULT_PHASE_TIMEOUT_SECS),
                run_plan_phase: true,
                run_code_phase: true,
                verify_command: None,
            };

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let mut runtime = AgentRuntime::new(
                agent_id.clone(),
                worktree.clone(),
                self.task_store.clone(),
                self.message_bus.clone(),
                Arc::clone(&self.git),
                task_agent_config,
                self.team_config.require_plan_approval,
                cancel_rx,
            );

            // Subscribed before the runtime is moved into its own task, so
            // no StateChanged event can be missed between spawn and the
            // first state transition.
            let state_rx = runtime.subscribe();
            let state_watcher = tokio::spawn(mirror_agent_state(Arc::clone(&self.agents), state_rx));

            let join = tokio::spawn(async move {
                if let Err(e) = runtime.run().await {
                    warn!("agent runtime exited with error: {}", e);
                }
            });

            agents.insert(
                agent_id.clone(),
                Agent::new(agent_id.clone(), model, worktree.path.to_string_lossy(), worktree.branch.clone()),
            );
            agent_worktrees.insert(agent_id.clone(), worktree.clone());
            handles.insert(agent_id, AgentHandle { runtime_cancel: cancel_tx, join, state_watcher });
        }

        Ok(())
    }

    /// Evaluates a submitted plan per spec.md 4.7's heuristic: non-empty,
    /// at least `PLAN_MIN_CHARS`, and either enough task-keyword hits or
    /// long enough to be assumed substantive.
    fn evaluate_plan(plan: &str) -> bool {
        if plan.trim().len() < PLAN_MIN_CHARS {
            return false;
        }
        const KEYWORDS: [&str; 6] = ["implement", "test", "add", "modify", "create", "refactor"];
        let lower = plan.to_lowercase();
        let hits = KEYWORDS.iter().filter(|k| lower.contains(*k)).count();
        hits >= PLAN_MIN_KEYWORD_HITS || plan.len() >= PLAN_LONG_CHARS
    }

    /// Detects agents working far longer than the team's average task
    /// duration without a recent status update (spec.md 4.7 — logged as
    /// suspect, never auto-killed).
    async fn detect_stuck_agents(&self, avg_task_duration: Duration) {
        let agents = self.agents.lock().await;
        let threshold = avg_task_duration.mul_f64(STUCK_AGENT_MULTIPLIER);
        for agent in agents.values() {
            if agent.state != AgentState::Working {
                continue;
            }
            let Some(last_activity) = agent.stats.last_activity else {
                continue;
            };
            let idle_for = chrono::Utc::now().signed_duration_since(last_activity);
            if idle_for.num_seconds() as u64 >= threshold.as_secs() {
                warn!(agent_id = %agent.id, "agent appears stuck");
                self.emit(OrchestratorEvent::StuckAgent { agent_id: agent.id.clone() });
            }
        }
    }

    /// Continuous coordination loop: drains the lead inbox, evaluates
    /// submitted plans, detects stuck agents, emits queue statistics,
    /// and exits once the store and every agent are quiescent.
    pub async fn coordinate(&self) -> Result<()> {
        let known_ids = self.message_bus.known_agent_ids().await?;
        let avg_task_duration = Duration::from_secs(600);

        loop {
            for message in self.message_bus.poll("lead").await? {
                match message.message_type {
                    MessageType::PlanSubmission => {
                        let approved = Self::evaluate_plan(&message.content);
                        let response = if approved { "approve" } else { "reject: plan too thin" };
                        self.message_bus
                            .send("lead", &message.from, MessageType::PlanApproval, response, None)
                            .await?;
                    }
                    MessageType::StatusUpdate => {
                        let mut agents = self.agents.lock().await;
                        if let Some(agent) = agents.get_mut(&message.from) {
                            agent.stats.last_activity = Some(chrono::Utc::now());
                        }
                    }
                    _ => {}
                }
            }

            self.detect_stuck_agents(avg_task_duration).await;

            let tasks = self.task_store.get_all().await;
            let pending = tasks.iter().filter(|t| t.status == TaskStatus::Pending).count();
            let in_progress = tasks.iter().filter(|t| t.status == TaskStatus::InProgress).count();
            let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
            let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
            self.emit(OrchestratorEvent::QueueUpdate { pending, in_progress, completed, failed });

            for task in tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
                self.merge_manager.queue_for_merge(&task.id).await;
            }

            let agents_quiescent = {
                let agents = self.agents.lock().await;
                agents.values().all(|a| {
                    matches!(
                        a.state,
                        AgentState::Idle | AgentState::Stopped | AgentState::ShuttingDown | AgentState::Error
                    )
                })
            };

            if pending == 0 && in_progress == 0 && agents_quiescent {
                break;
            }

            let _ = &known_ids;
            tokio::time::sleep(Duration::from_millis(COORDINATION_TICK_MS)).await;
        }

        Ok(())
    }

    /// Assembles a summary report: per-task status with owning agent,
    /// plus accumulated `text` findings from agents.
    pub async fn synthesize(&self) -> Result<String> {
        let tasks = self.task_store.get_all().await;
        let mut report = String::new();
        report.push_str(&format!("Team {} summary\n", self.team_id));
        for task in &tasks {
            report.push_str(&format!(
                "- {} [{:?}] owner={}\n",
                task.id,
                task.status,
                task.claimed_by_agent_id.as_deref().unwrap_or("-")
            ));
        }

        let findings = self.message_bus.poll("lead").await.unwrap_or_default();
        for message in findings.into_iter().filter(|m| m.message_type == MessageType::Text) {
            report.push_str(&format!("finding from {}: {}\n", message.from, message.content));
        }

        Ok(report)
    }

    /// Current agent-to-worktree mapping, for callers (the CLI, tests)
    /// that need it once `spawn` has run.
    pub async fn agent_worktrees(&self) -> HashMap<String, crate::git::AgentWorktree> {
        self.agent_worktrees.lock().await.clone()
    }

    /// Invokes the merge manager over every completed task, signals every
    /// agent to stop and awaits it (spec.md 9's "track every spawned
    /// worker and await it on shutdown"), removes worktrees, and deletes
    /// the store's persistence files.
    pub async fn merge_and_cleanup(&self) -> Result<()> {
        let worktrees = self.agent_worktrees().await;

        self.merge_manager
            .process_all_merges(&self.task_store, &worktrees, &self.target_branch, self.team_config.merge_strategy)
            .await?;

        let mut handles = self.handles.lock().await;
        for (agent_id, handle) in handles.drain() {
            let _ = handle.runtime_cancel.send(true);
            if let Err(e) = handle.join.await {
                warn!(agent_id, "agent task panicked during shutdown: {}", e);
            }
            // The runtime's broadcast sender is dropped with it, so the
            // watcher should already have exited on its own; abort is a
            // no-op in that case and a safety net otherwise.
            handle.state_watcher.abort();
            if let Some(worktree) = worktrees.get(&agent_id) {
                if let Err(e) = self.git.remove_worktree(worktree).await {
                    warn!(agent_id, "failed to remove worktree during cleanup: {}", e);
                }
            }
        }
        drop(handles);

        self.task_store.delete_persistence_files().await?;

        Ok(())
    }

    /// `request_shutdown(agent_id)` — safe at any time during coordination.
    pub async fn request_shutdown(&self, agent_id: &str) {
        let handles = self.handles.lock().await;
        if let Some(handle) = handles.get(agent_id) {
            let _ = handle.runtime_cancel.send(false);
        }
        if let Err(e) = self
            .message_bus
            .send("lead", agent_id, MessageType::ShutdownRequest, "shutdown requested", None)
            .await
        {
            self.emit(OrchestratorEvent::Error { source: "request_shutdown".to_string(), message: e.to_string() });
        }
    }

    pub async fn add_task(&self, task: Task) -> Result<()> {
        self.task_store.add_tasks(vec![task]).await
    }

    pub async fn reassign_task(&self, task_id: &str, new_agent_id: Option<String>) -> Result<()> {
        self.task_store.reassign(task_id, new_agent_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.task_store.fail(task_id, "cancelled by operator".to_string()).await
    }

    /// Lead-driven alternative mode: consults the lead AI only to
    /// disposition failed tasks; falls back to pure sequential selection
    /// after `MAX_CONSECUTIVE_PARSE_FAILURES` unparseable responses.
    pub async fn disposition_failed_task(&self, ai_response: Option<&str>) -> FailedTaskDisposition {
        let Some(response) = ai_response else {
            return FailedTaskDisposition::RetryTask;
        };

        let parsed = decompose::parse_lead_decision(response).and_then(|decision| {
            match decision.action.as_str() {
                "declare_complete" => Some(FailedTaskDisposition::DeclareComplete),
                "skip_task" => Some(FailedTaskDisposition::SkipTask),
                "retry_task" => Some(FailedTaskDisposition::RetryTask),
                _ => None,
            }
        });

        let mut failures = self.consecutive_parse_failures.lock().await;
        match parsed {
            Some(disposition) => {
                *failures = 0;
                disposition
            }
            None => {
                *failures += 1;
                if *failures >= MAX_CONSECUTIVE_PARSE_FAILURES {
                    warn!("falling back to pure sequential fast-path after repeated unparseable lead responses");
                }
                FailedTaskDisposition::RetryTask
            }
        }
    }
}

fn assign_model(team_config: &TeamConfig, agent_index: usize) -> String {
    if team_config.models.is_empty() {
        return "default".to_string();
    }
    match team_config.model_assignment {
        ModelAssignment::SameAsLead => team_config.models[0].clone(),
        ModelAssignment::PerAgent => team_config
            .models
            .get(agent_index)
            .cloned()
            .unwrap_or_else(|| team_config.models[0].clone()),
        ModelAssignment::RoundRobin => {
            team_config.models[agent_index % team_config.models.len()].clone()
        }
    }
}

/// Mirrors an `AgentRuntime`'s `StateChanged` broadcast into the shared
/// `agents` map so `coordinate()`'s quiescence check observes real
/// lifecycle state rather than the `Spawning` value set at insertion.
/// Lagged events are skipped (the latest state is all that matters); the
/// loop exits once the runtime's sender side is dropped.
async fn mirror_agent_state(
    agents: Arc<Mutex<HashMap<String, Agent>>>,
    mut state_rx: broadcast::Receiver<StateChanged>,
) {
    loop {
        match state_rx.recv().await {
            Ok(change) => {
                let mut agents = agents.lock().await;
                if let Some(agent) = agents.get_mut(&change.agent_id) {
                    agent.state = change.to;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
