//! Runtime loop for one worker agent: the state machine of spec.md 4.4
//! driving a [`crate::agent::task_agent::TaskAgent`] against the shared
//! task store and message bus.

pub mod state;
pub mod task_agent;

use crate::constants::{IDLE_BACKOFF_INITIAL_SECS, IDLE_BACKOFF_MAX_SECS};
use crate::git::{AgentWorktree, GitWorktreeManager};
use crate::message_bus::MessageBus;
use crate::models::{AgentState, MessageType};
use crate::task_store::TaskStore;
use crate::Result;
use state::StateChanged;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_agent::{TaskAgent, TaskAgentConfig};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

pub struct AgentRuntime {
    pub agent_id: String,
    worktree: AgentWorktree,
    task_store: TaskStore,
    message_bus: MessageBus,
    git: Arc<GitWorktreeManager>,
    task_agent: TaskAgent,
    require_plan_approval: bool,
    state: Arc<Mutex<AgentState>>,
    events: broadcast::Sender<StateChanged>,
    shutdown_requested: Arc<AtomicBool>,
    /// Set by the working-phase inbox watcher once it has already sent
    /// the `accepted=false` shutdown ack, so the outer loop does not send
    /// a second, contradictory `accepted=true` ack for the same request.
    working_shutdown_acked: Arc<AtomicBool>,
    cancel: watch::Receiver<bool>,
}

impl AgentRuntime {
    pub fn new(
        agent_id: String,
        worktree: AgentWorktree,
        task_store: TaskStore,
        message_bus: MessageBus,
        git: Arc<GitWorktreeManager>,
        task_agent_config: TaskAgentConfig,
        require_plan_approval: bool,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            agent_id,
            worktree,
            task_store,
            message_bus,
            git,
            task_agent: TaskAgent::new(task_agent_config),
            require_plan_approval,
            state: Arc::new(Mutex::new(AgentState::Spawning)),
            events,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            working_shutdown_acked: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChanged> {
        self.events.subscribe()
    }

    /// Sets the shutdown flag; the running loop observes it at the next
    /// idle tick or after the current task finishes (spec.md 4.4's
    /// "Graceful shutdown protocol").
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    async fn transition(&self, to: AgentState) {
        let mut state = self.state.lock().await;
        let from = *state;
        if !state::is_valid_transition(from, to) {
            warn!(agent_id = %self.agent_id, ?from, ?to, "ignoring invalid state transition");
            return;
        }
        *state = to;
        info!(agent_id = %self.agent_id, ?from, ?to, "agent state transition");
        let _ = self.events.send(StateChanged {
            agent_id: self.agent_id.clone(),
            from,
            to,
        });
    }

    pub async fn current_state(&self) -> AgentState {
        *self.state.lock().await
    }

    /// Drains the inbox, per spec.md 4.4's message-processing rules:
    /// `shutdown_request` triggers shutdown, `plan_approval`/`text`/
    /// `broadcast` are buffered (logged here), `task_assignment` is
    /// logged but does not bypass normal claiming.
    async fn process_inbox(&self) -> Result<()> {
        for message in self.message_bus.poll(&self.agent_id).await? {
            match message.message_type {
                MessageType::ShutdownRequest => {
                    info!(agent_id = %self.agent_id, "shutdown requested via mailbox");
                    self.request_shutdown();
                }
                MessageType::TaskAssignment => {
                    info!(agent_id = %self.agent_id, task = %message.content, "task assignment noted");
                }
                _ => {
                    tracing::debug!(agent_id = %self.agent_id, kind = ?message.message_type, "buffered message");
                }
            }
        }
        Ok(())
    }

    async fn acknowledge_shutdown(&self, accepted: bool, reason: Option<&str>) {
        let content = if accepted {
            "accepted".to_string()
        } else {
            format!("deferred: {}", reason.unwrap_or("finishing current task"))
        };
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("accepted".to_string(), accepted.to_string());
        let _ = self
            .message_bus
            .send(&self.agent_id, "lead", MessageType::ShutdownResponse, &content, Some(metadata))
            .await;
    }

    /// Spawns a background watcher for the duration of the Plan/Code/Verify
    /// run (started only once any plan-approval sub-cycle has finished, so
    /// it never contends with that cycle's own inbox polling) that polls
    /// the inbox for a `shutdown_request` and immediately acknowledges it
    /// with `accepted=false` (spec.md 4.4: "if working, it acknowledges
    /// with accepted=false ... and stops after the current task"). The
    /// watcher never cancels the running phase; it only sets the shutdown
    /// flag so the outer loop stops once the task finishes, and is
    /// aborted once that task finishes either way.
    fn spawn_working_shutdown_watcher(&self) -> tokio::task::JoinHandle<()> {
        let agent_id = self.agent_id.clone();
        let message_bus = self.message_bus.clone();
        let shutdown_requested = Arc::clone(&self.shutdown_requested);
        let working_shutdown_acked = Arc::clone(&self.working_shutdown_acked);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(
                    crate::constants::MAILBOX_POLL_INTERVAL_MS,
                ))
                .await;

                if shutdown_requested.load(Ordering::SeqCst) {
                    // Already flagged via some other path (e.g. request_shutdown()
                    // called in-process); nothing left for this watcher to do.
                    return;
                }

                let Ok(messages) = message_bus.poll(&agent_id).await else {
                    continue;
                };
                if messages
                    .iter()
                    .any(|m| m.message_type == MessageType::ShutdownRequest)
                {
                    shutdown_requested.store(true, Ordering::SeqCst);
                    let mut metadata = std::collections::HashMap::new();
                    metadata.insert("accepted".to_string(), "false".to_string());
                    let _ = message_bus
                        .send(
                            &agent_id,
                            "lead",
                            MessageType::ShutdownResponse,
                            "deferred: finishing current task",
                            Some(metadata),
                        )
                        .await;
                    working_shutdown_acked.store(true, Ordering::SeqCst);
                    return;
                }
            }
        })
    }

    /// Drives the full state machine until `stopped`.
    pub async fn run(&mut self) -> Result<()> {
        self.transition(AgentState::Ready).await;

        let mut backoff = Duration::from_secs(IDLE_BACKOFF_INITIAL_SECS);

        loop {
            if *self.cancel.borrow() {
                self.transition(AgentState::Stopped).await;
                return Ok(());
            }

            self.process_inbox().await?;

            if self.shutdown_requested.load(Ordering::SeqCst) {
                if !self.working_shutdown_acked.load(Ordering::SeqCst) {
                    self.acknowledge_shutdown(true, None).await;
                }
                self.transition(AgentState::ShuttingDown).await;
                let _ = self.task_store.release_stale_claims().await;
                self.transition(AgentState::Stopped).await;
                return Ok(());
            }

            self.transition(AgentState::Claiming).await;
            let claimed = self.task_store.try_claim(&self.agent_id).await?;

            let Some(task) = claimed else {
                self.transition(AgentState::Idle).await;
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.cancel.changed() => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(IDLE_BACKOFF_MAX_SECS));
                continue;
            };
            backoff = Duration::from_secs(IDLE_BACKOFF_INITIAL_SECS);

            self.transition(AgentState::Working).await;

            // The plan-approval sub-cycle polls this agent's own inbox
            // (via `wait_for_message`) for `plan_approval` replies using
            // the same per-agent read cursor the shutdown watcher would
            // use. Starting the watcher only after the cycle completes
            // keeps the two from racing over that cursor and dropping
            // each other's messages.
            if self.require_plan_approval {
                if let Err(e) = self
                    .task_agent
                    .run_plan_approval_cycle(&task, &self.message_bus, &self.agent_id)
                    .await
                {
                    warn!(agent_id = %self.agent_id, task_id = %task.id, "plan approval cycle failed: {}", e);
                }
            }

            let watcher = self.spawn_working_shutdown_watcher();
            let outcome = self.task_agent.execute(&task, &self.worktree).await;
            watcher.abort();

            self.transition(AgentState::Merging).await;
            match outcome {
                Ok(result) if result.success => {
                    if let Some(commit) = self
                        .git
                        .commit_worktree(&self.worktree, &format!("{}: {}", task.id, task.title))
                        .await
                        .unwrap_or(None)
                    {
                        tracing::debug!(agent_id = %self.agent_id, commit, "committed task changes");
                    }
                    self.task_store
                        .complete(
                            &task.id,
                            crate::models::TaskResult {
                                success: true,
                                summary: result.summary,
                                files_modified: result.files_modified,
                                raw_output: String::new(),
                                duration_secs: result.duration.as_secs_f64(),
                                completed_at: chrono::Utc::now(),
                            },
                        )
                        .await?;
                }
                Ok(result) => {
                    self.task_store.fail(&task.id, result.summary).await?;
                }
                Err(e) => {
                    self.task_store.fail(&task.id, e.to_string()).await?;
                }
            }

            self.transition(AgentState::Idle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitWorktreeManager;
    use crate::task_store::TaskStore;
    use task_agent::TaskAgentConfig;

    #[test]
    fn idle_backoff_doubles_and_caps() {
        let mut backoff = Duration::from_secs(IDLE_BACKOFF_INITIAL_SECS);
        let mut seen = vec![backoff];
        for _ in 0..10 {
            backoff = (backoff * 2).min(Duration::from_secs(IDLE_BACKOFF_MAX_SECS));
            seen.push(backoff);
        }
        assert_eq!(*seen.last().unwrap(), Duration::from_secs(IDLE_BACKOFF_MAX_SECS));
        assert!(seen.windows(2).all(|w| w[1] >= w[0]));
    }

    async fn runtime(dir: &std::path::Path) -> AgentRuntime {
        let task_store = TaskStore::load(
            dir.join("tasks.json"),
            dir.join("claims.lock"),
            Duration::from_secs(60),
            Duration::from_millis(500),
        )
        .await
        .unwrap();
        let message_bus = MessageBus::new(
            dir.join("mailboxes"),
            Duration::from_millis(500),
            Duration::from_millis(500),
        );
        let git = Arc::new(GitWorktreeManager::new(dir.to_path_buf(), "team-1"));
        let worktree = AgentWorktree {
            agent_id: "agent-1".to_string(),
            path: dir.to_path_buf(),
            branch: "ralph/agent-1".to_string(),
            base_branch: "main".to_string(),
        };
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        AgentRuntime::new(
            "agent-1".to_string(),
            worktree,
            task_store,
            message_bus,
            git,
            TaskAgentConfig {
                model: "default".to_string(),
                executable: "cat".to_string(),
                phase_timeout: Duration::from_secs(5),
                run_plan_phase: false,
                run_code_phase: false,
                verify_command: None,
            },
            false,
            cancel_rx,
        )
    }

    #[tokio::test]
    async fn working_shutdown_watcher_acks_accepted_false_and_sets_flags() {
        let dir = tempfile::tempdir().unwrap();
        let agent = runtime(dir.path()).await;

        agent
            .message_bus
            .send("lead", "agent-1", MessageType::ShutdownRequest, "please stop", None)
            .await
            .unwrap();

        let watcher = agent.spawn_working_shutdown_watcher();
        tokio::time::timeout(Duration::from_secs(2), watcher)
            .await
            .expect("watcher should observe the pending shutdown request promptly")
            .unwrap();

        assert!(agent.shutdown_requested.load(Ordering::SeqCst));
        assert!(agent.working_shutdown_acked.load(Ordering::SeqCst));

        let response = agent
            .message_bus
            .wait_for_message("lead", MessageType::ShutdownResponse, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("lead should receive a shutdown response");
        assert_eq!(response.message_type, MessageType::ShutdownResponse);
        assert_eq!(
            response.metadata.as_ref().and_then(|m| m.get("accepted")).map(String::as_str),
            Some("false")
        );
    }

    #[tokio::test]
    async fn working_shutdown_watcher_is_idle_without_a_request() {
        let dir = tempfile::tempdir().unwrap();
        let agent = runtime(dir.path()).await;

        let mut watcher = agent.spawn_working_shutdown_watcher();
        let outcome = tokio::time::timeout(Duration::from_millis(50), &mut watcher).await;
        assert!(outcome.is_err(), "watcher should keep polling, not exit, when idle");
        assert!(!agent.working_shutdown_acked.load(Ordering::SeqCst));

        watcher.abort();
    }
}
