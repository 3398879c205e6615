//! Per-task worker: runs the Plan / Code / Verify phases of spec.md 4.5
//! against a single task, plus the plan-approval sub-cycle.

use crate::ai_process::{self, AiProcessSpec};
use crate::constants::{PLAN_APPROVAL_MAX_REVISIONS, PLAN_APPROVAL_TIMEOUT_SECS};
use crate::git::AgentWorktree;
use crate::message_bus::MessageBus;
use crate::models::{MessageType, Task};
use crate::Result;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Which phases to run and how to invoke the AI binary for each.
#[derive(Debug, Clone)]
pub struct TaskAgentConfig {
    pub model: String,
    pub executable: String,
    pub phase_timeout: Duration,
    pub run_plan_phase: bool,
    pub run_code_phase: bool,
    pub verify_command: Option<String>,
}

/// Result of running a task agent against a single task (spec.md 4.5's
/// "observable contract for the orchestrator").
#[derive(Debug, Clone)]
pub struct TaskAgentResult {
    pub success: bool,
    pub branch: String,
    pub summary: String,
    pub files_modified: Vec<String>,
    pub duration: Duration,
}

pub struct TaskAgent {
    config: TaskAgentConfig,
}

impl TaskAgent {
    pub fn new(config: TaskAgentConfig) -> Self {
        Self { config }
    }

    fn phase_spec(&self, worktree: &AgentWorktree) -> AiProcessSpec {
        AiProcessSpec {
            executable: self.config.executable.clone(),
            arguments: vec!["--model".to_string(), self.config.model.clone()],
            working_dir: worktree.path.clone(),
            uses_stdin: true,
            uses_prompt_argument: false,
            uses_stream_json: true,
            timeout: self.config.phase_timeout,
        }
    }

    /// Runs Plan -> Code -> Verify sequentially. The aggregate result is
    /// success iff every *executed* phase succeeded; disabled phases are
    /// skipped, not failed.
    pub async fn execute(&self, task: &Task, worktree: &AgentWorktree) -> Result<TaskAgentResult> {
        let started = Instant::now();
        let mut plan_text = String::new();

        if self.config.run_plan_phase {
            let prompt = format!(
                "Produce a plan (read-only intent, no edits) for this task.\nTitle: {}\nDescription: {}",
                task.title, task.description
            );
            let result = ai_process::run(&self.phase_spec(worktree), &prompt).await?;
            if !result.success {
                return Ok(TaskAgentResult {
                    success: false,
                    branch: worktree.branch.clone(),
                    summary: format!("plan phase failed: {}", result.error.unwrap_or_default()),
                    files_modified: Vec::new(),
                    duration: started.elapsed(),
                });
            }
            plan_text = if result.parsed_text.is_empty() {
                result.output
            } else {
                result.parsed_text
            };
        }

        let mut files_modified = Vec::new();
        if self.config.run_code_phase {
            let prompt = format!(
                "Implement this task and commit your changes.\nTitle: {}\nDescription: {}\nPlan:\n{}",
                task.title, task.description, plan_text
            );
            let result = ai_process::run(&self.phase_spec(worktree), &prompt).await?;
            if !result.success {
                return Ok(TaskAgentResult {
                    success: false,
                    branch: worktree.branch.clone(),
                    summary: format!("code phase failed: {}", result.error.unwrap_or_default()),
                    files_modified,
                    duration: started.elapsed(),
                });
            }
            files_modified = task.files.clone();
        }

        if let Some(verify_command) = &self.config.verify_command {
            let spec = AiProcessSpec {
                executable: "sh".to_string(),
                arguments: vec!["-c".to_string(), verify_command.clone()],
                working_dir: worktree.path.clone(),
                uses_stdin: false,
                uses_prompt_argument: false,
                uses_stream_json: false,
                timeout: self.config.phase_timeout,
            };
            let result = ai_process::run(&spec, "").await?;
            if !result.success {
                return Ok(TaskAgentResult {
                    success: false,
                    branch: worktree.branch.clone(),
                    summary: format!("verify phase failed: {}", result.error.unwrap_or_default()),
                    files_modified,
                    duration: started.elapsed(),
                });
            }
        }

        Ok(TaskAgentResult {
            success: true,
            branch: worktree.branch.clone(),
            summary: format!("completed {}", task.id),
            files_modified,
            duration: started.elapsed(),
        })
    }

    /// Plan-approval sub-cycle (spec.md 4.5): produce a plan, submit it,
    /// wait for approval, revise up to `PLAN_APPROVAL_MAX_REVISIONS`
    /// times, then proceed with the last plan regardless (soft cap).
    pub async fn run_plan_approval_cycle(
        &self,
        task: &Task,
        message_bus: &MessageBus,
        agent_id: &str,
    ) -> Result<()> {
        let timeout = Duration::from_secs(PLAN_APPROVAL_TIMEOUT_SECS);

        for revision in 0..=PLAN_APPROVAL_MAX_REVISIONS {
            let content = format!("plan for {} (revision {})", task.id, revision);
            message_bus
                .send(agent_id, "lead", MessageType::PlanSubmission, &content, None)
                .await?;

            let approval = message_bus
                .wait_for_message(agent_id, MessageType::PlanApproval, timeout)
                .await?;

            match approval {
                Some(message) if message.content.to_lowercase().contains("approve") => {
                    info!(agent_id, task_id = %task.id, revision, "plan approved");
                    return Ok(());
                }
                Some(message) => {
                    warn!(agent_id, task_id = %task.id, feedback = %message.content, "plan rejected, revising");
                }
                None => {
                    warn!(agent_id, task_id = %task.id, "plan approval timed out, proceeding with last plan");
                    return Ok(());
                }
            }
        }

        warn!(agent_id, task_id = %task.id, "exhausted plan revisions, proceeding with last plan");
        Ok(())
    }
}
