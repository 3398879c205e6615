//! Command-line surface for the orchestrator: one process per invocation,
//! talking to the same on-disk team state a long-running `run` uses.

use crate::config::{self, Config};
use crate::git::GitWorktreeManager;
use crate::merge::MergeManager;
use crate::message_bus::MessageBus;
use crate::models::{MessageType, Priority, Task};
use crate::orchestrator::{LeadOrchestrator, OrchestratorEvent};
use crate::task_store::TaskStore;
use crate::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ralph", about = "Multi-agent orchestrator for AI coding assistants")]
pub struct Cli {
    /// Base directory for team state (defaults to $RALPH_BASE_DIR or ~/.ralph)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decompose a backlog, spawn task agents, coordinate them to
    /// completion, then merge and clean up.
    Run {
        /// Git repository the team operates on.
        #[arg(long)]
        repo: PathBuf,
        /// Team identifier; state lives under `<base_dir>/teams/<team>`.
        #[arg(long, default_value = "default")]
        team: String,
        /// Markdown plan file with `- [ ]` checklist items to decompose.
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Print the current task store snapshot for a team.
    Status {
        #[arg(long, default_value = "default")]
        team: String,
    },
    /// Append a task directly to a team's store.
    AddTask {
        #[arg(long, default_value = "default")]
        team: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
    },
    /// Request a running agent shut down gracefully.
    Shutdown {
        #[arg(long, default_value = "default")]
        team: String,
        #[arg(long)]
        agent: String,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(base_dir) = cli.base_dir {
        config.base_dir = base_dir;
    }

    match cli.command {
        Command::Run { repo, team, plan } => run_team(&config, &repo, &team, plan.as_deref()).await,
        Command::Status { team } => print_status(&config, &team).await,
        Command::AddTask { team, title, description, priority, depends_on, files } => {
            add_task(&config, &team, title, description, &priority, depends_on, files).await
        }
        Command::Shutdown { team, agent } => shutdown_agent(&config, &team, &agent).await,
    }
}

async fn open_store(config: &Config, team: &str) -> Result<TaskStore> {
    let team_config = config::load_team_config(config, team)?;
    TaskStore::load(
        config.tasks_path(team),
        config.claims_lock_path(team),
        Duration::from_secs(team_config.claim_timeout_secs),
        Duration::from_millis(team_config.lock_timeout_ms.store),
    )
    .await
}

async fn run_team(config: &Config, repo: &std::path::Path, team: &str, plan: Option<&std::path::Path>) -> Result<()> {
    let team_config = config::load_team_config(config, team)?;
    let task_store = open_store(config, team).await?;
    let message_bus = MessageBus::new(
        config.mailbox_dir(team),
        Duration::from_millis(team_config.lock_timeout_ms.mailbox_write),
        Duration::from_millis(team_config.lock_timeout_ms.mailbox_read),
    );
    let git = Arc::new(GitWorktreeManager::new(repo.to_path_buf(), team));
    let merge_manager = Arc::new(MergeManager::new(
        config.merge_lock_path(team),
        Duration::from_millis(team_config.lock_timeout_ms.merge),
        Arc::clone(&git),
        "claude".to_string(),
        None,
    ));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::new(LeadOrchestrator::new(
        team.to_string(),
        repo.to_path_buf(),
        team_config,
        task_store.clone(),
        message_bus,
        Arc::clone(&git),
        Arc::clone(&merge_manager),
        events_tx,
    ));

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                OrchestratorEvent::QueueUpdate { pending, in_progress, completed, failed } => {
                    info!(pending, in_progress, completed, failed, "queue update");
                }
                OrchestratorEvent::StuckAgent { agent_id } => {
                    tracing::warn!(agent_id, "agent appears stuck");
                }
                OrchestratorEvent::Warning(message) => tracing::warn!("{}", message),
                OrchestratorEvent::Error { source, message } => {
                    tracing::error!(source, "{}", message)
                }
            }
        }
    });

    let plan_markdown = match plan {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };
    orchestrator.decompose(plan_markdown.as_deref(), None).await?;
    orchestrator.spawn().await?;
    orchestrator.coordinate().await?;

    let report = orchestrator.synthesize().await?;
    println!("{report}");

    orchestrator.merge_and_cleanup().await?;

    Ok(())
}

async fn print_status(config: &Config, team: &str) -> Result<()> {
    let store = open_store(config, team).await?;
    let tasks = store.get_all().await;
    println!("team {team}: {} task(s)", tasks.len());
    for task in &tasks {
        println!(
            "  {} [{:?}/{:?}] {} owner={}",
            task.id,
            task.status,
            task.merge_status,
            task.title,
            task.claimed_by_agent_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn add_task(
    config: &Config,
    team: &str,
    title: String,
    description: String,
    priority: &str,
    depends_on: Vec<String>,
    files: Vec<String>,
) -> Result<()> {
    let store = open_store(config, team).await?;
    let existing = store.get_all().await;
    let id = format!("task-{}", existing.len() + 1);

    let mut task = Task::new(id.clone(), title, description);
    task.priority = match priority {
        "critical" => Priority::Critical,
        "high" => Priority::High,
        "low" => Priority::Low,
        _ => Priority::Normal,
    };
    task.depends_on = depends_on;
    task.files = files;

    store.add_tasks(vec![task]).await?;
    println!("added {id}");
    Ok(())
}

async fn shutdown_agent(config: &Config, team: &str, agent: &str) -> Result<()> {
    let team_config = config::load_team_config(config, team)?;
    let message_bus = MessageBus::new(
        config.mailbox_dir(team),
        Duration::from_millis(team_config.lock_timeout_ms.mailbox_write),
        Duration::from_millis(team_config.lock_timeout_ms.mailbox_read),
    );
    message_bus
        .send("lead", agent, MessageType::ShutdownRequest, "shutdown requested via CLI", None)
        .await?;
    println!("shutdown requested for {agent}");
    Ok(())
}
