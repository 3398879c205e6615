use thiserror::Error;

/// Convenience type alias for Results with [`RalphError`]
pub type Result<T> = std::result::Result<T, RalphError>;

/// Main error type for the orchestrator core.
///
/// Every component (task store, message bus, git worktree manager, merge
/// manager, agents, orchestrator) reports failures through this enum so
/// callers have one error surface to match on.
#[derive(Error, Debug)]
pub enum RalphError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock timeout acquiring {path}")]
    LockTimeout { path: String },

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("Subprocess error: {message}")]
    Subprocess { message: String },

    #[error("Subprocess timed out after {seconds}s")]
    SubprocessTimeout { seconds: u64 },

    #[error("Parse failure: {message}")]
    ParseFailure { message: String },

    #[error("Task error: {message}")]
    Task { message: String },

    #[error("Task {task_id}: {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Merge error: {message}")]
    Merge { message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
