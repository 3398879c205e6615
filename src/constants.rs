//! System-wide timeout, backoff, and limit constants shared across components.

/// Lock acquisition backoff, lower bound.
pub const LOCK_BACKOFF_INITIAL_MS: u64 = 50;
/// Lock acquisition backoff, upper bound.
pub const LOCK_BACKOFF_MAX_MS: u64 = 500;

/// Default timeout for the task store's `claims.lock`.
pub const STORE_LOCK_TIMEOUT_MS: u64 = 5_000;
/// Default timeout for acquiring a recipient's mailbox lock when sending
/// (spec.md 4.3/5: "send ... acquire the recipient's lock (<=5 s)").
pub const MAILBOX_WRITE_LOCK_TIMEOUT_MS: u64 = 5_000;
/// Default timeout for acquiring one's own mailbox lock when polling
/// (spec.md 4.3/5: "poll() acquire *own* lock (<=2 s)").
pub const MAILBOX_READ_LOCK_TIMEOUT_MS: u64 = 2_000;
/// Default timeout for the process-wide `merge.lock`.
pub const MERGE_LOCK_TIMEOUT_MS: u64 = 10_000;

/// `wait_for_messages` / `wait_for_message` poll cadence.
pub const MAILBOX_POLL_INTERVAL_MS: u64 = 200;

/// Window after which an `in_progress` claim with no completion is stale.
pub const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 60;

/// Idle-state backoff floor and ceiling (spec.md 4.4).
pub const IDLE_BACKOFF_INITIAL_SECS: u64 = 1;
pub const IDLE_BACKOFF_MAX_SECS: u64 = 30;

/// Default grace period before a forced stop follows a graceful shutdown request.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 60;

/// Plan-approval sub-cycle timeout and revision cap (spec.md 4.5).
pub const PLAN_APPROVAL_TIMEOUT_SECS: u64 = 600;
pub const PLAN_APPROVAL_MAX_REVISIONS: u32 = 3;

/// Plan-evaluation heuristic thresholds (spec.md 4.7).
pub const PLAN_MIN_CHARS: usize = 50;
pub const PLAN_LONG_CHARS: usize = 200;
pub const PLAN_MIN_KEYWORD_HITS: usize = 2;

/// Coordination loop cadence.
pub const COORDINATION_TICK_MS: u64 = 1_000;

/// Consecutive unparseable lead-AI responses before falling back to the
/// pure sequential fast path (spec.md 4.7).
pub const MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 3;

/// Default conflict-resolver time budget (spec.md 4.8).
pub const CONFLICT_RESOLVER_TIMEOUT_SECS: u64 = 900;

/// Agent count is clamped to this inclusive range (spec.md 4.7).
pub const MIN_AGENT_COUNT: usize = 2;
pub const MAX_AGENT_COUNT: usize = 8;

/// Default cap on concurrently queued merges (spec.md 5).
pub const DEFAULT_MAX_CONCURRENT_MERGES: usize = 1;

/// Multiplier over an agent's average task duration before it is flagged stuck.
pub const STUCK_AGENT_MULTIPLIER: f64 = 2.0;

/// Base directory name under the user's home used when no `--base-dir`
/// is supplied on the CLI.
pub const DEFAULT_BASE_DIR_NAME: &str = ".ralph";

/// Directory (relative to the target repo) under which per-agent
/// worktrees are created.
pub const WORKTREE_DIR_NAME: &str = ".ralph-worktrees";

/// Default subprocess timeout for a single Plan/Code/Verify phase invocation.
pub const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 1_800;
