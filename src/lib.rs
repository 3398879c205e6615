//! # Ralph Orchestrator
//!
//! A multi-agent orchestrator for AI coding assistants. A lead
//! coordinator decomposes a backlog into a dependency-ordered task
//! graph, spawns task agents that each run an external AI CLI in their
//! own git worktree, and merges completed work back onto a target
//! branch — resolving conflicts with a secondary AI pass when needed.
//!
//! ## Architecture
//!
//! - [`task_store`] — dependency-aware, file-locked, crash-safe shared work queue
//! - [`message_bus`] — per-agent JSONL inboxes for inter-agent messaging
//! - [`agent`] — the worker lifecycle state machine and per-task Plan/Code/Verify runner
//! - [`orchestrator`] — the lead's decompose -> spawn -> coordinate -> synthesize -> merge loop
//! - [`merge`] — dependency-ordered branch merging with overlap detection
//! - [`git`] — worktree creation/removal and merge execution
//! - [`conflict_resolver`] — AI-assisted merge conflict resolution
//! - [`ai_process`] — the opaque AI CLI subprocess contract shared by the above

/// Per-task worker: lifecycle state machine and Plan/Code/Verify runner.
pub mod agent;
/// Opaque AI CLI subprocess invocation: spawn, stream, collect.
pub mod ai_process;
/// Process-wide and per-team configuration loading.
pub mod config;
/// System-wide timeout, backoff, and limit constants.
pub mod constants;
/// Command-line argument parsing and subcommand dispatch.
pub mod cli;
/// AI-assisted merge conflict resolution.
pub mod conflict_resolver;
/// Error types shared across every component.
pub mod error;
/// Cross-process advisory file locking.
pub mod fs_lock;
/// Git worktree creation/removal and branch merging.
pub mod git;
/// Dependency-ordered merge queue with file-overlap detection.
pub mod merge;
/// Per-agent JSONL inbox messaging.
pub mod message_bus;
/// Shared data model: tasks, agents, messages, team config.
pub mod models;
/// Lead orchestrator: decompose, spawn, coordinate, synthesize, merge.
pub mod orchestrator;
/// Dependency-aware, file-locked, crash-safe task store.
pub mod task_store;

pub use error::{RalphError, Result};
