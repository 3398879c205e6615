use crate::constants;
use crate::models::TeamConfig;
use crate::{RalphError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[cfg(test)]
mod tests;

/// Process-wide settings: where state lives on disk and the defaults new
/// teams inherit unless their own `config.json` overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub base_dir: PathBuf,
    pub default_team_id: String,
    pub default_claim_timeout_secs: u64,
    pub default_shutdown_grace_secs: u64,
    pub default_agent_count: usize,
}

impl Config {
    /// Loads process-wide settings from the environment, falling back to
    /// sane defaults for anything unset. Never fails on a missing `.env`
    /// file — that is normal outside development.
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let base_dir = env::var("RALPH_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_base_dir());

        let default_team_id =
            env::var("RALPH_DEFAULT_TEAM").unwrap_or_else(|_| "default".to_string());

        let default_agent_count = env::var("RALPH_DEFAULT_AGENT_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(constants::MIN_AGENT_COUNT)
            .clamp(constants::MIN_AGENT_COUNT, constants::MAX_AGENT_COUNT);

        let default_claim_timeout_secs = env::var("RALPH_CLAIM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(constants::DEFAULT_CLAIM_TIMEOUT_SECS);

        let default_shutdown_grace_secs = env::var("RALPH_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(constants::DEFAULT_SHUTDOWN_GRACE_SECS);

        Ok(Config {
            base_dir,
            default_team_id,
            default_claim_timeout_secs,
            default_shutdown_grace_secs,
            default_agent_count,
        })
    }

    pub fn team_dir(&self, team_id: &str) -> PathBuf {
        self.base_dir.join("teams").join(team_id)
    }

    pub fn tasks_path(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("tasks").join("tasks.json")
    }

    pub fn claims_lock_path(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("tasks").join("claims.lock")
    }

    pub fn mailbox_dir(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("mailbox")
    }

    pub fn team_config_path(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("config.json")
    }

    pub fn merge_lock_path(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("merge.lock")
    }
}

fn default_base_dir() -> PathBuf {
    dirs_home()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(constants::DEFAULT_BASE_DIR_NAME)
}

fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}

/// Loads `teams/<team>/config.json`, tolerating a missing file (returns
/// defaults) and unknown/absent fields within it.
pub fn load_team_config(config: &Config, team_id: &str) -> Result<TeamConfig> {
    let path = config.team_config_path(team_id);
    if !path.exists() {
        tracing::debug!("no team config at {:?}, using defaults", path);
        return Ok(TeamConfig::default());
    }

    let raw = std::fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|e| {
        RalphError::ConfigurationError(format!("invalid team config at {:?}: {}", path, e))
    })
}
