//! Daemon configuration.
//!
//! Loaded from a JSON file. Every field has a default, so `{}` is a valid
//! configuration and partial files only override what they name.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::OverlordError;
use crate::runner::{RetryPolicy, DEFAULT_MAX_CONCURRENT_TASKS};

/// Default location of the persisted state.
pub const DEFAULT_STATE_PATH: &str = "/var/lib/overlord/state.json";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlordConfig {
    /// Where the state document is checkpointed
    pub state_path: PathBuf,

    // Ensure loop
    pub ensure_interval_secs: u64,
    pub max_concurrent_tasks: usize,
    pub shutdown_timeout_secs: u64,

    // Pruning
    pub prune_interval_secs: u64,
    /// Ready changes older than this are removed
    pub prune_wait_secs: u64,
    /// Unready changes older than this are aborted
    pub abort_wait_secs: u64,
    /// Oldest ready changes beyond this count are removed
    pub max_ready_changes: usize,

    pub retry: RetryPolicy,
}

impl Default for OverlordConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            ensure_interval_secs: 5 * 60,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            shutdown_timeout_secs: 5,
            prune_interval_secs: 10 * 60,
            prune_wait_secs: 24 * 60 * 60,
            abort_wait_secs: 7 * 24 * 60 * 60,
            max_ready_changes: 500,
            retry: RetryPolicy::default(),
        }
    }
}

impl OverlordConfig {
    /// Default configuration persisting to `state_path`.
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            ..Self::default()
        }
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.state_path.as_os_str().is_empty() {
            return Err(OverlordError::config("state path must be specified"));
        }
        if self.ensure_interval_secs == 0 {
            return Err(OverlordError::config("ensure interval must be positive"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(OverlordError::config(
                "max concurrent tasks must be at least 1",
            ));
        }
        if self.prune_interval_secs == 0 {
            return Err(OverlordError::config("prune interval must be positive"));
        }
        // Aborting an unready change before ready ones are even pruned
        // would throw away work that is still progressing.
        if self.abort_wait_secs < self.prune_wait_secs {
            return Err(OverlordError::config(format!(
                "abort wait ({}s) must not be shorter than prune wait ({}s)",
                self.abort_wait_secs, self.prune_wait_secs
            )));
        }
        Ok(())
    }

    pub fn ensure_interval(&self) -> Duration {
        Duration::from_secs(self.ensure_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn prune_wait(&self) -> chrono::Duration {
        secs_to_chrono(self.prune_wait_secs)
    }

    pub fn abort_wait(&self) -> chrono::Duration {
        secs_to_chrono(self.abort_wait_secs)
    }
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}
