use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Configuration parameters for the replicated log
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RaftConfig {
    /// How long `apply` waits for commit plus local application
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Bound on the barrier awaited after membership changes
    #[serde(default = "default_barrier_timeout_ms")]
    pub barrier_timeout_ms: u64,

    /// Interval between leader heartbeats
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Run heartbeat and election timers. When off, elections only happen
    /// through an explicit `campaign()`.
    #[serde(default = "default_auto_campaign")]
    pub auto_campaign: bool,

    /// Applied entries past the last snapshot that trigger a new one
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Entries kept in the log behind a snapshot for slow followers
    #[serde(default = "default_trailing_logs")]
    pub trailing_logs: u64,

    /// Max entries shipped in one append request
    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            apply_timeout_ms: default_apply_timeout_ms(),
            barrier_timeout_ms: default_barrier_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            auto_campaign: default_auto_campaign(),
            snapshot_threshold: default_snapshot_threshold(),
            trailing_logs: default_trailing_logs(),
            max_append_entries: default_max_append_entries(),
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.apply_timeout_ms == 0 || self.barrier_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "apply_timeout_ms and barrier_timeout_ms must be at least 1ms".into(),
            )));
        }

        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "election_timeout_min_ms {}ms must be less than election_timeout_max_ms {}ms",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            ))));
        }

        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "heartbeat_interval_ms {}ms must be in (0, election_timeout_min_ms)",
                self.heartbeat_interval_ms
            ))));
        }

        if self.snapshot_threshold == 0 {
            return Err(Error::Config(ConfigError::Message(
                "snapshot_threshold must be greater than 0".into(),
            )));
        }

        if self.max_append_entries == 0 {
            return Err(Error::Config(ConfigError::Message(
                "max_append_entries must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

// in ms
fn default_apply_timeout_ms() -> u64 {
    15_000
}
fn default_barrier_timeout_ms() -> u64 {
    15_000
}
fn default_heartbeat_interval_ms() -> u64 {
    100
}
fn default_election_timeout_min_ms() -> u64 {
    500
}
fn default_election_timeout_max_ms() -> u64 {
    1000
}
fn default_auto_campaign() -> bool {
    true
}
fn default_snapshot_threshold() -> u64 {
    1024
}
fn default_trailing_logs() -> u64 {
    128
}
fn default_max_append_entries() -> usize {
    64
}
