//! Configuration for the shared log core
//!
//! Settings are loaded from a TOML file and validated before use; every
//! field has a default from [`defaults`] so an empty file (or no file) is a
//! working configuration.

mod defaults;

pub use defaults::*;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Consensus tuning for the metalog replication channel. The consensus
/// implementation is external; these knobs are passed through to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RaftConfig {
    /// Election timeout in milliseconds
    pub election_timeout_ms: u64,

    /// Heartbeat timeout in milliseconds
    pub heartbeat_timeout_ms: u64,

    /// Number of applied entries between snapshots
    pub snapshot_threshold: u64,

    /// Trailing entries retained behind a snapshot
    pub snapshot_trailing: u64,

    /// Whether pre-vote is enabled
    pub pre_vote: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: DEFAULT_RAFT_ELECTION_TIMEOUT_MS,
            heartbeat_timeout_ms: DEFAULT_RAFT_HEARTBEAT_TIMEOUT_MS,
            snapshot_threshold: DEFAULT_RAFT_SNAPSHOT_THRESHOLD,
            snapshot_trailing: DEFAULT_RAFT_SNAPSHOT_TRAILING,
            pre_vote: DEFAULT_RAFT_PRE_VOTE,
        }
    }
}

/// Complete configuration for a shared log participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SharedLogConfig {
    /// Primary sequencer tick period for cut marking, in microseconds
    pub local_cut_interval_us: u64,

    /// High-water cap on live entries held in memory per storage logspace
    pub storage_max_live_entries: usize,

    /// Cap on engine pending entries; appends beyond it are rejected
    pub engine_max_pending_entries: usize,

    /// Storage flusher period, in milliseconds
    pub storage_flush_interval_ms: u64,

    /// Testing hook: when set, the view manager re-publishes the current
    /// view at a fuzzed interval to exercise reconfiguration paths
    pub view_reconfig_fuzz_interval_ms: Option<u64>,

    /// Consensus tuning for the metalog channel
    pub raft: RaftConfig,
}

impl Default for SharedLogConfig {
    fn default() -> Self {
        Self {
            local_cut_interval_us: DEFAULT_LOCAL_CUT_INTERVAL_US,
            storage_max_live_entries: DEFAULT_STORAGE_MAX_LIVE_ENTRIES,
            engine_max_pending_entries: DEFAULT_ENGINE_MAX_PENDING_ENTRIES,
            storage_flush_interval_ms: DEFAULT_STORAGE_FLUSH_INTERVAL_MS,
            view_reconfig_fuzz_interval_ms: None,
            raft: RaftConfig::default(),
        }
    }
}

impl SharedLogConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: SharedLogConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::Message(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting is usable
    pub fn validate(&self) -> Result<()> {
        if self.local_cut_interval_us == 0 {
            return Err(
                ConfigError::invalid_setting("local_cut_interval_us", "must be positive").into(),
            );
        }
        if self.storage_max_live_entries == 0 {
            return Err(ConfigError::invalid_setting(
                "storage_max_live_entries",
                "must be positive",
            )
            .into());
        }
        if self.engine_max_pending_entries == 0 {
            return Err(ConfigError::invalid_setting(
                "engine_max_pending_entries",
                "must be positive",
            )
            .into());
        }
        if self.storage_flush_interval_ms == 0 {
            return Err(ConfigError::invalid_setting(
                "storage_flush_interval_ms",
                "must be positive",
            )
            .into());
        }
        if self.raft.election_timeout_ms <= self.raft.heartbeat_timeout_ms {
            return Err(ConfigError::invalid_setting(
                "raft.election_timeout_ms",
                "must exceed raft.heartbeat_timeout_ms",
            )
            .into());
        }
        Ok(())
    }
}
