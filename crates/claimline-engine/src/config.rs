//! Engine, supervisor and storage configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pipeline engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Counted failures a stage tolerates before escalation
    #[serde(default = "default_max_retry")]
    pub default_max_retry: u32,

    /// Stage transformation timeout in seconds
    #[serde(default = "default_stage_timeout")]
    pub default_stage_timeout_secs: u64,

    /// Policy decisions kept in memory
    #[serde(default = "default_decision_log_capacity")]
    pub decision_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retry: default_max_retry(),
            default_stage_timeout_secs: default_stage_timeout(),
            decision_log_capacity: default_decision_log_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn default_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.default_stage_timeout_secs)
    }
}

/// Drift supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Periodic health check interval in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// A stage is unhealthy once this many items exhausted their retries on it
    #[serde(default = "default_max_chronic_failures")]
    pub max_chronic_failures_per_stage: u32,

    /// Integrity violations tolerated before freezing
    #[serde(default)]
    pub max_integrity_violations: u64,

    /// Longest tolerated gap between publications, in seconds
    #[serde(default)]
    pub staleness_ceiling_secs: Option<u64>,

    /// Control events kept in memory
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            max_chronic_failures_per_stage: default_max_chronic_failures(),
            max_integrity_violations: 0,
            staleness_ceiling_secs: None,
            history_capacity: default_history_capacity(),
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// JSON documents under a data directory
    File {
        data_dir: PathBuf,
    },
}

fn default_max_retry() -> u32 {
    2
}

fn default_stage_timeout() -> u64 {
    30
}

fn default_decision_log_capacity() -> usize {
    claimline_policy::DEFAULT_DECISION_LOG_CAPACITY
}

fn default_check_interval() -> u64 {
    1800
}

fn default_max_chronic_failures() -> u32 {
    3
}

fn default_history_capacity() -> usize {
    256
}
