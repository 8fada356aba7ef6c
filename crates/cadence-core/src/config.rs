//! Scheduler configuration
//!
//! The configuration is an opaque object as far as the rest of the runtime is
//! concerned: it is usually parsed from a TOML table, validated once, and then
//! handed to [`Scheduler::start`](crate::Scheduler::start).
//!
//! ```toml
//! worker_count = 4
//! policy = "group_affinity"
//! group_burst = 4
//!
//! [affinity_table]
//! lidar = 0
//! camera = 1
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Run-queue policy used by every processor context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Strict admission order ("classic")
    #[serde(alias = "FIFO", alias = "classic")]
    Fifo,
    /// Highest priority first, FIFO among equal priorities
    #[serde(alias = "PRIORITY")]
    Priority,
    /// Routines of one group run back-to-back, groups rotate round-robin
    #[serde(alias = "GROUP_AFFINITY", alias = "choreography")]
    GroupAffinity,
}

impl Default for PolicyKind {
    fn default() -> Self {
        PolicyKind::Fifo
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyKind::Fifo => "fifo",
            PolicyKind::Priority => "priority",
            PolicyKind::GroupAffinity => "group_affinity",
        };
        f.write_str(name)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Number of processors. 0 = num_cpus.
    #[serde(default)]
    pub worker_count: usize,

    /// Run-queue policy for every context
    #[serde(default)]
    pub policy: PolicyKind,

    /// Group name -> processor id pinning
    #[serde(default)]
    pub affinity_table: BTreeMap<String, usize>,

    /// Consecutive slices one group may take before rotation (group_affinity only)
    #[serde(default = "default_group_burst")]
    pub group_burst: usize,

    /// Upper bound on a single idle wait, in milliseconds
    #[serde(default = "default_park_timeout_ms")]
    pub park_timeout_ms: u64,

    /// Worker thread name prefix; threads are named `{prefix}-{id}`
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_group_burst() -> usize {
    8
}

fn default_park_timeout_ms() -> u64 {
    10
}

fn default_thread_name_prefix() -> String {
    "cadence-proc".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            policy: PolicyKind::default(),
            affinity_table: BTreeMap::new(),
            group_burst: default_group_burst(),
            park_timeout_ms: default_park_timeout_ms(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl SchedulerConfig {
    /// Config with an explicit worker count and policy, defaults elsewhere
    pub fn new(worker_count: usize, policy: PolicyKind) -> Self {
        Self {
            worker_count,
            policy,
            ..Self::default()
        }
    }

    /// Pin a group to a processor
    pub fn with_affinity(mut self, group: impl Into<String>, processor: usize) -> Self {
        self.affinity_table.insert(group.into(), processor);
        self
    }

    /// Set the group burst length
    pub fn with_group_burst(mut self, burst: usize) -> Self {
        self.group_burst = burst;
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Resolve worker count (0 means one per CPU)
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_count
        }
    }

    /// Idle wait bound
    pub fn park_timeout(&self) -> Duration {
        Duration::from_millis(self.park_timeout_ms.max(1))
    }

    /// Check the affinity table against the resolved pool size
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_burst == 0 {
            return Err(ConfigError::InvalidGroupBurst);
        }

        let workers = self.resolved_worker_count();
        for (group, &processor) in &self.affinity_table {
            if processor >= workers {
                return Err(ConfigError::InvalidAffinity {
                    group: group.clone(),
                    processor,
                    workers,
                });
            }
        }

        Ok(())
    }
}
