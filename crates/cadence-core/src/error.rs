//! Error types for the scheduling core

use crate::scheduler::RoutineId;

/// Scheduler errors
///
/// Only conditions a caller can act on are errors. Notifying or removing an
/// unknown routine, binding a context twice, and faults inside a routine body
/// are all handled inside the core and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The scheduler has been shut down and accepts no new routines
    #[error("Scheduler is shut down")]
    ShutDown,

    /// The target processor context is stopped
    #[error("Processor context {0} is stopped")]
    ContextStopped(usize),

    /// The routine is already indexed by a context
    #[error("Routine {0} is already queued")]
    AlreadyQueued(RoutineId),

    /// A live routine already carries this name
    #[error("A routine named '{0}' already exists")]
    DuplicateName(String),

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Scheduler result
pub type SchedResult<T> = Result<T, SchedError>;

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration text is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// An affinity table entry points past the worker pool
    #[error("Group '{group}' is pinned to processor {processor}, but only {workers} workers exist")]
    InvalidAffinity {
        /// Group name
        group: String,
        /// Requested processor id
        processor: usize,
        /// Resolved worker count
        workers: usize,
    },

    /// `group_burst` must allow at least one slice per turn
    #[error("group_burst must be at least 1")]
    InvalidGroupBurst,
}
