//! Diagnostic snapshots
//!
//! Plain data, taken without stopping the processors: each field is read
//! under its own lock, so a snapshot of a busy context is approximate.

use crate::config::PolicyKind;
use crate::scheduler::processor::ProcessorStatsSnapshot;
use crate::scheduler::routine::{RoutineId, RoutineState};

/// Point-in-time view of one processor context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    /// Context id
    pub id: Option<usize>,
    /// Run-queue policy
    pub policy: PolicyKind,
    /// Routines owned, in any state
    pub rq_size: usize,
    /// Routines in the run queue
    pub runnable: usize,
    /// Blocked routines and their wait states, sorted by id
    pub waiting: Vec<(RoutineId, RoutineState)>,
    /// Counters of the bound processor
    pub processor: Option<ProcessorStatsSnapshot>,
}

impl ContextSnapshot {
    /// Whether the context owns nothing
    pub fn is_idle(&self) -> bool {
        self.rq_size == 0
    }
}

/// Scheduler-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Routines accepted by `create_task`
    pub routines_created: u64,
    /// Routines that left their context (finished or removed)
    pub routines_reaped: u64,
    /// Routines whose body panicked
    pub routines_faulted: u64,
    /// Routines currently owned by some context
    pub active: usize,
}
