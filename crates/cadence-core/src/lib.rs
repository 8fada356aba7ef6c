//! Cadence scheduling core
//!
//! A cooperative, multi-threaded scheduler for resumable routines. The
//! runtime starts a fixed pool of processors, each bound to one processor
//! context (a run queue plus an index of the routines it owns). Routines
//! run until they yield, block on data or IO, sleep, or finish; nothing is
//! ever preempted.
//!
//! # Example
//!
//! ```ignore
//! use cadence_core::{PolicyKind, RoutineContext, Scheduler, SchedulerConfig, Step, TaskOptions};
//!
//! let scheduler = Scheduler::start(SchedulerConfig::new(2, PolicyKind::Priority))?;
//! let id = scheduler.create_task(
//!     |_: &mut RoutineContext| Step::Done,
//!     TaskOptions::new().name("planner").priority(10),
//! )?;
//! scheduler.wait_idle(std::time::Duration::from_secs(1));
//! scheduler.shutdown();
//! ```
//!
//! # Modules
//!
//! - [`scheduler`]: routines, contexts, processors and the scheduler itself
//! - [`config`]: pool size, policy and placement configuration
//! - [`error`]: error types

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod scheduler;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{PolicyKind, SchedulerConfig};
pub use error::{ConfigError, SchedError, SchedResult};
pub use scheduler::{
    yield_now, ContextSnapshot, FutureWork, Priority, Processor, ProcessorContext,
    ProcessorStatsSnapshot, Removal, Routine, RoutineContext, RoutineId, RoutineNotifier,
    RoutineState, RunQueue, Scheduler, SchedulerStats, SliceOutcome, Step, TaskOptions, WaitKind,
    Work,
};
