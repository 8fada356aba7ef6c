//! Cooperative routine scheduler
//!
//! Routines are resumable units of work. Each is placed on exactly one
//! processor context; the processor bound to that context runs its routines
//! one slice at a time, in the order the context's policy dictates. A routine
//! that blocks leaves the run queue until something calls
//! [`Scheduler::notify`] (or the notifier/waker handed to its body).

mod context;
mod placement;
mod processor;
mod routine;
#[allow(clippy::module_inception)]
mod scheduler;
mod stats;
mod work;

pub use context::{
    run_queue_for, FifoQueue, GroupQueue, PriorityQueue, ProcessorContext, Removal, RunQueue,
};
pub use processor::{Processor, ProcessorStats, ProcessorStatsSnapshot};
pub use routine::{Priority, Routine, RoutineId, RoutineState, SliceOutcome, TaskOptions};
pub use scheduler::Scheduler;
pub use stats::{ContextSnapshot, SchedulerStats};
pub use work::{
    yield_now, FutureWork, RoutineContext, RoutineNotifier, Step, WaitKind, Work, YieldNow,
};
