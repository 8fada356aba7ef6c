//! Processor: the worker thread bound to one context
//!
//! A processor repeatedly takes the next runnable routine from its context,
//! runs it for one slice, and hands the outcome back to the context. When
//! nothing is runnable it parks until a routine is admitted, a sleeper comes
//! due, the park timeout elapses, or the context is shut down.
//!
//! Scheduling is cooperative. A routine that never returns from
//! [`Work::resume`](crate::Work::resume) keeps its processor busy forever,
//! and [`Processor::shutdown`] waits for the in-flight slice to end, so such
//! a routine also delays shutdown.

use crate::error::{SchedError, SchedResult};
use crate::scheduler::context::ProcessorContext;
use crate::scheduler::routine::{RoutineId, RoutineState, SliceOutcome};
use crate::scheduler::work::Step;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Per-processor counters
#[derive(Debug, Default)]
pub struct ProcessorStats {
    slices: CachePadded<AtomicU64>,
    finished: AtomicU64,
    faulted: AtomicU64,
    yields: AtomicU64,
    waits: AtomicU64,
    sleeps: AtomicU64,
    parks: AtomicU64,
    /// Id of the routine in the current slice, 0 when idle
    current: AtomicU64,
}

impl ProcessorStats {
    /// Copy the counters
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        let current = self.current.load(Ordering::Acquire);
        ProcessorStatsSnapshot {
            slices: self.slices.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            current_routine: (current != 0).then(|| RoutineId::from_u64(current)),
        }
    }

    fn record(&self, outcome: &SliceOutcome, state: RoutineState) {
        self.slices.fetch_add(1, Ordering::Relaxed);
        let counter = match (outcome, state) {
            (SliceOutcome::Faulted(_), _) => {
                self.faulted.fetch_add(1, Ordering::Relaxed);
                &self.finished
            }
            (_, RoutineState::Finished) => &self.finished,
            (SliceOutcome::Step(Step::Yield), _) => &self.yields,
            (SliceOutcome::Step(Step::Sleep(_)), _) => &self.sleeps,
            (SliceOutcome::Step(Step::Wait(_)), _) => &self.waits,
            (SliceOutcome::Step(Step::Done), _) => &self.finished,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Plain copy of [`ProcessorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    /// Slices executed
    pub slices: u64,
    /// Routines that finished on this processor (faulted ones included)
    pub finished: u64,
    /// Routines whose body panicked
    pub faulted: u64,
    /// Slices that ended in a yield
    pub yields: u64,
    /// Slices that ended in a data or IO wait
    pub waits: u64,
    /// Slices that ended in a sleep
    pub sleeps: u64,
    /// Times the processor parked for lack of work
    pub parks: u64,
    /// Routine in the current slice
    pub current_routine: Option<RoutineId>,
}

impl ProcessorStatsSnapshot {
    /// Whether a slice is in progress
    pub fn in_slice(&self) -> bool {
        self.current_routine.is_some()
    }
}

/// Worker bound to exactly one [`ProcessorContext`]
pub struct Processor {
    /// Processor ID
    id: usize,

    /// Context this processor drains
    context: Arc<ProcessorContext>,

    /// Counters, shared with the context for snapshots
    stats: Arc<ProcessorStats>,

    /// Whether this processor won the context binding
    bound: bool,

    /// Upper bound on one idle wait
    park_timeout: Duration,

    /// Worker thread name
    thread_name: String,

    /// Worker thread handle
    handle: Mutex<Option<thread::JoinHandle<()>>>,

    /// Set once the thread is spawned
    started: AtomicBool,
}

impl Processor {
    /// Create a processor and bind it to `context`.
    ///
    /// If the context already has a processor the binding is refused (and
    /// logged); the new processor then never runs anything.
    pub fn new(id: usize, context: Arc<ProcessorContext>, park_timeout: Duration) -> Arc<Self> {
        Self::with_thread_name(id, context, park_timeout, "cadence-proc")
    }

    /// Same as [`new`](Self::new) with a custom thread name prefix
    pub fn with_thread_name(
        id: usize,
        context: Arc<ProcessorContext>,
        park_timeout: Duration,
        prefix: &str,
    ) -> Arc<Self> {
        let stats = Arc::new(ProcessorStats::default());
        let bound = context.bind_processor(id, Arc::clone(&stats));
        Arc::new(Self {
            id,
            context,
            stats,
            bound,
            park_timeout,
            thread_name: format!("{}-{}", prefix, id),
            handle: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Processor id
    pub fn id(&self) -> usize {
        self.id
    }

    /// The bound context
    pub fn context(&self) -> &Arc<ProcessorContext> {
        &self.context
    }

    /// Whether this processor owns its context
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Whether the worker thread has been started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Counter snapshot
    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the worker thread. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        if !self.bound {
            warn!(processor = self.id, "processor is not bound to its context, not starting");
            return Ok(());
        }

        let mut handle = self.handle.lock();
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let processor = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || processor.run_loop())
            .map_err(SchedError::Spawn)?;

        *handle = Some(spawned);
        self.started.store(true, Ordering::Release);
        debug!(processor = self.id, thread = %self.thread_name, "processor started");
        Ok(())
    }

    /// Execute one slice on the calling thread.
    ///
    /// Returns whether a routine ran. Only usable before [`start`](Self::start):
    /// once the worker thread exists it is the only one allowed to run slices.
    pub fn run_once(&self) -> bool {
        if !self.bound || self.is_started() {
            return false;
        }
        self.step()
    }

    /// Run slices on the calling thread until nothing is runnable.
    ///
    /// Returns the number of slices executed.
    pub fn run_until_idle(&self) -> usize {
        let mut slices = 0;
        while self.run_once() {
            slices += 1;
        }
        slices
    }

    /// Stop the worker and join its thread.
    ///
    /// The in-flight slice, if any, runs to completion first. Idempotent, and
    /// safe to call from a routine running on this processor (the thread is
    /// then left to exit on its own).
    pub fn shutdown(&self) {
        self.context.shutdown();

        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(processor = self.id, "processor thread panicked");
        }
        debug!(processor = self.id, "processor stopped");
    }

    /// Worker thread main loop
    fn run_loop(&self) {
        while !self.context.is_stopped() {
            if !self.step() {
                self.stats.parks.fetch_add(1, Ordering::Relaxed);
                self.context.wait_for_work(self.park_timeout);
            }
        }
        trace!(processor = self.id, "processor loop exited");
    }

    /// Take the next routine and run it for one slice
    fn step(&self) -> bool {
        let Some(routine) = self.context.next_routine() else {
            return false;
        };
        debug_assert!(self.context.is_bound_to(&self.stats));

        // Removed between dequeue and now
        if !self.context.begin_slice(&routine) {
            return true;
        }

        self.stats
            .current
            .store(routine.id().as_u64(), Ordering::Release);
        let outcome = routine.resume(Some(&self.context));
        self.stats.current.store(0, Ordering::Release);

        if let SliceOutcome::Faulted(message) = &outcome {
            warn!(
                processor = self.id,
                routine = %routine.id(),
                name = routine.name().map(|n| &**n),
                fault = %message,
                "routine faulted"
            );
        }

        let end = self.context.end_slice(&routine, &outcome);
        self.stats.record(&outcome, end.state);
        trace!(
            processor = self.id,
            routine = %routine.id(),
            state = %end.state,
            reaped = end.reaped,
            "slice ended"
        );
        true
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("bound", &self.bound)
            .field("started", &self.is_started())
            .finish()
    }
}
