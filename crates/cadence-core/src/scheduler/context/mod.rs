//! Processor context: one worker's run queue and routine index
//!
//! A context owns every routine placed on its processor. It keeps two
//! structures:
//!
//! - the **index** (`RoutineId -> Routine`), behind a reader/writer lock:
//!   state queries and notifications take the read side and never block each
//!   other, insertion and removal take the write side;
//! - the **run queue**, a policy object ([`RunQueue`]) behind its own mutex,
//!   holding only the routines that are `Ready`.
//!
//! Every routine state change happens here, under the routine's state lock.
//! Lock order is index -> routine state -> run queue -> park lock; the sleeper
//! heap is never held together with a routine state lock.

mod fifo;
mod group;
mod priority;

pub use fifo::FifoQueue;
pub use group::GroupQueue;
pub use priority::PriorityQueue;

use crate::config::PolicyKind;
use crate::error::{SchedError, SchedResult};
use crate::scheduler::processor::ProcessorStats;
use crate::scheduler::routine::{Routine, RoutineId, RoutineState, SliceOutcome};
use crate::scheduler::stats::ContextSnapshot;
use crate::scheduler::work::{Step, WaitKind};
use crossbeam::utils::CachePadded;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Ordering structure of one scheduling policy.
///
/// Holds `Ready` routines only. Implementations must be deterministic:
/// routines that compare equal under the policy come out in admission order.
pub trait RunQueue: Send {
    /// Policy implemented by this queue
    fn policy(&self) -> PolicyKind;

    /// Admit a runnable routine
    fn push(&mut self, routine: Arc<Routine>);

    /// Remove and return the next routine to run
    fn pop(&mut self) -> Option<Arc<Routine>>;

    /// Drop a routine from the queue; returns whether it was present
    fn remove(&mut self, id: RoutineId) -> bool;

    /// Number of queued routines
    fn len(&self) -> usize;

    /// Whether no routine is queued
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the run queue for a policy
pub fn run_queue_for(policy: PolicyKind, group_burst: usize) -> Box<dyn RunQueue> {
    match policy {
        PolicyKind::Fifo => Box::new(FifoQueue::new()),
        PolicyKind::Priority => Box::new(PriorityQueue::new()),
        PolicyKind::GroupAffinity => Box::new(GroupQueue::new(group_burst)),
    }
}

/// Result of a removal request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The routine left the index
    Removed,
    /// The routine is running; it leaves the index when its slice ends
    Deferred,
    /// No such routine in this context
    Unknown,
}

/// How a slice left the routine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SliceEnd {
    /// State after the slice
    pub(crate) state: RoutineState,
    /// Whether the routine left the index
    pub(crate) reaped: bool,
}

type ReapListener = Box<dyn Fn(&Routine) + Send + Sync>;

/// Entry in the sleeper heap
struct SleepEntry {
    wake_at: Instant,
    routine: Arc<Routine>,
}

// Reverse ordering for min-heap (earliest wake time first)
impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.routine.id().cmp(&self.routine.id()))
    }
}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.routine.id() == other.routine.id()
    }
}

impl Eq for SleepEntry {}

/// Processor bound to a context
struct Binding {
    processor_id: usize,
    stats: Arc<ProcessorStats>,
}

/// Per-worker run queue and routine index
pub struct ProcessorContext {
    /// Context id, set once by the scheduler
    id: OnceCell<usize>,

    /// Policy of the run queue
    policy: PolicyKind,

    /// All routines owned by this context
    index: RwLock<FxHashMap<RoutineId, Arc<Routine>>>,

    /// Ready routines in policy order
    run_queue: Mutex<Box<dyn RunQueue>>,

    /// Sleeping routines by deadline
    sleepers: Mutex<BinaryHeap<SleepEntry>>,

    /// Set when a routine became ready since the processor last checked
    notified: CachePadded<AtomicBool>,

    /// Admission closed, processor asked to exit
    stop: AtomicBool,

    /// Bound processor, set once
    binding: OnceCell<Binding>,

    /// Idle processor parks here
    park_lock: Mutex<()>,
    park_cv: Condvar,

    /// Called whenever a routine leaves the index
    reap_listener: OnceCell<ReapListener>,
}

impl ProcessorContext {
    /// Create a context around a run queue
    pub fn new(run_queue: Box<dyn RunQueue>) -> Self {
        Self {
            id: OnceCell::new(),
            policy: run_queue.policy(),
            index: RwLock::new(FxHashMap::default()),
            run_queue: Mutex::new(run_queue),
            sleepers: Mutex::new(BinaryHeap::new()),
            notified: CachePadded::new(AtomicBool::new(false)),
            stop: AtomicBool::new(false),
            binding: OnceCell::new(),
            park_lock: Mutex::new(()),
            park_cv: Condvar::new(),
            reap_listener: OnceCell::new(),
        }
    }

    /// Create a context for one of the built-in policies
    pub fn with_policy(policy: PolicyKind, group_burst: usize) -> Self {
        Self::new(run_queue_for(policy, group_burst))
    }

    /// Set the context id. The first call wins.
    pub fn set_id(&self, id: usize) -> bool {
        match self.id.set(id) {
            Ok(()) => true,
            Err(_) => {
                warn!(current = ?self.id.get(), requested = id, "context id already set");
                false
            }
        }
    }

    /// Context id, if set
    pub fn id(&self) -> Option<usize> {
        self.id.get().copied()
    }

    /// Run-queue policy
    pub fn policy(&self) -> PolicyKind {
        self.policy
    }

    /// Bind a processor. The first bind wins; later attempts are ignored.
    pub(crate) fn bind_processor(&self, processor_id: usize, stats: Arc<ProcessorStats>) -> bool {
        let result = self.binding.set(Binding {
            processor_id,
            stats,
        });
        if result.is_err() {
            warn!(
                context = ?self.id(),
                bound = ?self.bound_processor(),
                requested = processor_id,
                "context already bound to a processor"
            );
        }
        result.is_ok()
    }

    /// Id of the bound processor
    pub fn bound_processor(&self) -> Option<usize> {
        self.binding.get().map(|b| b.processor_id)
    }

    pub(crate) fn is_bound_to(&self, stats: &Arc<ProcessorStats>) -> bool {
        self.binding
            .get()
            .map_or(false, |b| Arc::ptr_eq(&b.stats, stats))
    }

    /// Register the reap listener. The first call wins.
    pub fn set_reap_listener<F>(&self, listener: F) -> bool
    where
        F: Fn(&Routine) + Send + Sync + 'static,
    {
        self.reap_listener.set(Box::new(listener)).is_ok()
    }

    /// Admit a routine.
    ///
    /// The routine is indexed; if it is `Ready` it also enters the run queue
    /// and the bound processor is woken. Fails if the context is stopped or
    /// the routine is already indexed by any context.
    pub fn enqueue(&self, routine: Arc<Routine>) -> SchedResult<()> {
        if self.is_stopped() {
            return Err(SchedError::ContextStopped(self.id().unwrap_or_default()));
        }

        let id = routine.id();
        let mut index = self.index.write();
        let mut cell = routine.cell();
        if cell.indexed {
            return Err(SchedError::AlreadyQueued(id));
        }
        cell.indexed = true;
        cell.remove_requested = false;
        index.insert(id, Arc::clone(&routine));

        if cell.state == RoutineState::Ready {
            self.admit(Arc::clone(&routine));
        }
        trace!(context = ?self.id(), routine = %id, state = %cell.state, "routine enqueued");
        Ok(())
    }

    /// Whether nothing is runnable right now.
    ///
    /// A context holding only blocked routines reports empty.
    pub fn rq_empty(&self) -> bool {
        self.run_queue.lock().is_empty() && !self.has_due_sleepers(Instant::now())
    }

    /// Remove and return the next runnable routine in policy order.
    ///
    /// Sleepers whose deadline has passed are promoted first.
    pub fn next_routine(&self) -> Option<Arc<Routine>> {
        self.promote_sleepers(Instant::now());
        self.run_queue.lock().pop()
    }

    /// Move a waiting routine to `Ready`.
    ///
    /// Returns `true` only if a wait -> `Ready` transition happened. Notifying
    /// a routine that is already `Ready`, finished or unknown is a no-op. A
    /// notify that reaches a `Running` routine is remembered: if the slice
    /// ends in a wait state, the routine goes straight back to `Ready`.
    pub fn notify(&self, id: RoutineId) -> bool {
        let mut early_wake = None;
        let woken = {
            let index = self.index.read();
            let Some(routine) = index.get(&id) else {
                return false;
            };

            let mut cell = routine.cell();
            if !cell.indexed {
                return false;
            }
            match cell.state {
                state if state.is_waiting() => {
                    cell.state = RoutineState::Ready;
                    early_wake = cell.wake_at.take();
                    cell.wake_pending = false;
                    self.admit(Arc::clone(routine));
                    true
                }
                RoutineState::Running => {
                    cell.wake_pending = true;
                    false
                }
                _ => false,
            }
        };

        if let Some(wake_at) = early_wake {
            self.purge_sleep_entry(id, wake_at);
        }
        woken
    }

    /// Remove a routine from the index.
    ///
    /// A running routine is only marked; the processor drops it once the
    /// current slice ends.
    pub fn remove_routine(&self, id: RoutineId) -> Removal {
        let mut index = self.index.write();
        let Some(routine) = index.get(&id).cloned() else {
            return Removal::Unknown;
        };

        let mut cell = routine.cell();
        if !cell.indexed {
            return Removal::Unknown;
        }
        if cell.state == RoutineState::Running {
            cell.remove_requested = true;
            debug!(context = ?self.id(), routine = %id, "removal deferred until slice ends");
            return Removal::Deferred;
        }

        index.remove(&id);
        cell.indexed = false;
        match cell.state {
            RoutineState::Ready => {
                self.run_queue.lock().remove(id);
            }
            RoutineState::Sleep => {
                cell.wake_at = None;
            }
            _ => {}
        }
        drop(cell);
        drop(index);

        self.purge_sleeper(id);
        self.reap(&routine);
        Removal::Removed
    }

    /// Number of routines owned by this context, in any state
    pub fn rq_size(&self) -> usize {
        self.index.read().len()
    }

    /// State of an owned routine
    pub fn get_state(&self, id: RoutineId) -> Option<RoutineState> {
        self.index.read().get(&id).map(|r| r.state())
    }

    /// Request a state change from outside the processor.
    ///
    /// `Running` belongs to the processor, so the only change accepted here is
    /// a wait state -> `Ready`, which re-admits the routine exactly like
    /// [`notify`](Self::notify). Returns whether the routine is now in `state`.
    pub fn set_state(&self, id: RoutineId, state: RoutineState) -> bool {
        let early_wake = {
            let index = self.index.read();
            let Some(routine) = index.get(&id) else {
                return false;
            };

            let mut cell = routine.cell();
            if cell.state == state {
                return true;
            }
            if cell.state == RoutineState::Running
                || state == RoutineState::Running
                || !cell.state.can_transition_to(state)
            {
                debug!(routine = %id, from = %cell.state, to = %state, "state change rejected");
                return false;
            }

            cell.state = state;
            if state == RoutineState::Ready {
                self.admit(Arc::clone(routine));
            }
            cell.wake_at.take()
        };

        if let Some(wake_at) = early_wake {
            self.purge_sleep_entry(id, wake_at);
        }
        true
    }

    /// Close admission and wake the processor so it can exit
    pub fn shutdown(&self) {
        self.stop.store(true, AtomicOrdering::Release);
        let _guard = self.park_lock.lock();
        self.park_cv.notify_all();
    }

    /// Whether [`shutdown`](Self::shutdown) was requested
    pub fn is_stopped(&self) -> bool {
        self.stop.load(AtomicOrdering::Acquire)
    }

    /// Ids and states of every owned routine, sorted by id
    pub fn routines(&self) -> Vec<(RoutineId, RoutineState)> {
        let mut routines: Vec<_> = self
            .index
            .read()
            .values()
            .map(|r| (r.id(), r.state()))
            .collect();
        routines.sort_by_key(|(id, _)| *id);
        routines
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> ContextSnapshot {
        let routines = self.routines();
        ContextSnapshot {
            id: self.id(),
            policy: self.policy,
            rq_size: routines.len(),
            runnable: self.run_queue.lock().len(),
            waiting: routines
                .into_iter()
                .filter(|(_, state)| state.is_waiting())
                .collect(),
            processor: self.binding.get().map(|b| b.stats.snapshot()),
        }
    }

    /// Move `routine` to `Running` at the start of a slice.
    ///
    /// Returns `false` if the routine was removed or is no longer `Ready`
    /// since it was dequeued.
    pub(crate) fn begin_slice(&self, routine: &Routine) -> bool {
        let mut cell = routine.cell();
        if !cell.indexed || cell.state != RoutineState::Ready {
            return false;
        }
        cell.state = RoutineState::Running;
        true
    }

    /// Apply the outcome of a slice.
    pub(crate) fn end_slice(&self, routine: &Arc<Routine>, outcome: &SliceOutcome) -> SliceEnd {
        let mut cell = routine.cell();
        debug_assert_eq!(cell.state, RoutineState::Running);
        let wake_pending = std::mem::take(&mut cell.wake_pending);

        let mut wake_at = None;
        let next = match outcome {
            SliceOutcome::Faulted(message) => {
                routine.record_fault(message);
                RoutineState::Finished
            }
            SliceOutcome::Step(Step::Done) => RoutineState::Finished,
            SliceOutcome::Step(Step::Yield) => RoutineState::Ready,
            SliceOutcome::Step(_) if wake_pending => RoutineState::Ready,
            SliceOutcome::Step(Step::Wait(WaitKind::Data)) => RoutineState::DataWait,
            SliceOutcome::Step(Step::Wait(WaitKind::Io)) => RoutineState::IoWait,
            SliceOutcome::Step(Step::Sleep(duration)) => {
                // No representable deadline: sleep until notified
                wake_at = Instant::now().checked_add(*duration);
                RoutineState::Sleep
            }
        };
        cell.state = next;
        cell.wake_at = wake_at;

        if next.is_finished() || cell.remove_requested {
            cell.indexed = false;
            cell.wake_at = None;
            drop(cell);
            self.index.write().remove(&routine.id());
            self.purge_sleeper(routine.id());
            self.reap(routine);
            return SliceEnd {
                state: next,
                reaped: true,
            };
        }

        match (next, wake_at) {
            (RoutineState::Ready, _) => {
                self.admit(Arc::clone(routine));
            }
            (RoutineState::Sleep, Some(wake_at)) => {
                drop(cell);
                self.sleepers.lock().push(SleepEntry {
                    wake_at,
                    routine: Arc::clone(routine),
                });
                // A sleeper may be due before the processor's next park timeout
                self.notified.store(true, AtomicOrdering::Release);
            }
            _ => {}
        }

        SliceEnd {
            state: next,
            reaped: false,
        }
    }

    /// Park the calling processor until a routine becomes ready, the context
    /// is stopped, the next sleeper is due, or `timeout` elapses.
    ///
    /// Returns whether the wake flag was set.
    pub(crate) fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut guard = self.park_lock.lock();
        if self.notified.swap(false, AtomicOrdering::AcqRel) {
            return true;
        }
        if self.is_stopped() {
            return false;
        }

        let deadline = match (
            Instant::now().checked_add(timeout),
            self.next_sleeper_deadline(),
        ) {
            (Some(limit), Some(wake_at)) => Some(limit.min(wake_at)),
            (limit, wake_at) => limit.or(wake_at),
        };
        match deadline {
            Some(deadline) => {
                self.park_cv.wait_until(&mut guard, deadline);
            }
            None => self.park_cv.wait(&mut guard),
        }
        self.notified.swap(false, AtomicOrdering::AcqRel)
    }

    /// Push a `Ready` routine and wake the processor.
    ///
    /// The wake flag is raised before the routine becomes visible in the run
    /// queue, so a processor that misses the routine cannot also miss the flag.
    fn admit(&self, routine: Arc<Routine>) {
        self.notified.store(true, AtomicOrdering::Release);
        self.run_queue.lock().push(routine);
        let _guard = self.park_lock.lock();
        self.park_cv.notify_one();
    }

    fn reap(&self, routine: &Routine) {
        routine.release_body();
        trace!(context = ?self.id(), routine = %routine.id(), "routine reaped");
        if let Some(listener) = self.reap_listener.get() {
            listener(routine);
        }
    }

    fn next_sleeper_deadline(&self) -> Option<Instant> {
        self.sleepers.lock().peek().map(|entry| entry.wake_at)
    }

    fn has_due_sleepers(&self, now: Instant) -> bool {
        self.next_sleeper_deadline()
            .map_or(false, |wake_at| wake_at <= now)
    }

    fn purge_sleeper(&self, id: RoutineId) {
        self.sleepers.lock().retain(|entry| entry.routine.id() != id);
    }

    /// Drop the heap entry of one sleep that ended early
    fn purge_sleep_entry(&self, id: RoutineId, wake_at: Instant) {
        self.sleepers
            .lock()
            .retain(|entry| entry.routine.id() != id || entry.wake_at != wake_at);
    }

    /// Move every sleeper whose deadline has passed to `Ready`
    fn promote_sleepers(&self, now: Instant) {
        let due: Vec<SleepEntry> = {
            let mut sleepers = self.sleepers.lock();
            let mut due = Vec::new();
            while sleepers.peek().map_or(false, |entry| entry.wake_at <= now) {
                if let Some(entry) = sleepers.pop() {
                    due.push(entry);
                }
            }
            due
        };

        for entry in due {
            let mut cell = entry.routine.cell();
            // Stale entries: woken early by notify, removed, or re-slept
            if cell.indexed
                && cell.state == RoutineState::Sleep
                && cell.wake_at == Some(entry.wake_at)
            {
                cell.state = RoutineState::Ready;
                cell.wake_at = None;
                self.admit(Arc::clone(&entry.routine));
            }
        }
    }
}

impl std::fmt::Debug for ProcessorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("id", &self.id())
            .field("policy", &self.policy)
            .field("rq_size", &self.rq_size())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
