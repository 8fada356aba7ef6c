//! Routine structure and execution state

use crate::scheduler::context::ProcessorContext;
use crate::scheduler::work::{RoutineContext, Step, Work};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Unique identifier for a Routine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutineId(u64);

static NEXT_ROUTINE_ID: AtomicU64 = AtomicU64::new(1);

impl RoutineId {
    /// Generate a new unique RoutineId
    pub fn new() -> Self {
        RoutineId(NEXT_ROUTINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a RoutineId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        RoutineId(id)
    }
}

impl Default for RoutineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routine priority. Higher values run first under the priority policy.
pub type Priority = u32;

/// State of a Routine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RoutineState {
    /// Runnable, waiting in its context's run queue
    Ready,
    /// Currently executing on its processor
    Running,
    /// Blocked until external data arrives
    DataWait,
    /// Blocked until an IO completion arrives
    IoWait,
    /// Blocked until a deadline passes (or an early notify)
    Sleep,
    /// Body completed or faulted; terminal
    Finished,
}

impl RoutineState {
    /// Whether this is one of the three wait states
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            RoutineState::DataWait | RoutineState::IoWait | RoutineState::Sleep
        )
    }

    /// Whether this state is terminal
    pub fn is_finished(self) -> bool {
        self == RoutineState::Finished
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Wait states only ever lead back to `Ready`; nothing leaves `Finished`.
    pub fn can_transition_to(self, next: RoutineState) -> bool {
        use RoutineState::*;
        match (self, next) {
            (Ready, Running) => true,
            (Running, Ready | DataWait | IoWait | Sleep | Finished) => true,
            (DataWait | IoWait | Sleep, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RoutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutineState::Ready => "READY",
            RoutineState::Running => "RUNNING",
            RoutineState::DataWait => "DATA_WAIT",
            RoutineState::IoWait => "IO_WAIT",
            RoutineState::Sleep => "SLEEP",
            RoutineState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Creation-time attributes of a routine
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Optional unique name
    pub name: Option<String>,
    /// Ordering key for the priority policy
    pub priority: Priority,
    /// Producer group, used for placement and group-affinity ordering
    pub group: Option<String>,
    /// Preferred processor id
    pub affinity: Option<usize>,
}

impl TaskOptions {
    /// Default options: unnamed, priority 0, no group, no affinity
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the routine name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the producer group
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the affinity hint
    pub fn affinity(mut self, processor: usize) -> Self {
        self.affinity = Some(processor);
        self
    }
}

/// Result of one execution slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutcome {
    /// The body returned normally
    Step(Step),
    /// The body panicked; the message is recorded on the routine
    Faulted(String),
}

/// Scheduling state guarded by the routine's state lock.
///
/// Only the owning [`ProcessorContext`] mutates this.
#[derive(Debug)]
pub(crate) struct StateCell {
    pub(crate) state: RoutineState,
    /// A notify arrived while the routine was running
    pub(crate) wake_pending: bool,
    /// A removal arrived while the routine was running
    pub(crate) remove_requested: bool,
    /// Present in some context's index
    pub(crate) indexed: bool,
    /// Deadline for `Sleep`
    pub(crate) wake_at: Option<Instant>,
}

/// A cooperatively scheduled unit of work
pub struct Routine {
    /// Unique identifier
    id: RoutineId,

    /// Optional unique name
    name: Option<Arc<str>>,

    /// Priority ordering key
    priority: Priority,

    /// Producer group
    group: Option<Arc<str>>,

    /// Preferred processor
    affinity: Option<usize>,

    /// Scheduling state
    cell: Mutex<StateCell>,

    /// Resumable body; dropped once the routine finishes or is removed
    work: Mutex<Option<Box<dyn Work>>>,

    /// Panic message if the body faulted
    fault: Mutex<Option<String>>,

    /// Number of slices executed
    slices: AtomicU64,

    /// Creation time
    created_at: Instant,
}

impl Routine {
    /// Create a new routine in the `Ready` state
    pub fn new<W: Work>(work: W, options: TaskOptions) -> Self {
        Self::from_boxed(Box::new(work), options)
    }

    /// Create a new routine from an already boxed body
    pub fn from_boxed(work: Box<dyn Work>, options: TaskOptions) -> Self {
        Self {
            id: RoutineId::new(),
            name: options.name.map(Arc::from),
            priority: options.priority,
            group: options.group.map(Arc::from),
            affinity: options.affinity,
            cell: Mutex::new(StateCell {
                state: RoutineState::Ready,
                wake_pending: false,
                remove_requested: false,
                indexed: false,
                wake_at: None,
            }),
            work: Mutex::new(Some(work)),
            fault: Mutex::new(None),
            slices: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Get the routine's unique ID
    pub fn id(&self) -> RoutineId {
        self.id
    }

    /// Get the routine's name
    pub fn name(&self) -> Option<&Arc<str>> {
        self.name.as_ref()
    }

    /// Get the priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Get the producer group
    pub fn group(&self) -> Option<&Arc<str>> {
        self.group.as_ref()
    }

    /// Get the affinity hint
    pub fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    /// Get the current state
    pub fn state(&self) -> RoutineState {
        self.cell.lock().state
    }

    /// Panic message, if the body faulted
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Whether the body faulted
    pub fn is_faulted(&self) -> bool {
        self.fault.lock().is_some()
    }

    /// Number of slices executed so far
    pub fn slices(&self) -> u64 {
        self.slices.load(Ordering::Relaxed)
    }

    /// Creation time
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Run the body for one slice.
    ///
    /// Only the processor bound to `owner` calls this, and only after moving
    /// the routine to `Running`. A panic inside the body is caught here and
    /// reported as [`SliceOutcome::Faulted`]; the worker thread survives it.
    /// With no owner, wakers produced by the body are inert.
    pub fn resume(&self, owner: Option<&Arc<ProcessorContext>>) -> SliceOutcome {
        let slice = self.slices.fetch_add(1, Ordering::Relaxed) + 1;

        let mut work = self.work.lock();
        let Some(body) = work.as_mut() else {
            return SliceOutcome::Step(Step::Done);
        };

        let mut cx = RoutineContext::new(self.id, slice, owner);
        match panic::catch_unwind(AssertUnwindSafe(|| body.resume(&mut cx))) {
            Ok(step) => SliceOutcome::Step(step),
            Err(payload) => SliceOutcome::Faulted(panic_message(payload.as_ref())),
        }
    }

    pub(crate) fn cell(&self) -> parking_lot::MutexGuard<'_, StateCell> {
        self.cell.lock()
    }

    pub(crate) fn record_fault(&self, message: &str) {
        *self.fault.lock() = Some(message.to_string());
    }

    /// Drop the body. Called once the routine can never run again.
    pub(crate) fn release_body(&self) {
        let body = self.work.lock().take();
        drop(body);
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("group", &self.group)
            .field("state", &self.state())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "routine panicked".to_string()
    }
}
