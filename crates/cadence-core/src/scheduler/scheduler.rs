//! Scheduler: processor pool, placement and notification routing

use crate::config::{PolicyKind, SchedulerConfig};
use crate::error::{SchedError, SchedResult};
use crate::scheduler::context::{ProcessorContext, Removal};
use crate::scheduler::placement::Placement;
use crate::scheduler::processor::Processor;
use crate::scheduler::routine::{Routine, RoutineId, RoutineState, TaskOptions};
use crate::scheduler::stats::{ContextSnapshot, SchedulerStats};
use crate::scheduler::work::{FutureWork, Work};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::future::Future;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

type FxBuild = BuildHasherDefault<FxHasher>;

/// Routine bookkeeping shared with every context's reap listener
#[derive(Default)]
struct Registry {
    /// Routine -> owning context
    assignments: DashMap<RoutineId, usize, FxBuild>,

    /// Live routine names
    names: DashMap<Arc<str>, RoutineId, FxBuild>,

    created: AtomicU64,
    reaped: AtomicU64,
    faulted: AtomicU64,
}

impl Registry {
    fn on_reap(&self, routine: &Routine) {
        self.release(routine);
        self.reaped.fetch_add(1, Ordering::Relaxed);
        if routine.is_faulted() {
            self.faulted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn release(&self, routine: &Routine) {
        let id = routine.id();
        self.assignments.remove(&id);
        if let Some(name) = routine.name() {
            self.names.remove_if(name, |_, owner| *owner == id);
        }
    }
}

/// Main routine scheduler
///
/// Owns one [`ProcessorContext`] and one [`Processor`] per worker. Routines
/// are placed on a context at creation and never migrate; notifications are
/// routed to the owning context through the assignment record.
pub struct Scheduler {
    /// Validated configuration
    config: SchedulerConfig,

    /// One context per worker, indexed by processor id
    contexts: Vec<Arc<ProcessorContext>>,

    /// Workers, same indexing as `contexts`
    processors: Vec<Arc<Processor>>,

    /// Assignments, names and counters
    registry: Arc<Registry>,

    /// Placement heuristic
    placement: Placement,

    /// Whether the worker threads have been started
    started: AtomicBool,

    /// Whether shutdown has been requested
    shut_down: AtomicBool,

    /// Serializes start and shutdown
    lifecycle: Mutex<()>,
}

impl Scheduler {
    /// Build the pool without starting any thread.
    ///
    /// Processors can then be driven on the calling thread with
    /// [`run_until_idle`](Self::run_until_idle), or started later with
    /// [`start_workers`](Self::start_workers).
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        config.validate()?;

        let worker_count = config.resolved_worker_count();
        let registry = Arc::new(Registry::default());
        let mut contexts = Vec::with_capacity(worker_count);
        let mut processors = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let context = Arc::new(ProcessorContext::with_policy(
                config.policy,
                config.group_burst,
            ));
            context.set_id(id);
            let listener = Arc::clone(&registry);
            context.set_reap_listener(move |routine| listener.on_reap(routine));

            processors.push(Processor::with_thread_name(
                id,
                Arc::clone(&context),
                config.park_timeout(),
                &config.thread_name_prefix,
            ));
            contexts.push(context);
        }

        Ok(Self {
            placement: Placement::new(&config),
            config,
            contexts,
            processors,
            registry,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }

    /// Build the pool and start one thread per processor
    pub fn start(config: SchedulerConfig) -> SchedResult<Self> {
        let scheduler = Self::new(config)?;
        scheduler.start_workers()?;
        Ok(scheduler)
    }

    /// Start the worker threads of a pool built with [`new`](Self::new).
    ///
    /// Calling it again is a no-op.
    pub fn start_workers(&self) -> SchedResult<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.is_shut_down() {
            return Err(SchedError::ShutDown);
        }
        if self.is_started() {
            return Ok(());
        }

        for processor in &self.processors {
            processor.start()?;
        }
        self.started.store(true, Ordering::Release);

        info!(
            workers = self.processors.len(),
            policy = %self.config.policy,
            "scheduler started"
        );
        Ok(())
    }

    /// Create a routine, place it and enqueue it.
    ///
    /// The routine→context assignment is recorded before the routine becomes
    /// runnable, so a notify racing with the first slice is routed correctly.
    pub fn create_task<W: Work>(&self, work: W, options: TaskOptions) -> SchedResult<RoutineId> {
        self.submit(Arc::new(Routine::new(work, options)))
    }

    /// Create an unnamed routine with default options
    pub fn spawn<W: Work>(&self, work: W) -> SchedResult<RoutineId> {
        self.create_task(work, TaskOptions::default())
    }

    /// Create a routine driven by a future
    pub fn spawn_future<F>(&self, future: F, options: TaskOptions) -> SchedResult<RoutineId>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.create_task(FutureWork::new(future), options)
    }

    fn submit(&self, routine: Arc<Routine>) -> SchedResult<RoutineId> {
        if self.is_shut_down() {
            return Err(SchedError::ShutDown);
        }

        let id = routine.id();
        if let Some(name) = routine.name() {
            match self.registry.names.entry(Arc::clone(name)) {
                Entry::Occupied(_) => return Err(SchedError::DuplicateName(name.to_string())),
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let (index, placed_by) = self.placement.place(&routine, &self.contexts);
        self.registry.assignments.insert(id, index);
        self.registry.created.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = self.contexts[index].enqueue(Arc::clone(&routine)) {
            self.registry.release(&routine);
            self.registry.created.fetch_sub(1, Ordering::Relaxed);
            return Err(match err {
                SchedError::ContextStopped(_) if self.is_shut_down() => SchedError::ShutDown,
                other => other,
            });
        }

        trace!(routine = %id, context = index, placed_by = ?placed_by, "routine created");
        Ok(id)
    }

    /// Wake a waiting routine.
    ///
    /// Returns whether the routine moved from a wait state to `Ready`.
    /// Unknown ids (never created, or already finished) are a no-op.
    pub fn notify(&self, id: RoutineId) -> bool {
        match self.context_of(id) {
            Some(index) => self.contexts[index].notify(id),
            None => {
                debug!(routine = %id, "notify for unknown routine");
                false
            }
        }
    }

    /// Remove a routine from its context.
    ///
    /// A running routine is removed once its current slice ends.
    pub fn remove_task(&self, id: RoutineId) -> Removal {
        let removal = match self.context_of(id) {
            Some(index) => self.contexts[index].remove_routine(id),
            None => Removal::Unknown,
        };
        if removal == Removal::Unknown {
            debug!(routine = %id, "remove for unknown routine");
        }
        removal
    }

    /// Stop every processor and join the worker threads.
    ///
    /// In-flight slices run to completion. Routines still blocked at this
    /// point will never run again; they are logged. Idempotent.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for processor in &self.processors {
            processor.shutdown();
        }

        for context in &self.contexts {
            let stranded = context.routines();
            if !stranded.is_empty() {
                warn!(
                    context = ?context.id(),
                    count = stranded.len(),
                    routines = ?stranded,
                    "routines still owned at shutdown"
                );
            }
        }

        info!(
            created = self.registry.created.load(Ordering::Relaxed),
            reaped = self.registry.reaped.load(Ordering::Relaxed),
            "scheduler shut down"
        );
    }

    /// Run slices on the calling thread until no context has runnable work.
    ///
    /// Only does something while the worker threads are not started. Returns
    /// the number of slices executed.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let round: usize = self
                .processors
                .iter()
                .map(|processor| usize::from(processor.run_once()))
                .sum();
            if round == 0 {
                return total;
            }
            total += round;
        }
    }

    /// Id of the live routine with this name
    pub fn routine_id(&self, name: &str) -> Option<RoutineId> {
        self.registry.names.get(name).map(|id| *id)
    }

    /// Current state of a live routine
    pub fn routine_state(&self, id: RoutineId) -> Option<RoutineState> {
        let index = self.context_of(id)?;
        self.contexts[index].get_state(id)
    }

    /// Home context of a group under the group-affinity policy
    pub fn group_home(&self, group: &str) -> Option<usize> {
        self.placement.group_home(group)
    }

    /// Context owning a live routine
    pub fn context_of(&self, id: RoutineId) -> Option<usize> {
        self.registry.assignments.get(&id).map(|index| *index)
    }

    /// Number of routines owned by one context
    pub fn rq_size(&self, context: usize) -> Option<usize> {
        self.contexts.get(context).map(|ctx| ctx.rq_size())
    }

    /// Context by processor id
    pub fn context(&self, id: usize) -> Option<&Arc<ProcessorContext>> {
        self.contexts.get(id)
    }

    /// Processor by id
    pub fn processor(&self, id: usize) -> Option<&Arc<Processor>> {
        self.processors.get(id)
    }

    /// Number of processors
    pub fn worker_count(&self) -> usize {
        self.processors.len()
    }

    /// Run-queue policy of every context
    pub fn policy(&self) -> PolicyKind {
        self.config.policy
    }

    /// The validated configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether the worker threads have been started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether shutdown has been requested
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Per-context diagnostics
    pub fn context_snapshots(&self) -> Vec<ContextSnapshot> {
        self.contexts.iter().map(|ctx| ctx.snapshot()).collect()
    }

    /// Scheduler-wide counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            routines_created: self.registry.created.load(Ordering::Relaxed),
            routines_reaped: self.registry.reaped.load(Ordering::Relaxed),
            routines_faulted: self.registry.faulted.load(Ordering::Relaxed),
            active: self.contexts.iter().map(|ctx| ctx.rq_size()).sum(),
        }
    }

    /// Wait until every context is empty (with timeout)
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        loop {
            if self.contexts.iter().all(|ctx| ctx.rq_size() == 0) {
                return true;
            }

            if start.elapsed() > timeout {
                return false;
            }

            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.processors.len())
            .field("policy", &self.config.policy)
            .field("started", &self.is_started())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::work::{RoutineContext, Step, WaitKind};
    use std::sync::atomic::AtomicUsize;

    fn done(_: &mut RoutineContext) -> Step {
        Step::Done
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(SchedulerConfig::new(3, PolicyKind::Priority)).unwrap();
        assert_eq!(scheduler.worker_count(), 3);
        assert_eq!(scheduler.policy(), PolicyKind::Priority);
        assert!(!scheduler.is_started());
        for id in 0..3 {
            assert_eq!(scheduler.context(id).and_then(|c| c.id()), Some(id));
            assert_eq!(scheduler.context(id).and_then(|c| c.bound_processor()), Some(id));
        }
        assert!(scheduler.context(3).is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SchedulerConfig::new(2, PolicyKind::Fifo).with_affinity("planning", 4);
        assert!(matches!(
            Scheduler::new(config),
            Err(SchedError::Config(_))
        ));
    }

    #[test]
    fn test_scheduler_start_idempotent() {
        let scheduler = Scheduler::start(SchedulerConfig::new(2, PolicyKind::Fifo)).unwrap();
        assert!(scheduler.is_started());
        scheduler.start_workers().unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        scheduler.shutdown();
        assert!(matches!(scheduler.start_workers(), Err(SchedError::ShutDown)));
    }

    #[test]
    fn test_create_task_runs() {
        let scheduler = Scheduler::start(SchedulerConfig::new(2, PolicyKind::Fifo)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            scheduler
                .spawn(move |_: &mut RoutineContext| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Step::Done
                })
                .unwrap();
        }

        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        let stats = scheduler.stats();
        assert_eq!(stats.routines_created, 10);
        assert_eq!(stats.routines_reaped, 10);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let scheduler = Scheduler::new(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap();
        scheduler.shutdown();
        assert!(matches!(scheduler.spawn(done), Err(SchedError::ShutDown)));
        assert_eq!(scheduler.stats().routines_created, 0);
    }

    #[test]
    fn test_duplicate_name_rejected_until_reaped() {
        let scheduler = Scheduler::new(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap();
        let id = scheduler
            .create_task(done, TaskOptions::new().name("planner"))
            .unwrap();
        assert_eq!(scheduler.routine_id("planner"), Some(id));

        let err = scheduler
            .create_task(done, TaskOptions::new().name("planner"))
            .unwrap_err();
        assert!(matches!(err, SchedError::DuplicateName(ref name) if name == "planner"));

        scheduler.run_until_idle();
        assert_eq!(scheduler.routine_id("planner"), None);
        assert!(scheduler
            .create_task(done, TaskOptions::new().name("planner"))
            .is_ok());
    }

    #[test]
    fn test_notify_routes_to_owner() {
        let scheduler = Scheduler::new(SchedulerConfig::new(2, PolicyKind::Fifo)).unwrap();
        let mut waited = false;
        let id = scheduler
            .create_task(
                move |_: &mut RoutineContext| {
                    if waited {
                        Step::Done
                    } else {
                        waited = true;
                        Step::Wait(WaitKind::Io)
                    }
                },
                TaskOptions::new().affinity(1),
            )
            .unwrap();

        assert_eq!(scheduler.context_of(id), Some(1));
        assert_eq!(scheduler.run_until_idle(), 1);
        assert_eq!(scheduler.routine_state(id), Some(RoutineState::IoWait));
        assert_eq!(scheduler.context_snapshots()[1].waiting, vec![(id, RoutineState::IoWait)]);

        assert!(scheduler.notify(id));
        assert!(!scheduler.notify(id));
        assert_eq!(scheduler.run_until_idle(), 1);
        assert_eq!(scheduler.routine_state(id), None);
        assert!(!scheduler.notify(id));
    }

    #[test]
    fn test_remove_task() {
        let scheduler = Scheduler::new(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap();
        let id = scheduler.spawn(done).unwrap();

        assert_eq!(scheduler.remove_task(id), Removal::Removed);
        assert_eq!(scheduler.remove_task(id), Removal::Unknown);
        assert_eq!(scheduler.context_of(id), None);
        assert_eq!(scheduler.run_until_idle(), 0);
        assert_eq!(scheduler.stats().routines_reaped, 1);
    }

    #[test]
    fn test_priority_order_on_one_processor() {
        let scheduler = Scheduler::new(SchedulerConfig::new(1, PolicyKind::Priority)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut ids = Vec::new();
        for priority in [1, 2, 2] {
            let order = Arc::clone(&order);
            let id = scheduler
                .create_task(
                    move |cx: &mut RoutineContext| {
                        order.lock().push(cx.id());
                        Step::Done
                    },
                    TaskOptions::new().priority(priority),
                )
                .unwrap();
            ids.push(id);
        }

        assert_eq!(scheduler.run_until_idle(), 3);
        assert_eq!(*order.lock(), vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn test_faulted_routine_counted() {
        let scheduler = Scheduler::new(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap();
        scheduler
            .spawn(|_: &mut RoutineContext| -> Step { panic!("bad frame") })
            .unwrap();
        scheduler.spawn(done).unwrap();

        assert_eq!(scheduler.run_until_idle(), 2);
        let stats = scheduler.stats();
        assert_eq!(stats.routines_faulted, 1);
        assert_eq!(stats.routines_reaped, 2);
    }

    #[test]
    fn test_group_home_reported() {
        let scheduler = Scheduler::new(SchedulerConfig::new(2, PolicyKind::GroupAffinity)).unwrap();
        assert_eq!(scheduler.group_home("camera"), None);

        let first = scheduler
            .create_task(done, TaskOptions::new().group("camera"))
            .unwrap();
        let home = scheduler.context_of(first);
        assert!(home.is_some());
        assert_eq!(scheduler.group_home("camera"), home);

        let second = scheduler
            .create_task(done, TaskOptions::new().group("camera"))
            .unwrap();
        assert_eq!(scheduler.context_of(second), home);
    }

    #[test]
    fn test_drop_shuts_down() {
        let scheduler = Scheduler::start(SchedulerConfig::new(2, PolicyKind::Fifo)).unwrap();
        let context = Arc::clone(scheduler.context(0).unwrap());
        drop(scheduler);
        assert!(context.is_stopped());
    }
}
