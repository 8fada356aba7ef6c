//! Integration tests for the routine scheduler

use cadence_core::{
    PolicyKind, Removal, RoutineContext, RoutineId, RoutineState, SchedError, Scheduler,
    SchedulerConfig, Step, TaskOptions, WaitKind,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn test_many_routines_drain_every_context() {
    init_tracing();
    let scheduler = Scheduler::start(SchedulerConfig::new(4, PolicyKind::Fifo)).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..1000 {
        let finished = Arc::clone(&finished);
        let mut yielded = false;
        scheduler
            .spawn(move |_: &mut RoutineContext| {
                if !yielded {
                    yielded = true;
                    return Step::Yield;
                }
                finished.fetch_add(1, Ordering::SeqCst);
                Step::Done
            })
            .unwrap();
    }

    assert!(scheduler.wait_idle(Duration::from_secs(10)));
    assert_eq!(finished.load(Ordering::SeqCst), 1000);
    for id in 0..scheduler.worker_count() {
        assert_eq!(scheduler.rq_size(id), Some(0));
        assert!(scheduler.context(id).unwrap().rq_empty());
    }

    let stats = scheduler.stats();
    assert_eq!(stats.routines_created, 1000);
    assert_eq!(stats.routines_reaped, 1000);
    assert_eq!(stats.active, 0);

    scheduler.shutdown();
    scheduler.shutdown();
}

#[test]
fn test_load_spreads_across_processors() {
    let scheduler = Scheduler::new(SchedulerConfig::new(4, PolicyKind::Fifo)).unwrap();
    for _ in 0..40 {
        scheduler
            .spawn(|_: &mut RoutineContext| Step::Wait(WaitKind::Data))
            .unwrap();
    }

    for id in 0..4 {
        assert_eq!(scheduler.rq_size(id), Some(10));
    }
}

#[test]
fn test_block_and_notify_from_another_thread() {
    init_tracing();
    let scheduler = Arc::new(Scheduler::start(SchedulerConfig::new(2, PolicyKind::Fifo)).unwrap());
    let (tx, rx) = mpsc::channel::<RoutineId>();
    let resumed = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&resumed);
    let mut waiting = false;
    let id = scheduler
        .create_task(
            move |cx: &mut RoutineContext| {
                if waiting {
                    flag.store(true, Ordering::SeqCst);
                    return Step::Done;
                }
                waiting = true;
                let _ = tx.send(cx.id());
                Step::Wait(WaitKind::Data)
            },
            TaskOptions::new().name("subscriber"),
        )
        .unwrap();

    // Producer: waits for the subscriber to block, then publishes
    let producer = {
        let scheduler = Arc::clone(&scheduler);
        thread::spawn(move || {
            let id = rx.recv().unwrap();
            assert!(wait_until(Duration::from_secs(5), || {
                scheduler.routine_state(id) == Some(RoutineState::DataWait)
            }));
            scheduler.notify(id)
        })
    };

    assert!(producer.join().unwrap());
    assert!(wait_until(Duration::from_secs(5), || resumed.load(Ordering::SeqCst)));
    assert!(scheduler.wait_idle(Duration::from_secs(5)));
    assert_eq!(scheduler.routine_state(id), None);
    assert_eq!(scheduler.routine_id("subscriber"), None);
    // A late notify for a finished routine is a no-op
    assert!(!scheduler.notify(id));
}

#[test]
fn test_notifier_handed_to_producer() {
    let scheduler = Scheduler::start(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap();
    let (tx, rx) = mpsc::channel();
    let mut armed = false;

    scheduler
        .spawn(move |cx: &mut RoutineContext| {
            if armed {
                return Step::Done;
            }
            armed = true;
            let _ = tx.send(cx.notifier());
            Step::Wait(WaitKind::Io)
        })
        .unwrap();

    let notifier = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Whether the notify lands before or after the routine reports its wait,
    // the routine must finish
    notifier.notify();
    assert!(scheduler.wait_idle(Duration::from_secs(5)));
}

#[test]
fn test_priority_order_single_processor() {
    let scheduler = Scheduler::new(SchedulerConfig::new(1, PolicyKind::Priority)).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let ids: Vec<RoutineId> = [1, 2, 2]
        .into_iter()
        .map(|priority| {
            let order = Arc::clone(&order);
            scheduler
                .create_task(
                    move |cx: &mut RoutineContext| {
                        order.lock().push(cx.id());
                        Step::Done
                    },
                    TaskOptions::new().priority(priority),
                )
                .unwrap()
        })
        .collect();

    scheduler.start_workers().unwrap();
    assert!(scheduler.wait_idle(Duration::from_secs(5)));
    assert_eq!(*order.lock(), vec![ids[1], ids[2], ids[0]]);
}

#[test]
fn test_group_affinity_keeps_groups_together() {
    let config = SchedulerConfig::new(2, PolicyKind::GroupAffinity).with_group_burst(8);
    let scheduler = Scheduler::new(config).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for group in ["lidar", "camera", "lidar", "camera", "lidar"] {
        let order = Arc::clone(&order);
        scheduler
            .create_task(
                move |_: &mut RoutineContext| {
                    order.lock().push(group);
                    Step::Done
                },
                TaskOptions::new().group(group).affinity(0),
            )
            .unwrap();
    }

    assert_eq!(scheduler.run_until_idle(), 5);
    assert_eq!(
        *order.lock(),
        vec!["lidar", "lidar", "lidar", "camera", "camera"]
    );
}

#[test]
fn test_affinity_table_placement() {
    let config = SchedulerConfig::new(3, PolicyKind::Fifo).with_affinity("planning", 2);
    let scheduler = Scheduler::new(config).unwrap();

    let pinned = scheduler
        .create_task(
            |_: &mut RoutineContext| Step::Done,
            TaskOptions::new().group("planning"),
        )
        .unwrap();
    let hinted = scheduler
        .create_task(
            |_: &mut RoutineContext| Step::Done,
            TaskOptions::new().group("planning").affinity(1),
        )
        .unwrap();
    let bad_hint = scheduler
        .create_task(
            |_: &mut RoutineContext| Step::Done,
            TaskOptions::new().group("planning").affinity(99),
        )
        .unwrap();

    assert_eq!(scheduler.context_of(pinned), Some(2));
    assert_eq!(scheduler.context_of(hinted), Some(1));
    assert_eq!(scheduler.context_of(bad_hint), Some(2));
}

#[test]
fn test_remove_while_running_is_deferred() {
    let scheduler = Arc::new(Scheduler::start(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let slices = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&slices);
    let id = scheduler
        .spawn(move |_: &mut RoutineContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = entered_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Step::Yield
        })
        .unwrap();

    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(scheduler.routine_state(id), Some(RoutineState::Running));
    assert_eq!(scheduler.remove_task(id), Removal::Deferred);
    release_tx.send(()).unwrap();

    assert!(scheduler.wait_idle(Duration::from_secs(5)));
    assert_eq!(scheduler.routine_state(id), None);
    // The yield did not put it back in the queue
    assert_eq!(slices.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.remove_task(id), Removal::Unknown);
}

#[test]
fn test_fault_does_not_kill_processor() {
    let scheduler = Scheduler::start(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    scheduler
        .spawn(|_: &mut RoutineContext| -> Step { panic!("bad calibration") })
        .unwrap();
    assert!(scheduler.wait_idle(Duration::from_secs(5)));

    let flag = Arc::clone(&ran);
    scheduler
        .spawn(move |_: &mut RoutineContext| {
            flag.store(true, Ordering::SeqCst);
            Step::Done
        })
        .unwrap();
    assert!(scheduler.wait_idle(Duration::from_secs(5)));
    assert!(ran.load(Ordering::SeqCst));

    let stats = scheduler.stats();
    assert_eq!(stats.routines_faulted, 1);
    let processor = scheduler.context_snapshots()[0].processor.unwrap();
    assert_eq!(processor.faulted, 1);
    assert_eq!(processor.finished, 2);
}

#[test]
fn test_future_routine_woken_externally() {
    let scheduler = Scheduler::start(SchedulerConfig::new(2, PolicyKind::Fifo)).unwrap();
    let (tx, rx) = mpsc::channel::<std::task::Waker>();
    let ready = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    let gate = Arc::clone(&ready);
    let finished = Arc::clone(&done);
    scheduler
        .spawn_future(
            async move {
                std::future::poll_fn(|cx| {
                    if gate.load(Ordering::SeqCst) {
                        std::task::Poll::Ready(())
                    } else {
                        let _ = tx.send(cx.waker().clone());
                        std::task::Poll::Pending
                    }
                })
                .await;
                cadence_core::yield_now().await;
                finished.store(true, Ordering::SeqCst);
            },
            TaskOptions::new().name("fusion"),
        )
        .unwrap();

    let waker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    ready.store(true, Ordering::SeqCst);
    waker.wake();

    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    assert!(scheduler.wait_idle(Duration::from_secs(5)));
}

#[test]
fn test_sleeping_routine_wakes_itself() {
    let scheduler = Scheduler::start(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap();
    let mut slept = false;
    let start = Instant::now();

    let id = scheduler
        .spawn(move |_: &mut RoutineContext| {
            if slept {
                return Step::Done;
            }
            slept = true;
            Step::Sleep(Duration::from_millis(30))
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.routine_state(id) != Some(RoutineState::Ready)
    }));
    assert!(scheduler.wait_idle(Duration::from_secs(5)));
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn test_unbounded_sleep_keeps_processor_alive() {
    let scheduler = Scheduler::start(SchedulerConfig::new(1, PolicyKind::Fifo)).unwrap();
    let mut slept = false;

    let sleeper = scheduler
        .spawn(move |_: &mut RoutineContext| {
            if slept {
                return Step::Done;
            }
            slept = true;
            Step::Sleep(Duration::MAX)
        })
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.routine_state(sleeper) == Some(RoutineState::Sleep)
    }));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    scheduler
        .spawn(move |_: &mut RoutineContext| {
            flag.store(true, Ordering::SeqCst);
            Step::Done
        })
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst)));
    assert_eq!(scheduler.routine_state(sleeper), Some(RoutineState::Sleep));

    assert!(scheduler.notify(sleeper));
    assert!(scheduler.wait_idle(Duration::from_secs(5)));
    assert_eq!(scheduler.stats().routines_faulted, 0);
}

#[test]
fn test_shutdown_reports_blocked_routines() {
    init_tracing();
    let scheduler = Scheduler::start(SchedulerConfig::new(2, PolicyKind::Fifo)).unwrap();
    let id = scheduler
        .spawn(|_: &mut RoutineContext| Step::Wait(WaitKind::Io))
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.routine_state(id) == Some(RoutineState::IoWait)
    }));
    let waiting: Vec<_> = scheduler
        .context_snapshots()
        .into_iter()
        .flat_map(|snapshot| snapshot.waiting)
        .collect();
    assert_eq!(waiting, vec![(id, RoutineState::IoWait)]);

    scheduler.shutdown();
    assert!(matches!(
        scheduler.spawn(|_: &mut RoutineContext| Step::Done),
        Err(SchedError::ShutDown)
    ));
    // Still indexed, never resumed
    assert_eq!(scheduler.routine_state(id), Some(RoutineState::IoWait));
}
