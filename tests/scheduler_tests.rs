use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use satexec::scheduler::OrbitalTaskScheduler;
use satexec::task::{
    OrbitPosition, RecoveryStrategy, Task, TaskPriority, TaskStatus, TaskType, TriggerCondition,
};

fn wait_for<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn wait_for_terminal(scheduler: &OrbitalTaskScheduler, id: &str, timeout: Duration) -> bool {
    wait_for(timeout, || {
        scheduler
            .status(id)
            .map(|status| status.is_terminal())
            .unwrap_or(false)
    })
}

#[test]
fn test_priority_dispatch_order() {
    // Tasks appending "1" (LOW), "2" (NORMAL), "3" (HIGH) dispatch
    // highest-priority-first, producing "321".
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let order = Arc::new(Mutex::new(String::new()));
    let hold = SystemTime::now() + Duration::from_millis(300);

    let mut ids = Vec::new();
    for (digit, priority) in [
        ("1", TaskPriority::Low),
        ("2", TaskPriority::Normal),
        ("3", TaskPriority::High),
    ] {
        let sink = Arc::clone(&order);
        let id = scheduler
            .schedule(
                Task::new(format!("task-{}", digit), TaskType::Maintenance, move |_| {
                    sink.lock().unwrap().push_str(digit);
                    true
                })
                .with_priority(priority)
                .with_scheduled_time(hold),
            )
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        assert!(wait_for_terminal(&scheduler, id, Duration::from_secs(5)));
    }
    assert_eq!(order.lock().unwrap().as_str(), "321");
    scheduler.stop();
}

#[test]
fn test_fifo_within_equal_priority_and_time() {
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let order = Arc::new(Mutex::new(Vec::new()));
    let hold = SystemTime::now() + Duration::from_millis(300);
    let mut ids = Vec::new();
    for index in 0..5 {
        let sink = Arc::clone(&order);
        let id = scheduler
            .schedule(
                Task::new(format!("fifo-{}", index), TaskType::Maintenance, move |_| {
                    sink.lock().unwrap().push(index);
                    true
                })
                .with_scheduled_time(hold),
            )
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        assert!(wait_for_terminal(&scheduler, id, Duration::from_secs(5)));
    }
    assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2, 3, 4]);
    scheduler.stop();
}

#[test]
fn test_tmr_majority_execution() {
    // A radiation-protected payload runs exactly three times and a
    // unanimous vote reports no radiation event.
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let executions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&executions);
    let id = scheduler
        .schedule(
            Task::new("protected", TaskType::Maintenance, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .with_radiation_protection(true),
        )
        .unwrap();

    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.status(&id), Some(TaskStatus::Completed));

    let result = scheduler.result(&id).unwrap();
    assert!(!result.radiation_event_detected);
    scheduler.stop();
}

#[test]
fn test_tmr_flags_radiation_on_partial_panic() {
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let invocation = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocation);
    let id = scheduler
        .schedule(
            Task::new("glitchy", TaskType::Maintenance, move |_| {
                // First invocation upsets; the remaining two agree.
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("bit flip in accumulator");
                }
                true
            })
            .with_radiation_protection(true),
        )
        .unwrap();

    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    let result = scheduler.result(&id).unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert!(result.radiation_event_detected);
    scheduler.stop();
}

#[test]
fn test_position_trigger() {
    // A conditional task at (550 km, 45, 90) must not fire for a
    // non-matching fix and must fire within 3 s of a matching one.
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let executed = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&executed);
    let id = scheduler
        .schedule_conditional(
            Task::new("overflight", TaskType::PayloadOperation, move |_| {
                observer.fetch_add(1, Ordering::SeqCst);
                true
            }),
            TriggerCondition::at_position(OrbitPosition::new(550.0, 45.0, 90.0)),
        )
        .unwrap();

    scheduler.update_orbit(OrbitPosition::new(550.0, 0.0, 0.0));
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    scheduler.update_orbit(OrbitPosition::new(550.0, 45.0, 90.0));
    assert!(wait_for(Duration::from_secs(3), || {
        executed.load(Ordering::SeqCst) > 0
    }));
    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    assert_eq!(scheduler.status(&id), Some(TaskStatus::Completed));
    scheduler.stop();
}

#[test]
fn test_recurring_task_cancellation() {
    // A 100 ms recurring counter reaches at least 3 in 550 ms, then
    // stops counting once canceled.
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let counter = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&counter);
    let id = scheduler
        .schedule_recurring(
            Task::new("heartbeat", TaskType::Telemetry, move |_| {
                observer.fetch_add(1, Ordering::SeqCst);
                true
            }),
            Duration::from_millis(100),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(550));
    assert!(counter.load(Ordering::SeqCst) >= 3);

    // Cancel refuses a running invocation; between relaunches it lands.
    let mut canceled = false;
    for _ in 0..50 {
        if scheduler.cancel(&id).is_ok() {
            canceled = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(canceled);
    std::thread::sleep(Duration::from_millis(100));
    let frozen = counter.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(counter.load(Ordering::SeqCst), frozen);
    scheduler.stop();
}

#[test]
fn test_completion_callbacks_filter_by_type() {
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let maintenance_seen = Arc::new(AtomicUsize::new(0));
    let telemetry_seen = Arc::new(AtomicUsize::new(0));

    let observer = Arc::clone(&maintenance_seen);
    let callback_id = scheduler.register_completion_callback(
        move |result| {
            assert_eq!(result.status, TaskStatus::Completed);
            observer.fetch_add(1, Ordering::SeqCst);
        },
        TaskType::Maintenance,
    );
    let observer = Arc::clone(&telemetry_seen);
    scheduler.register_completion_callback(
        move |_| {
            observer.fetch_add(1, Ordering::SeqCst);
        },
        TaskType::Telemetry,
    );

    let id = scheduler
        .schedule(Task::new("maint", TaskType::Maintenance, |_| true))
        .unwrap();
    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    assert!(wait_for(Duration::from_secs(1), || {
        maintenance_seen.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(telemetry_seen.load(Ordering::SeqCst), 0);

    // After unregistration no further notifications arrive.
    scheduler.unregister_completion_callback(callback_id);
    let id = scheduler
        .schedule(Task::new("maint-2", TaskType::Maintenance, |_| true))
        .unwrap();
    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(maintenance_seen.load(Ordering::SeqCst), 1);
    scheduler.stop();
}

#[test]
fn test_panicking_callback_does_not_poison_executor() {
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    scheduler.register_completion_callback(
        |_| panic!("subscriber bug"),
        TaskType::Maintenance,
    );

    let first = scheduler
        .schedule(Task::new("one", TaskType::Maintenance, |_| true))
        .unwrap();
    assert!(wait_for_terminal(&scheduler, &first, Duration::from_secs(5)));

    // The executor keeps dispatching after the callback panic.
    let second = scheduler
        .schedule(Task::new("two", TaskType::Maintenance, |_| true))
        .unwrap();
    assert!(wait_for_terminal(&scheduler, &second, Duration::from_secs(5)));
    assert_eq!(scheduler.status(&second), Some(TaskStatus::Completed));
    scheduler.stop();
}

#[test]
fn test_retry_then_recovery_cycle() {
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let id = scheduler
        .schedule(
            Task::new("stubborn", TaskType::Maintenance, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
            .with_retry_limit(1),
        )
        .unwrap();

    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    assert_eq!(scheduler.status(&id), Some(TaskStatus::Failed));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // CHECKPOINT_RESTORE re-queues with reset retries and annotates.
    scheduler
        .recover(&id, RecoveryStrategy::CheckpointRestore)
        .unwrap();
    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let snap = scheduler
        .all_tasks()
        .into_iter()
        .find(|task| task.id == id)
        .unwrap();
    assert_eq!(
        snap.metadata.get("recovery_type").map(String::as_str),
        Some("checkpoint")
    );
    scheduler.stop();
}

#[test]
fn test_metrics_invariant() {
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let mut terminal_ids = Vec::new();
    for index in 0..4 {
        let id = scheduler
            .schedule(
                Task::new(format!("w-{}", index), TaskType::Maintenance, move |_| {
                    index % 2 == 0
                })
                .with_retry_limit(0),
            )
            .unwrap();
        terminal_ids.push(id);
    }
    for id in &terminal_ids {
        assert!(wait_for_terminal(&scheduler, id, Duration::from_secs(5)));
    }

    let metrics = scheduler.report_metrics();
    let completed = metrics.census_count(TaskStatus::Completed) as u64;
    let failed = metrics.census_count(TaskStatus::Failed) as u64;
    assert_eq!(metrics.tasks_executed, completed + failed);
    assert_eq!(metrics.tasks_failed, failed);
    scheduler.stop();
}

#[test]
fn test_suspend_mid_run_emits_exactly_once() {
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let notifications = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&notifications);
    scheduler.register_completion_callback(
        move |_| {
            observer.fetch_add(1, Ordering::SeqCst);
        },
        TaskType::Maintenance,
    );

    let gate = Arc::new(AtomicUsize::new(0));
    let hold = Arc::clone(&gate);
    let id = scheduler
        .schedule(Task::new("pausable", TaskType::Maintenance, move |_| {
            while hold.load(Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
            true
        }))
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        scheduler.status(&id) == Some(TaskStatus::Running)
    }));
    scheduler.suspend(&id).unwrap();
    gate.store(1, Ordering::SeqCst);

    // The in-flight invocation finishes, but the task stays suspended and
    // nothing is counted or emitted for it.
    assert!(wait_for(Duration::from_secs(5), || {
        scheduler.result(&id).is_some()
    }));
    assert_eq!(scheduler.status(&id), Some(TaskStatus::Suspended));
    assert_eq!(notifications.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.report_metrics().tasks_executed, 0);

    // Resume: the task runs to its real terminal state exactly once.
    scheduler.resume(&id).unwrap();
    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    assert_eq!(scheduler.status(&id), Some(TaskStatus::Completed));
    assert!(wait_for(Duration::from_secs(1), || {
        notifications.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.report_metrics().tasks_executed, 1);
    scheduler.stop();
}

#[test]
fn test_running_task_cannot_be_canceled() {
    let scheduler = OrbitalTaskScheduler::new();
    scheduler.start();

    let release = Arc::new(AtomicUsize::new(0));
    let gate = Arc::clone(&release);
    let id = scheduler
        .schedule(Task::new("long-haul", TaskType::Maintenance, move |_| {
            while gate.load(Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
            true
        }))
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        scheduler.status(&id) == Some(TaskStatus::Running)
    }));
    assert!(scheduler.cancel(&id).is_err());

    release.store(1, Ordering::SeqCst);
    assert!(wait_for_terminal(&scheduler, &id, Duration::from_secs(5)));
    scheduler.stop();
}
