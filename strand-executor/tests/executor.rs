//! Scenario tests for executor serialization, scheduling order and
//! graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand_executor::{EventExecutor, ExecutorError, ExecutorState};

#[test]
fn single_flight_under_concurrent_submission() {
    const THREADS: usize = 8;
    const TASKS_PER_THREAD: usize = 1250; // 10_000 total

    let _ = env_logger::builder().is_test(true).try_init();
    let executor = EventExecutor::builder().name("single-flight").build();
    let counter = Arc::new(AtomicUsize::new(0));
    let in_task = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));

    let submitters: Vec<_> = (0..THREADS)
        .map(|_| {
            let executor = executor.clone();
            let counter = counter.clone();
            let in_task = in_task.clone();
            let overlapped = overlapped.clone();
            thread::spawn(move || {
                for _ in 0..TASKS_PER_THREAD {
                    let counter = counter.clone();
                    let in_task = in_task.clone();
                    let overlapped = overlapped.clone();
                    executor
                        .execute(move || {
                            // Two tasks of one executor must never overlap.
                            if in_task.swap(true, Ordering::SeqCst) {
                                overlapped.store(true, Ordering::SeqCst);
                            }
                            let value = counter.load(Ordering::Relaxed);
                            counter.store(value + 1, Ordering::Relaxed);
                            in_task.store(false, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    executor
        .shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(30))
        .wait();

    assert!(!overlapped.load(Ordering::SeqCst), "tasks overlapped");
    assert_eq!(counter.load(Ordering::SeqCst), THREADS * TASKS_PER_THREAD);
}

#[test]
fn scheduled_tasks_run_in_deadline_order() {
    let executor = EventExecutor::builder().name("deadline-order").build();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Submitted in reverse deadline order on purpose.
    for (label, delay_ms) in [(3u8, 90u64), (2, 60), (1, 30)] {
        let order = order.clone();
        executor
            .schedule(Duration::from_millis(delay_ms), move || {
                order.lock().push(label);
            })
            .unwrap();
    }

    thread::sleep(Duration::from_millis(250));
    executor
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .wait();
    assert_eq!(order.lock().clone(), vec![1, 2, 3]);
}

#[test]
fn same_deadline_ties_break_by_submission_sequence() {
    let executor = EventExecutor::builder().build();
    let order = Arc::new(Mutex::new(Vec::new()));
    for label in 0..5u8 {
        let order = order.clone();
        executor
            .schedule(Duration::from_millis(50), move || {
                order.lock().push(label);
            })
            .unwrap();
    }
    thread::sleep(Duration::from_millis(150));
    executor
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .wait();
    assert_eq!(order.lock().clone(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn graceful_shutdown_terminates_and_rejects() {
    let executor = EventExecutor::builder().name("shutdown").build();
    executor.execute(|| {}).unwrap();

    let timeout = Duration::from_secs(10);
    let started = Instant::now();
    let termination = executor.shutdown_gracefully(Duration::ZERO, timeout);
    assert!(termination.wait_timeout(timeout).is_some());
    assert!(started.elapsed() < timeout);
    assert_eq!(executor.state(), ExecutorState::Terminated);

    assert!(matches!(
        executor.execute(|| {}),
        Err(ExecutorError::Rejected { .. })
    ));
    assert!(matches!(
        executor.schedule(Duration::ZERO, || {}),
        Err(ExecutorError::Rejected { .. })
    ));
}

#[test]
fn quiet_period_resets_on_new_arrivals() {
    let executor = EventExecutor::builder().build();
    executor.execute(|| {}).unwrap();
    executor.shutdown_gracefully(Duration::from_millis(100), Duration::from_secs(10));

    // Still draining: submissions are accepted and push termination out.
    let late = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let late = late.clone();
        executor
            .execute(move || {
                late.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
    }

    assert!(executor.await_termination(Duration::from_secs(10)));
    assert_eq!(late.load(Ordering::SeqCst), 3);
}
