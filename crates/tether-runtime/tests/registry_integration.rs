//! Integration tests for the task registry
//!
//! Tests cover:
//! - Bounded drain with and without stragglers
//! - Straggler cancellation reaching the running work
//! - Lifetime-driven shutdown of tracked work
//! - Fault reporting through a custom hook

mod common;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tether_runtime::{
    AppLifetime, CancelSource, CancelToken, FaultHook, Lifetime, PoolConfig, TaskError,
    TaskHandle, TaskLabel, TaskRegistry, WorkerPool,
};

/// Dedicated pool so sleeping tasks never wait behind other tests
fn pool(threads: usize) -> WorkerPool {
    WorkerPool::new(PoolConfig::with_threads(threads))
}

/// Sleep for `duration` unless `token` fires first
fn sleep_or_cancel(token: &CancelToken, duration: Duration) -> Result<(), TaskError> {
    if token.wait_timeout(duration) {
        Err(TaskError::Cancelled)
    } else {
        Ok(())
    }
}

#[test]
fn test_drain_waits_for_all_finishing_tasks() {
    common::init_tracing();
    let registry = TaskRegistry::new();
    let pool = pool(3);

    for i in 0..3 {
        let name = format!("op-{}", i);
        let _ = registry.run_on(
            &pool,
            |token| sleep_or_cancel(&token, Duration::from_secs(2)),
            Some(name.as_str()),
            None,
            CancelToken::none(),
        );
    }
    assert_eq!(registry.len(), 3);

    let started = Instant::now();
    let report = registry.wait_for_all(Duration::from_secs(5));
    let elapsed = started.elapsed();

    assert!(report.is_clean(), "stragglers: {:?}", report.stragglers);
    assert_eq!(report.completed, 3);
    assert!(elapsed >= Duration::from_millis(1900));
    assert!(elapsed < Duration::from_millis(4500));
}

#[test]
fn test_drain_times_out_and_cancels_straggler() {
    let registry = TaskRegistry::new();
    let pool = pool(1);
    let observed_cancel = Arc::new(AtomicBool::new(false));

    let seen = observed_cancel.clone();
    let handle = registry.run_on(
        &pool,
        move |token| {
            let result = sleep_or_cancel(&token, Duration::from_secs(10));
            seen.store(result.is_err(), Ordering::SeqCst);
            result
        },
        Some("long-op"),
        None,
        CancelToken::none(),
    );

    let started = Instant::now();
    let report = registry.wait_for_all(Duration::from_secs(1));
    let elapsed = started.elapsed();

    assert_eq!(report.completed, 0);
    assert_eq!(
        report.stragglers.iter().map(ToString::to_string).collect::<Vec<_>>(),
        vec!["long-op".to_string()]
    );
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_secs(3));

    assert_eq!(handle.join(), Err(TaskError::Cancelled));
    assert!(observed_cancel.load(Ordering::SeqCst));
    assert!(common::eventually(|| registry.is_empty()));
}

#[test]
fn test_drain_returns_immediately_when_nothing_runs() {
    let registry = TaskRegistry::new();
    let _ = registry.submit(|_| TaskHandle::ready(1), Some("instant"), None, CancelToken::none());

    let started = Instant::now();
    let report = registry.wait_for_all(Duration::from_secs(10));
    assert!(report.is_clean());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_drain_ignores_tasks_submitted_later() {
    let registry = TaskRegistry::new();
    let pool = Arc::new(pool(2));
    let gate = CancelSource::new();

    let token = gate.token();
    let _ = registry.run_on(
        &pool,
        move |_| sleep_or_cancel(&token, Duration::from_secs(10)).or(Ok(())),
        Some("first"),
        None,
        CancelToken::none(),
    );

    let late = registry.clone();
    let late_pool = pool.clone();
    let releaser = gate.clone();
    let submitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let _ = late.run_on(
            &late_pool,
            |token| sleep_or_cancel(&token, Duration::from_secs(10)),
            Some("late"),
            None,
            CancelToken::none(),
        );
        releaser.cancel();
    });

    let report = registry.wait_for_all(Duration::from_secs(5));
    submitter.join().unwrap();

    assert!(report.is_clean());
    assert_eq!(report.completed, 1);
    assert!(common::eventually(|| registry.tracked().len() == 1));
    assert_eq!(registry.tracked()[0].name.as_deref(), Some("late"));

    let report = registry.wait_for_all(Duration::from_millis(10));
    assert_eq!(report.stragglers.len(), 1);
}

#[test]
fn test_drain_skips_tasks_already_finished() {
    let registry = TaskRegistry::new();
    let (handle, completer) = TaskHandle::<()>::pair();
    let mut slot = Some(handle);
    let handle = registry.submit(
        |_| slot.take().unwrap_or_else(|| TaskHandle::ready(())),
        Some("done-early"),
        None,
        CancelToken::none(),
    );
    completer.complete(());

    let report = registry.wait_for_all(Duration::from_secs(5));
    assert!(report.is_clean());
    assert_eq!(report.completed, 0);
    assert_eq!(handle.join(), Ok(()));
}

#[test]
fn test_lifetime_stop_cancels_tracked_work() {
    let registry = TaskRegistry::new();
    let pool = pool(4);
    let lifetime = AppLifetime::new();
    lifetime.notify_started();
    let cancelled = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let cancelled = cancelled.clone();
            let name = format!("worker-{}", i);
            registry.run_on(
                &pool,
                move |token| {
                    let result = sleep_or_cancel(&token, Duration::from_secs(10));
                    if result.is_err() {
                        cancelled.fetch_add(1, Ordering::SeqCst);
                    }
                    result
                },
                Some(name.as_str()),
                Some(&lifetime),
                CancelToken::none(),
            )
        })
        .collect();

    // Every task is parked in its wait before the stop request
    thread::sleep(Duration::from_millis(100));
    lifetime.request_stop();

    // Some tasks may finish before the drain starts, so only the bound is fixed
    let report = registry.wait_for_all(Duration::from_secs(5));
    assert!(report.is_clean());
    assert!(report.completed <= 4);
    for handle in handles {
        assert_eq!(handle.join(), Err(TaskError::Cancelled));
    }
    assert_eq!(cancelled.load(Ordering::SeqCst), 4);
    assert!(common::eventually(|| registry.is_empty()));
    lifetime.notify_stopped();
}

#[derive(Default)]
struct CountingHook {
    names: Mutex<Vec<String>>,
}

impl FaultHook for CountingHook {
    fn on_fault(&self, task: &TaskLabel, _error: &TaskError) {
        self.names.lock().push(task.to_string());
    }
}

#[test]
fn test_only_faults_reach_the_hook() {
    let hook = Arc::new(CountingHook::default());
    let registry = TaskRegistry::with_fault_hook(hook.clone());
    let source = CancelSource::new();

    let _ = registry.run(|_| Ok(()), Some("ok"), None, CancelToken::none());
    let _ = registry.run::<(), _>(|_| panic!("exploded"), Some("panics"), None, CancelToken::none());
    let _ = registry.run(
        |token| sleep_or_cancel(&token, Duration::from_secs(10)),
        Some("cancelled"),
        None,
        source.token(),
    );
    source.cancel();

    let report = registry.wait_for_all(Duration::from_secs(5));
    assert!(report.is_clean());
    assert!(common::eventually(|| registry.is_empty()));
    assert_eq!(*hook.names.lock(), vec!["panics".to_string()]);
}

#[test]
fn test_global_registry_is_shared() {
    let a = TaskRegistry::global();
    let b = TaskRegistry::global();
    assert!(std::ptr::eq(a, b));

    let handle = a.run(|_| Ok(5), Some("global-op"), None, CancelToken::none());
    assert_eq!(handle.join(), Ok(5));
}
