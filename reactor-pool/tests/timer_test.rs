use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reactor_pool::{DispatchPolicy, PoolConfig, PoolError, ServiceSelector, ThreadPool};

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn timer_fires_until_callback_declines() {
    let mut pool = ThreadPool::with_config(PoolConfig::new(1).with_name("timer"));
    pool.start(DispatchPolicy::Random).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let timer = pool
        .schedule(Duration::from_millis(10), move || {
            // Continue three times, decline on the fourth invocation.
            counter.fetch_add(1, Ordering::SeqCst) + 1 < 4
        })
        .unwrap();

    wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 4);

    // Inert afterwards: no fifth invocation arrives.
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert!(!timer.is_cancelled());
    pool.stop();
}

#[test]
fn cancel_before_first_fire_suppresses_the_callback() {
    let mut pool = ThreadPool::new(1);
    pool.start(DispatchPolicy::Random).unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let timer = pool
        .schedule(Duration::from_millis(150), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
    timer.cancel();
    assert!(timer.is_cancelled());

    std::thread::sleep(Duration::from_millis(400));
    assert!(!fired.load(Ordering::SeqCst));
    pool.stop();
}

#[test]
fn void_callback_reschedules_until_cancelled() {
    let mut pool = ThreadPool::new(1);
    pool.start(DispatchPolicy::Random).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let timer = pool
        .schedule(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) >= 3);
    timer.cancel();
    let at_cancel = hits.load(Ordering::SeqCst);

    // At most one invocation already in flight may still land.
    std::thread::sleep(Duration::from_millis(100));
    assert!(hits.load(Ordering::SeqCst) <= at_cancel + 1);
    pool.stop();
}

#[test]
fn stop_cancels_outstanding_timers_promptly() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);

    let mut pool = ThreadPool::new(1);
    pool.start(DispatchPolicy::Random).unwrap();
    pool.schedule(Duration::from_secs(10), move || {
        flag.store(true, Ordering::SeqCst);
        true
    })
    .unwrap();

    let begun = Instant::now();
    pool.stop();
    assert!(begun.elapsed() < Duration::from_secs(2), "stop must not wait out the delay");
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn timer_callback_runs_on_its_bound_service() {
    let mut pool = ThreadPool::with_config(PoolConfig::new(2).with_services(2).with_name("bound"));
    pool.start(DispatchPolicy::PerCore).unwrap();

    // Learn which thread serves service 1.
    let (tx, rx) = flume::bounded(1);
    pool.post_to(ServiceSelector::Index(1), move || {
        let _ = tx.send(std::thread::current().id());
    })
    .unwrap();
    let service_thread = rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let (tx, rx) = flume::bounded(1);
    pool.schedule_on(ServiceSelector::Index(1), Duration::from_millis(10), move || {
        let _ = tx.send(std::thread::current().id());
        false
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), service_thread);
    pool.stop();
}

#[test]
fn schedule_with_bad_selector_fails_fast() {
    let mut pool = ThreadPool::with_config(PoolConfig::new(1).with_services(2));
    pool.start(DispatchPolicy::Random).unwrap();

    let result = pool.schedule_on(ServiceSelector::Index(9), Duration::from_millis(10), || false);
    assert!(matches!(
        result,
        Err(PoolError::ServiceOutOfRange { index: 9, count: 2 })
    ));
    pool.stop();
}

#[test]
fn cloned_handles_share_cancellation() {
    let mut pool = ThreadPool::new(1);
    pool.start(DispatchPolicy::Random).unwrap();

    let timer = pool.schedule(Duration::from_secs(5), || true).unwrap();
    let clone = timer.clone();
    clone.cancel();
    assert!(timer.is_cancelled());
    pool.stop();
}
