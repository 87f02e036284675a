//! End-to-end tests of the public spawn API against the global pool.
//!
//! The global pool is never joined, so these tests keep their joins on the
//! fast path: each body signals completion and the test waits (plus a grace
//! period for the worker to pass the rendezvous) before joining. A parked
//! join would be correct too, but would permanently trade the harness
//! thread for a worker thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coriolis::{escaping_spawn, spawn};

/// Waits for `count` to reach `target`, then lets the worker side of each
/// rendezvous finish.
fn wait_for(count: &AtomicUsize, target: usize) {
    while count.load(Ordering::Acquire) < target {
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(50));
}

#[test]
fn returns_result_of_completed_work() {
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();

    let future = spawn(move || {
        counter.fetch_add(1, Ordering::Release);
        42
    });

    wait_for(&completed, 1);
    assert_eq!(future.join(), 42);
}

#[test]
fn many_spawns_sum_to_expected_total() {
    let completed = Arc::new(AtomicUsize::new(0));

    let futures: Vec<_> = (0..1000usize)
        .map(|i| {
            let counter = completed.clone();
            spawn(move || {
                counter.fetch_add(1, Ordering::Release);
                i
            })
        })
        .collect();

    wait_for(&completed, 1000);
    let total: usize = futures.into_iter().map(|future| future.join()).sum();
    assert_eq!(total, 999 * 1000 / 2);
}

#[test]
fn unit_body_joins_cleanly() {
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();

    let future = spawn(move || {
        counter.fetch_add(1, Ordering::Release);
    });

    wait_for(&completed, 1);
    future.join();
}

#[test]
fn escaping_future_joins_after_changing_holders() {
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();

    let future = escaping_spawn(move || {
        counter.fetch_add(1, Ordering::Release);
        "hello".to_string()
    });

    // Move the future to another holder and back before joining.
    let future = thread::spawn(move || future).join().unwrap();

    wait_for(&completed, 1);
    assert_eq!(future.join(), "hello");
}

#[test]
fn results_are_independent_across_frames() {
    let completed = Arc::new(AtomicUsize::new(0));

    let doubler = {
        let counter = completed.clone();
        spawn(move || {
            counter.fetch_add(1, Ordering::Release);
            2 * 21
        })
    };
    let texter = {
        let counter = completed.clone();
        spawn(move || {
            counter.fetch_add(1, Ordering::Release);
            String::from("ok")
        })
    };

    wait_for(&completed, 2);
    assert_eq!(texter.join(), "ok");
    assert_eq!(doubler.join(), 42);
}
