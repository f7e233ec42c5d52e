//! Cooperative cancellation across awaits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskweave::{AwaitError, Promise, Scheduler, Step, TaskPriority};

#[test]
fn canceled_within_one_checkpoint_interval() {
    let scheduler = Scheduler::builder().workers(1, 4).build().unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();

    let long_running = scheduler
        .schedule_with(TaskPriority::Normal, move |cx| {
            for _ in 0..100_000 {
                if let Err(canceled) = cx.checkpoint() {
                    return Step::<u64>::from(canceled);
                }
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
            }
            Step::Ready(0)
        })
        .unwrap();

    // Two dependents suspended on the long-running task.
    let dependents: Vec<_> = (0..2)
        .map(|_| {
            scheduler
                .then(&long_running, |result| {
                    Step::Ready(matches!(result, Err(AwaitError::Canceled)))
                })
                .unwrap()
        })
        .collect();

    while ticks.load(Ordering::SeqCst) < 5 {
        std::thread::sleep(Duration::from_millis(1));
    }
    let before = ticks.load(Ordering::SeqCst);
    let requested = Instant::now();
    long_running.cancel();

    assert!(matches!(long_running.wait(), Err(AwaitError::Canceled)));
    assert!(requested.elapsed() < Duration::from_millis(500));
    // At most the iteration in flight finished after the request.
    assert!(ticks.load(Ordering::SeqCst) <= before + 2);

    for dependent in dependents {
        assert!(dependent.wait_timeout(Duration::from_secs(2)).unwrap());
    }
}

#[test]
fn cancellation_reaches_awaiters_of_a_promise() {
    let scheduler = Scheduler::builder().workers(1, 2).build().unwrap();
    let promise = Promise::<u32>::new();
    let source = promise.future();

    let awaiter = scheduler
        .schedule_with(TaskPriority::Normal, move |cx| {
            cx.await_on(&source, |result, _| match result {
                Ok(v) => Step::Ready(v),
                Err(err) => err.into(),
            })
        })
        .unwrap();

    // The producer honours the request by canceling its promise.
    promise.future().cancel();
    assert!(promise.is_cancel_requested());
    promise.cancel();

    assert!(matches!(
        awaiter.wait_timeout(Duration::from_secs(2)),
        Err(AwaitError::Canceled)
    ));
}

#[test]
fn work_that_never_checks_runs_to_completion() {
    let scheduler = Scheduler::builder().workers(1, 1).build().unwrap();
    let (started_tx, started_rx) = crossbeam::channel::bounded(1);
    let stubborn = scheduler
        .schedule(move || {
            started_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(30));
            7u32
        })
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    stubborn.cancel();
    assert_eq!(stubborn.wait().unwrap(), 7);
}
