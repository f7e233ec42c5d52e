//! End-to-end scenarios through the public API.

use std::sync::Arc;
use std::time::Duration;

use taskweave::runtime::scheduler::LocalContext;
use taskweave::runtime::{CollectingSink, LockManager};
use taskweave::{AwaitError, Promise, Scheduler, Step, TaskPriority};

#[test]
fn basic_round_trip() {
    let scheduler = Scheduler::new().unwrap();
    let answer = scheduler.schedule(|| 21 * 2).unwrap();
    assert_eq!(answer.wait().unwrap(), 42);
}

#[test]
fn suspend_resume_frees_the_only_worker() {
    let scheduler = Scheduler::builder().workers(1, 1).build().unwrap();
    let promise = Promise::<String>::new();
    let awaited = promise.future();

    let greeting = scheduler
        .schedule_with(TaskPriority::Normal, move |cx| {
            cx.await_on(&awaited, |name, _| match name {
                Ok(name) => Step::Ready(format!("hello, {}", name)),
                Err(err) => err.into(),
            })
        })
        .unwrap();

    // While the first task is parked, the single worker serves others.
    for i in 0..10u32 {
        let f = scheduler.schedule(move || i * i).unwrap();
        assert_eq!(f.wait_timeout(Duration::from_secs(2)).unwrap(), i * i);
    }

    promise.complete("world".to_string());
    assert_eq!(
        greeting.wait_timeout(Duration::from_secs(2)).unwrap(),
        "hello, world"
    );
}

#[test]
fn ordered_locks_opposite_request_orders() {
    let manager = LockManager::<u32>::ordered();
    manager.register(1).unwrap();
    manager.register(2).unwrap();

    let scheduler = Scheduler::builder().workers(2, 2).build().unwrap();
    let mut futures = Vec::new();
    for keys in [[1u32, 2], [2, 1]] {
        let manager = manager.clone();
        futures.push(
            scheduler
                .schedule(move || {
                    for _ in 0..200 {
                        let handle = manager.acquire_all(&keys).unwrap();
                        assert_eq!(handle.keys(), vec![1, 2]);
                    }
                })
                .unwrap(),
        );
    }
    let all = scheduler.when_all(futures).unwrap();
    all.wait_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(manager.stats().acquisitions, 400);
}

#[test]
fn pipeline_of_dependent_tasks() {
    let scheduler = Scheduler::builder().workers(1, 4).build().unwrap();
    let parse = scheduler.schedule(|| 17i64).unwrap();
    let doubled = scheduler
        .then(&parse, |n| Step::from(n.map(|n| n * 2)))
        .unwrap();
    let described = scheduler
        .then(&doubled, |n| Step::from(n.map(|n| format!("n = {}", n))))
        .unwrap();
    assert_eq!(described.wait().unwrap(), "n = 34");
}

#[test]
fn local_context_receives_results() {
    let scheduler = Scheduler::builder().workers(1, 2).build().unwrap();
    let ui = LocalContext::new();
    let ui_target = ui.target();

    let computed = scheduler.schedule(|| (1..=10u64).product::<u64>()).unwrap();
    let shown = scheduler
        .schedule_with(TaskPriority::Normal, move |cx| {
            cx.await_on_context(&computed, ui_target, |value, _| {
                Step::from(value.map(|v| (v, std::thread::current().id())))
            })
        })
        .unwrap();

    let (value, thread) = ui.block_on(&shown).unwrap();
    assert_eq!(value, 3_628_800);
    assert_eq!(thread, std::thread::current().id());
}

#[test]
fn dropped_fault_is_reported_once() {
    let sink = Arc::new(CollectingSink::new());
    let scheduler = Scheduler::builder()
        .workers(1, 1)
        .diagnostics(sink.clone())
        .build()
        .unwrap();

    let observed = scheduler.schedule(|| -> u8 { panic!("seen") }).unwrap();
    assert!(matches!(observed.wait(), Err(AwaitError::Faulted(_))));

    let ignored = scheduler.schedule(|| -> u8 { panic!("unseen") }).unwrap();
    while !ignored.is_terminal() {
        std::thread::sleep(Duration::from_millis(1));
    }
    drop(ignored);
    drop(observed);
    scheduler.shutdown();

    assert_eq!(sink.unobserved_faults(), 1);
}
