//! Randomized contention on the lock manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use taskweave::runtime::lock::BackoffPolicy;
use taskweave::{LockError, LockManager, LockStrategy};

const RESOURCES: u32 = 8;

fn manager(strategy: LockStrategy) -> LockManager<u32> {
    let manager = LockManager::new(strategy);
    for key in 0..RESOURCES {
        manager.register(key).unwrap();
    }
    manager
}

/// Each requester repeatedly takes a random subset in random order and
/// checks it is alone on each resource.
fn hammer(
    manager: LockManager<u32>,
    requesters: usize,
    rounds: usize,
) {
    let owners: Arc<Vec<AtomicBool>> =
        Arc::new((0..RESOURCES).map(|_| AtomicBool::new(false)).collect());
    let barrier = Arc::new(Barrier::new(requesters));

    let threads: Vec<_> = (0..requesters)
        .map(|_| {
            let manager = manager.clone();
            let owners = owners.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                let mut keys: Vec<u32> = (0..RESOURCES).collect();
                barrier.wait();
                for _ in 0..rounds {
                    keys.shuffle(&mut rng);
                    let take = rng.random_range(1..=4);
                    let subset = &keys[..take];

                    let handle = manager.acquire_all(subset).unwrap();
                    for key in subset {
                        let was = owners[*key as usize].swap(true, Ordering::SeqCst);
                        assert!(!was, "resource {} granted twice", key);
                    }
                    if rng.random_bool(0.3) {
                        thread::yield_now();
                    }
                    for key in subset {
                        owners[*key as usize].store(false, Ordering::SeqCst);
                    }
                    drop(handle);
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn ordered_strategy_never_deadlocks() {
    let manager = manager(LockStrategy::Ordered);
    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    let stressed = manager.clone();
    thread::spawn(move || {
        hammer(stressed, 8, 300);
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(60))
        .expect("ordered stress test deadlocked");
    let stats = manager.stats();
    assert_eq!(stats.acquisitions, 8 * 300);
    assert_eq!(stats.acquisitions, stats.releases);
    assert_eq!(stats.timeouts, 0);
}

#[test]
fn backoff_strategy_makes_progress() {
    let policy = BackoffPolicy {
        per_resource_timeout: Duration::from_millis(1),
        initial_backoff: Duration::from_micros(200),
        max_backoff: Duration::from_millis(5),
        jitter: true,
    };
    let manager = manager(LockStrategy::Backoff(policy));
    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    let stressed = manager.clone();
    thread::spawn(move || {
        hammer(stressed, 8, 150);
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(60))
        .expect("backoff stress test made no progress");
    assert_eq!(manager.stats().acquisitions, 8 * 150);
}

#[test]
fn timeout_is_retryable_and_leaves_nothing_held() {
    let manager = manager(LockStrategy::Ordered);
    let blocker = manager.acquire_all(&[5]).unwrap();

    let other = manager.clone();
    let err = thread::spawn(move || {
        other
            .acquire_all_timeout(&[1, 2, 5], Duration::from_millis(20))
            .map(|_| ())
    })
    .join()
    .unwrap()
    .unwrap_err();
    assert!(err.is_retryable());
    for key in [1, 2] {
        assert!(!manager.is_held(&key).unwrap());
    }

    drop(blocker);
    let retried = manager.acquire_all_timeout(&[1, 2, 5], Duration::from_millis(20));
    assert!(retried.is_ok());
}

#[test]
fn unknown_resource_is_never_retried() {
    let manager = manager(LockStrategy::Backoff(BackoffPolicy::default()));
    let err = manager.acquire_all(&[1, 42]).unwrap_err();
    assert_eq!(err, LockError::UnknownResource("42".to_string()));
    assert_eq!(manager.stats().retries, 0);
}
